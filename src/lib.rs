//! rtc-helper - WebRTC session orchestration
//!
//! Negotiates push (local media to a remote sink) and pull (remote media to a
//! local sink) sessions over SDP offer/answer with trickle or bulk ICE, keeps
//! at most one live connection per session id, and samples send-side
//! statistics on demand.

pub mod config;
pub mod engine;
pub mod media;
pub mod session;
pub mod stats;

// Re-exports
pub use config::{Config, IceServerConfig};
pub use engine::{
    AudioTrack, BitrateBounds, ConnectionState, EngineContext, MediaEngine, MediaKind, MediaTrack, VideoTrack,
};
pub use media::TrackCache;
pub use session::{Connection, LocalMedia, SessionCallbacks, SessionDefaults, SessionRegistry, WebRTCError};
pub use stats::{AudioStats, VideoStats};
