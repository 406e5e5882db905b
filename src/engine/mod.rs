//! Media engine capability
//!
//! The orchestrator never talks to a concrete WebRTC stack directly. It asks
//! a [`MediaEngine`] for transports and tracks, and receives everything the
//! engine discovers on its own threads as [`EngineEvent`]s pushed into an
//! [`EngineEvents`] sink.

pub mod context;
#[cfg(feature = "webrtc-streaming")]
pub mod rtc;
#[cfg(test)]
pub(crate) mod fake;

pub use context::EngineContext;

use crate::config::IceServerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction requested when generating a local description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SendOnly,
    ReceiveOnly,
    SendReceive,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SendOnly => "sendonly",
            Role::ReceiveOnly => "receiveonly",
            Role::SendReceive => "sendreceive",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// A session description as produced or consumed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// One ICE candidate, in the shape used on the signaling wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid", default, deserialize_with = "null_as_default")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex", default, deserialize_with = "null_as_default")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

/// Browsers send `null` for an unknown mid or m-line index
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }
}

/// Transport state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Send-side bitrate bounds in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateBounds {
    pub min: u32,
    pub current: u32,
    pub max: u32,
}

impl Default for BitrateBounds {
    fn default() -> Self {
        Self {
            min: 1_000_000,
            current: 2_000_000,
            max: 4_000_000,
        }
    }
}

/// Opaque handle to an engine-owned track object
pub type TrackHandle = Arc<dyn Any + Send + Sync>;

macro_rules! track_type {
    ($name:ident, $kind:expr) => {
        /// Shared reference to an engine track. The engine (or the capture
        /// side that produced it) owns the underlying object.
        #[derive(Clone)]
        pub struct $name {
            id: String,
            handle: TrackHandle,
        }

        impl $name {
            pub fn new(id: impl Into<String>, handle: TrackHandle) -> Self {
                Self { id: id.into(), handle }
            }

            pub fn id(&self) -> &str {
                &self.id
            }

            pub fn kind(&self) -> MediaKind {
                $kind
            }

            pub fn handle(&self) -> &TrackHandle {
                &self.handle
            }

            /// Downcast the engine handle to its concrete type
            pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
                self.handle.clone().downcast::<T>().ok()
            }

            pub fn downgrade(&self) -> WeakTrack {
                WeakTrack {
                    id: self.id.clone(),
                    kind: $kind,
                    handle: Arc::downgrade(&self.handle),
                }
            }

            pub fn same_track(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.handle, &other.handle)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).field("id", &self.id).finish()
            }
        }
    };
}

track_type!(AudioTrack, MediaKind::Audio);
track_type!(VideoTrack, MediaKind::Video);

/// A track of either kind
#[derive(Debug, Clone)]
pub enum MediaTrack {
    Audio(AudioTrack),
    Video(VideoTrack),
}

impl MediaTrack {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaTrack::Audio(_) => MediaKind::Audio,
            MediaTrack::Video(_) => MediaKind::Video,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MediaTrack::Audio(track) => track.id(),
            MediaTrack::Video(track) => track.id(),
        }
    }

    pub fn handle(&self) -> &TrackHandle {
        match self {
            MediaTrack::Audio(track) => track.handle(),
            MediaTrack::Video(track) => track.handle(),
        }
    }

    pub fn downgrade(&self) -> WeakTrack {
        match self {
            MediaTrack::Audio(track) => track.downgrade(),
            MediaTrack::Video(track) => track.downgrade(),
        }
    }
}

impl From<AudioTrack> for MediaTrack {
    fn from(track: AudioTrack) -> Self {
        MediaTrack::Audio(track)
    }
}

impl From<VideoTrack> for MediaTrack {
    fn from(track: VideoTrack) -> Self {
        MediaTrack::Video(track)
    }
}

/// Non-owning reference to a local track.
///
/// Dies with the last strong reference held by the producer or the engine.
#[derive(Debug, Clone)]
pub struct WeakTrack {
    id: String,
    kind: MediaKind,
    handle: Weak<dyn Any + Send + Sync>,
}

impl WeakTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<MediaTrack> {
        let handle = self.handle.upgrade()?;
        Some(match self.kind {
            MediaKind::Audio => MediaTrack::Audio(AudioTrack::new(self.id.clone(), handle)),
            MediaKind::Video => MediaTrack::Video(VideoTrack::new(self.id.clone(), handle)),
        })
    }
}

/// Raw cumulative counters for one media kind, as read from the engine.
///
/// Every counter is monotonically increasing for the life of a stream unless
/// the engine resets it. Absent values were not reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCounters {
    /// Report time in milliseconds
    pub timestamp_ms: f64,
    pub bytes_sent: Option<u64>,
    pub packets_sent: Option<u64>,
    pub packets_lost: Option<i64>,
    pub rtt_ms: Option<u32>,
    /// Linear sample magnitude, 0..=32767
    pub audio_input_level: Option<i32>,
    pub total_audio_energy: Option<f64>,
    pub total_samples_duration: Option<f64>,
    pub frame_width_input: Option<u32>,
    pub frame_height_input: Option<u32>,
    pub frame_rate_input: Option<u32>,
    pub frame_width_sent: Option<u32>,
    pub frame_height_sent: Option<u32>,
    pub frame_rate_sent: Option<u32>,
    pub avg_encode_ms: Option<u32>,
}

/// Notifications the engine delivers for one transport
#[derive(Debug, Clone)]
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    IceGatheringComplete,
    ConnectionState(ConnectionState),
    RemoteTrack(MediaTrack),
}

/// Sink the engine pushes [`EngineEvent`]s into. Safe to use from any thread.
#[derive(Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Events sent after the owner went away are dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Per-transport settings handed to the engine at creation
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

/// Raw PCM frames observed on the local capture path
#[derive(Debug)]
pub struct AudioSamples<'a> {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: &'a [i16],
}

pub type AudioSampleTap = Arc<dyn Fn(&AudioSamples<'_>) + Send + Sync>;

/// Failure reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn unsupported(capability: &str) -> Self {
        Self::new(format!("{} is not supported by this media engine", capability))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Process-wide media engine: creates transports and local tracks
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a transport that reports its events into `events`
    async fn create_transport(
        &self,
        config: TransportConfig,
        events: EngineEvents,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Create a local track the engine can send
    fn create_track(&self, kind: MediaKind, id: &str) -> Result<MediaTrack, EngineError>;

    /// Install (or with `None`, remove) a tap on raw local audio samples
    fn set_audio_sample_tap(&self, _tap: Option<AudioSampleTap>) -> Result<(), EngineError> {
        Err(EngineError::unsupported("audio sample tap"))
    }

    /// Release engine-wide resources
    fn shutdown(&self) {}
}

/// One negotiated transport inside the engine
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn set_bitrate(&self, bounds: BitrateBounds);

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError>;

    /// Unbind the local `kind` track `id` and stop sending it. Unknown
    /// tracks are ignored.
    async fn remove_track(&self, kind: MediaKind, id: &str) -> Result<(), EngineError>;

    async fn create_offer(&self, role: Role) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self, role: Role) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Current counters of the outbound stream of `kind`, if one exists
    async fn stats(&self, kind: MediaKind) -> Option<RawCounters>;

    /// Release the transport. Must not block.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_candidate_uses_wire_field_names() {
        let candidate = IceCandidate::new("0", 0, "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
        assert!(json.contains("\"candidate\""));
    }

    #[test]
    fn weak_track_dies_with_producer() {
        let track = VideoTrack::new("cam", Arc::new(()) as TrackHandle);
        let weak = track.downgrade();
        assert!(weak.is_alive());
        assert_eq!(weak.kind(), MediaKind::Video);
        assert!(matches!(weak.upgrade(), Some(MediaTrack::Video(_))));
        drop(track);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn audio_tap_sees_samples_until_removed() {
        let engine = fake::FakeEngine::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .set_audio_sample_tap(Some(Arc::new(move |samples: &AudioSamples<'_>| {
                sink.lock().push((samples.sample_rate, samples.data.len()));
            })))
            .unwrap();

        assert!(engine.feed_audio(&[0, 120, -120, 0]));
        engine.set_audio_sample_tap(None).unwrap();
        assert!(!engine.feed_audio(&[0; 480]));
        assert_eq!(*seen.lock(), vec![(48_000, 4)]);
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::SendOnly.as_str(), "sendonly");
        assert_eq!(Role::ReceiveOnly.to_string(), "receiveonly");
    }
}
