//! WebRTC session orchestration
//!
//! This module provides:
//! - Connection: one negotiated peer session and its state machine
//! - Push/pull offer/answer flows
//! - The process-wide session registry
//! - ICE payload packaging for signaling

pub mod connection;
pub mod negotiation;
pub mod registry;
pub mod signaling;

pub use connection::Connection;
pub use negotiation::LocalMedia;
pub use registry::{SessionCallbacks, SessionDefaults, SessionRegistry};

use crate::engine::EngineError;
use std::error::Error;
use std::fmt;

/// Session-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRTCError {
    /// The media engine refused to create a transport
    EngineCreate(String),
    /// Offer/answer generation or description application failed
    Negotiation(String),
    /// Caller supplied unusable input
    InvalidArgument(String),
    /// A pending operation was unblocked because the connection was disposed
    Cancelled(String),
    /// Session not found
    SessionNotFound(String),
    /// Feature not enabled
    FeatureDisabled,
}

impl WebRTCError {
    pub(crate) fn negotiation(id: &str, what: &str, err: impl fmt::Display) -> Self {
        WebRTCError::Negotiation(format!("{} {}: {}", id, what, err))
    }
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::EngineCreate(msg) => write!(f, "Engine create failed: {}", msg),
            WebRTCError::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            WebRTCError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            WebRTCError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            WebRTCError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            WebRTCError::FeatureDisabled => write!(f, "WebRTC streaming feature is not enabled"),
        }
    }
}

impl Error for WebRTCError {}

impl From<EngineError> for WebRTCError {
    fn from(err: EngineError) -> Self {
        WebRTCError::EngineCreate(err.to_string())
    }
}
