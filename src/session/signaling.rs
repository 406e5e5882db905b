//! Signaling payloads
//!
//! The orchestrator does not carry SDP or ICE between peers; it only defines
//! how they are packaged:
//! - trickle: one JSON object per candidate (`sdpMid`, `sdpMLineIndex`,
//!   `candidate`), with an empty string meaning gathering is complete
//! - bulk: gathered candidates appended to the SDP as `a=<candidate>` lines

use super::WebRTCError;
use crate::engine::IceCandidate;

/// Trickle payload that marks the end of candidate gathering
pub const ICE_COMPLETE_SENTINEL: &str = "";

/// Serialize a candidate for the trickle channel
pub fn encode_candidate(candidate: &IceCandidate) -> Result<String, WebRTCError> {
    serde_json::to_string(candidate)
        .map_err(|e| WebRTCError::InvalidArgument(format!("Failed to serialize ICE candidate: {}", e)))
}

/// Parse a trickle payload. `Ok(None)` is the completion sentinel.
pub fn decode_candidate(payload: &str) -> Result<Option<IceCandidate>, WebRTCError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|e| WebRTCError::InvalidArgument(format!("Invalid ICE candidate payload: {}", e)))
}

/// Append gathered candidates to a session description, one `a=` line each
pub fn embed_candidates(sdp: &str, candidates: &[IceCandidate]) -> String {
    let mut out = String::with_capacity(sdp.len() + candidates.len() * 96);
    out.push_str(sdp);
    for candidate in candidates {
        out.push_str("a=");
        out.push_str(&candidate.candidate);
        out.push('\n');
    }
    out
}

/// Candidate strings carried as `a=candidate` lines, in order
pub fn extract_candidates(sdp: &str) -> Vec<String> {
    sdp.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| line.starts_with("a=candidate"))
        .map(|line| line["a=".len()..].to_string())
        .collect()
}
