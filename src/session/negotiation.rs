//! Push/pull offer-answer flows
//!
//! Push sends local media to a remote sink, pull receives remote media into
//! a local sink. Each has a local-initiated variant (we offer, the caller's
//! `exchange` returns the remote answer) and a remote-initiated variant (the
//! caller hands us the remote offer, we return the answer).
//!
//! Push flows wait for local gathering and embed every candidate in the SDP
//! they hand out. Pull flows never wait; their candidates trickle through
//! the connection's `on_ice` hook.

use super::signaling::embed_candidates;
use super::{Connection, WebRTCError};
use crate::engine::{AudioTrack, Role, SdpType, VideoTrack};
use log::info;
use std::fmt;
use std::future::Future;

/// Local tracks offered by a push flow
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<AudioTrack>,
    pub video: Option<VideoTrack>,
}

impl LocalMedia {
    pub fn new(audio: Option<AudioTrack>, video: Option<VideoTrack>) -> Self {
        Self { audio, video }
    }

    pub fn audio(track: AudioTrack) -> Self {
        Self::new(Some(track), None)
    }

    pub fn video(track: VideoTrack) -> Self {
        Self::new(None, Some(track))
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// A push needs at least one media kind
    pub fn ensure_present(&self) -> Result<(), WebRTCError> {
        if self.is_empty() {
            return Err(WebRTCError::InvalidArgument(
                "push requires a local audio or video track".to_string(),
            ));
        }
        Ok(())
    }
}

async fn bind(conn: &Connection, media: &LocalMedia) -> Result<(), WebRTCError> {
    media.ensure_present()?;
    if let Some(video) = &media.video {
        conn.add_track(video.clone()).await?;
    }
    if let Some(audio) = &media.audio {
        conn.add_track(audio.clone()).await?;
    }
    Ok(())
}

/// Push, local-initiated: offer with embedded candidates, apply the answer
/// returned by `exchange`.
pub async fn push_with_local_offer<F, Fut, E>(
    conn: &Connection,
    media: &LocalMedia,
    exchange: F,
) -> Result<(), WebRTCError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: fmt::Display,
{
    bind(conn, media).await?;
    let offer = conn.create_offer(Role::SendOnly).await?;
    let candidates = conn.wait_ice_complete().await?;
    info!("Session {} offering {} candidates", conn.id(), candidates.len());
    let answer = conn
        .cancellable("remote answer", exchange(embed_candidates(&offer, &candidates)))
        .await?;
    conn.set_remote_description(&answer, SdpType::Answer).await
}

/// Push, remote-initiated: apply the remote offer and return our answer with
/// embedded candidates.
pub async fn push_with_remote_offer(
    conn: &Connection,
    media: &LocalMedia,
    offer: &str,
) -> Result<String, WebRTCError> {
    bind(conn, media).await?;
    conn.set_remote_description(offer, SdpType::Offer).await?;
    let answer = conn.create_answer(Role::SendOnly).await?;
    let candidates = conn.wait_ice_complete().await?;
    info!("Session {} answering with {} candidates", conn.id(), candidates.len());
    Ok(embed_candidates(&answer, &candidates))
}

/// Pull, local-initiated: receive-only offer, apply the answer returned by
/// `exchange`.
pub async fn pull_with_local_offer<F, Fut, E>(conn: &Connection, exchange: F) -> Result<(), WebRTCError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: fmt::Display,
{
    let offer = conn.create_offer(Role::ReceiveOnly).await?;
    let answer = conn.cancellable("remote answer", exchange(offer)).await?;
    conn.set_remote_description(&answer, SdpType::Answer).await
}

/// Pull, remote-initiated: apply the remote offer and return a receive-only
/// answer.
pub async fn pull_with_remote_offer(conn: &Connection, offer: &str) -> Result<String, WebRTCError> {
    conn.set_remote_description(offer, SdpType::Offer).await?;
    conn.create_answer(Role::ReceiveOnly).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{audio_track, candidate, video_track, FakeEngine, FakeScript};
    use crate::engine::BitrateBounds;
    use crate::session::signaling::extract_candidates;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    const REMOTE_SDP: &str = "v=0\r\no=- 77 2 IN IP4 10.0.0.9\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

    fn gathering(n: u16) -> FakeScript {
        FakeScript {
            auto_gather: Some((1..=n).map(candidate).collect()),
            ..Default::default()
        }
    }

    async fn open(engine: &FakeEngine) -> Arc<Connection> {
        Connection::create("s1", engine, Vec::new(), BitrateBounds::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn local_push_embeds_gathered_candidates() {
        let engine = FakeEngine::with_script(gathering(3));
        let conn = open(&engine).await;
        let offered = Arc::new(Mutex::new(String::new()));
        let seen = offered.clone();

        push_with_local_offer(&conn, &LocalMedia::video(video_track("cam")), |offer| async move {
            *seen.lock() = offer;
            Ok::<_, WebRTCError>(REMOTE_SDP.to_string())
        })
        .await
        .unwrap();

        let offer = offered.lock().clone();
        assert!(offer.contains("a=sendonly"));
        assert_eq!(extract_candidates(&offer).len(), 3);
        let calls = engine.last_transport().unwrap().calls();
        assert_eq!(
            calls,
            vec![
                "add_track:video:cam".to_string(),
                "create_offer:sendonly".to_string(),
                "set_local:offer".to_string(),
                "set_remote:answer".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn remote_push_answers_with_candidates() {
        let engine = FakeEngine::with_script(gathering(2));
        let conn = open(&engine).await;
        let media = LocalMedia::new(Some(audio_track("mic")), Some(video_track("cam")));

        let answer = push_with_remote_offer(&conn, &media, REMOTE_SDP).await.unwrap();

        assert!(answer.contains("a=sendonly"));
        assert_eq!(extract_candidates(&answer), vec![candidate(1).candidate, candidate(2).candidate]);
        let calls = engine.last_transport().unwrap().calls();
        assert_eq!(&calls[..3], &["add_track:video:cam", "add_track:audio:mic", "set_remote:offer"]);
    }

    #[tokio::test]
    async fn push_without_media_touches_nothing() {
        let engine = FakeEngine::new();
        let conn = open(&engine).await;
        let result = push_with_remote_offer(&conn, &LocalMedia::default(), REMOTE_SDP).await;
        assert!(matches!(result, Err(WebRTCError::InvalidArgument(_))));
        assert!(engine.last_transport().unwrap().calls().is_empty());
    }

    #[tokio::test]
    async fn local_pull_does_not_wait_for_gathering() {
        // No gathering script: a wait would never finish
        let engine = FakeEngine::new();
        let conn = open(&engine).await;
        tokio::time::timeout(
            Duration::from_secs(1),
            pull_with_local_offer(&conn, |offer| async move {
                assert!(extract_candidates(&offer).is_empty());
                Ok::<_, WebRTCError>(REMOTE_SDP.to_string())
            }),
        )
        .await
        .unwrap()
        .unwrap();
        let calls = engine.last_transport().unwrap().calls();
        assert_eq!(calls[0], "create_offer:receiveonly");
    }

    #[tokio::test]
    async fn remote_pull_returns_bare_answer() {
        let engine = FakeEngine::with_script(gathering(2));
        let conn = open(&engine).await;
        let answer = pull_with_remote_offer(&conn, REMOTE_SDP).await.unwrap();
        assert!(answer.contains("a=receiveonly"));
        assert!(extract_candidates(&answer).is_empty());
    }

    #[tokio::test]
    async fn failed_exchange_is_negotiation_error() {
        let engine = FakeEngine::new();
        let conn = open(&engine).await;
        let result = pull_with_local_offer(&conn, |_offer| async { Err::<String, _>("HTTP 503") }).await;
        match result {
            Err(WebRTCError::Negotiation(msg)) => assert!(msg.contains("HTTP 503")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_offer_is_rejected() {
        let engine = FakeEngine::new();
        let conn = open(&engine).await;
        let result = pull_with_remote_offer(&conn, "garbage").await;
        assert!(matches!(result, Err(WebRTCError::Negotiation(_))));
    }
}
