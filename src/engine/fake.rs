//! Scripted in-memory engine used by unit tests

use super::{
    AudioSampleTap, AudioSamples, AudioTrack, BitrateBounds, ConnectionState, EngineError, EngineEvent,
    EngineEvents, EngineTransport, IceCandidate, MediaEngine, MediaKind, MediaTrack, RawCounters, Role,
    SdpType, SessionDescription, TrackHandle, TransportConfig, VideoTrack, WeakTrack,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour applied to every transport the fake engine creates
#[derive(Clone, Default)]
pub struct FakeScript {
    /// Refuse to create transports
    pub refuse_create: bool,
    /// Candidates emitted, followed by gathering completion, once a local
    /// description is set
    pub auto_gather: Option<Vec<IceCandidate>>,
    /// Report CONNECTED once both descriptions are applied
    pub auto_connect: bool,
    pub fail_create_offer: Option<String>,
    pub fail_set_remote: Option<String>,
    /// Never resolve offer/answer generation
    pub hold_descriptions: bool,
    pub fail_ice_candidates: bool,
    /// Events reported while the transport is still being created
    pub early_events: Vec<EngineEvent>,
    /// Time transport creation takes
    pub create_delay: Option<Duration>,
}

pub struct FakeEngine {
    script: Mutex<FakeScript>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    tap: Mutex<Option<AudioSampleTap>>,
    shut_down: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_script(FakeScript::default())
    }

    pub fn with_script(script: FakeScript) -> Self {
        Self {
            script: Mutex::new(script),
            transports: Mutex::new(Vec::new()),
            tap: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Push samples through the installed tap, if any
    pub fn feed_audio(&self, data: &[i16]) -> bool {
        let tap = self.tap.lock().clone();
        match tap {
            Some(tap) => {
                tap(&AudioSamples {
                    sample_rate: 48_000,
                    channels: 1,
                    data,
                });
                true
            }
            None => false,
        }
    }
}

pub fn audio_track(id: &str) -> AudioTrack {
    AudioTrack::new(id, Arc::new(id.to_string()) as TrackHandle)
}

pub fn video_track(id: &str) -> VideoTrack {
    VideoTrack::new(id, Arc::new(id.to_string()) as TrackHandle)
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        "0",
        0,
        format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000{} typ host", n, n, n),
    )
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_transport(
        &self,
        config: TransportConfig,
        events: EngineEvents,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        let script = self.script.lock().clone();
        if let Some(delay) = script.create_delay {
            tokio::time::sleep(delay).await;
        }
        if script.refuse_create {
            return Err(EngineError::new("transport refused"));
        }
        for event in &script.early_events {
            events.emit(event.clone());
        }
        let transport = Arc::new(FakeTransport {
            script,
            events,
            ice_server_count: config.ice_servers.len(),
            calls: Mutex::new(Vec::new()),
            bitrate: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }

    fn create_track(&self, kind: MediaKind, id: &str) -> Result<MediaTrack, EngineError> {
        Ok(match kind {
            MediaKind::Audio => MediaTrack::Audio(audio_track(id)),
            MediaKind::Video => MediaTrack::Video(video_track(id)),
        })
    }

    fn set_audio_sample_tap(&self, tap: Option<AudioSampleTap>) -> Result<(), EngineError> {
        *self.tap.lock() = tap;
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    script: FakeScript,
    events: EngineEvents,
    ice_server_count: usize,
    calls: Mutex<Vec<String>>,
    bitrate: Mutex<Option<BitrateBounds>>,
    /// Bound tracks; the producer owns them
    tracks: Mutex<Vec<WeakTrack>>,
    stats: Mutex<HashMap<MediaKind, VecDeque<RawCounters>>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn bitrate(&self) -> Option<BitrateBounds> {
        *self.bitrate.lock()
    }

    /// Bound tracks that are still alive
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().iter().filter_map(WeakTrack::upgrade).collect()
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_server_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue counter reports returned by successive `stats(kind)` calls
    pub fn push_stats(&self, kind: MediaKind, report: RawCounters) {
        self.stats.lock().entry(kind).or_default().push_back(report);
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn description(&self, sdp_type: SdpType, role: Role) -> SessionDescription {
        let sdp = format!(
            "v=0\r\no=- 4215 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na={}\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
            role.as_str()
        );
        SessionDescription { sdp_type, sdp }
    }

    fn maybe_connect(&self) {
        if self.script.auto_connect
            && self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
        {
            self.emit(EngineEvent::ConnectionState(ConnectionState::Connecting));
            self.emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn set_bitrate(&self, bounds: BitrateBounds) {
        *self.bitrate.lock() = Some(bounds);
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        self.record(format!("add_track:{}:{}", track.kind(), track.id()));
        self.tracks.lock().push(track.downgrade());
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind, id: &str) -> Result<(), EngineError> {
        self.record(format!("remove_track:{}:{}", kind, id));
        self.tracks
            .lock()
            .retain(|track| !(track.kind() == kind && track.id() == id));
        Ok(())
    }

    async fn create_offer(&self, role: Role) -> Result<SessionDescription, EngineError> {
        self.record(format!("create_offer:{}", role));
        if self.script.hold_descriptions {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = &self.script.fail_create_offer {
            return Err(EngineError::new(reason.clone()));
        }
        Ok(self.description(SdpType::Offer, role))
    }

    async fn create_answer(&self, role: Role) -> Result<SessionDescription, EngineError> {
        self.record(format!("create_answer:{}", role));
        if self.script.hold_descriptions {
            std::future::pending::<()>().await;
        }
        Ok(self.description(SdpType::Answer, role))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(format!("set_local:{}", description.sdp_type));
        self.has_local.store(true, Ordering::SeqCst);
        if let Some(candidates) = &self.script.auto_gather {
            for candidate in candidates {
                self.emit(EngineEvent::IceCandidate(candidate.clone()));
            }
            self.emit(EngineEvent::IceGatheringComplete);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(format!("set_remote:{}", description.sdp_type));
        if let Some(reason) = &self.script.fail_set_remote {
            return Err(EngineError::new(reason.clone()));
        }
        if !description.sdp.starts_with("v=0") {
            return Err(EngineError::new("malformed session description"));
        }
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(format!("add_ice:{}", candidate.candidate));
        if self.script.fail_ice_candidates {
            return Err(EngineError::new("stale candidate"));
        }
        Ok(())
    }

    async fn stats(&self, kind: MediaKind) -> Option<RawCounters> {
        self.stats.lock().get_mut(&kind).and_then(|queue| queue.pop_front())
    }

    fn close(&self) {
        self.record("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
    }
}
