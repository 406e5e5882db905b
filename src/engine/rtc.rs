//! Media engine backed by webrtc-rs
//!
//! Local tracks are `TrackLocalStaticSample`s (Opus audio, VP8 video) fed
//! through [`write_sample`]. Remote tracks are handed out as the engine's
//! `TrackRemote`.
//!
//! webrtc-rs exposes no hook on the local capture path, so the audio sample
//! tap is not available from this engine. Outbound reports carry byte and
//! packet counters, RTT and loss; audio level and frame geometry are not
//! reported.

use super::{
    AudioTrack, BitrateBounds, ConnectionState, EngineError, EngineEvent, EngineEvents, EngineTransport,
    IceCandidate, MediaEngine, MediaKind, MediaTrack, RawCounters, Role, SdpType, SessionDescription,
    TrackHandle, TransportConfig, VideoTrack,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub struct RtcEngine {
    api: API,
}

impl RtcEngine {
    /// Build the codec registry and interceptor chain shared by every
    /// transport
    pub fn new() -> Result<Self, EngineError> {
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| EngineError::new(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)
            .map_err(|e| EngineError::new(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

fn ice_servers(config: &TransportConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn install_handlers(pc: &RTCPeerConnection, events: EngineEvents) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                events.emit(EngineEvent::IceGatheringComplete);
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.emit(EngineEvent::IceCandidate(IceCandidate::new(
                    init.sdp_mid.unwrap_or_default(),
                    init.sdp_mline_index.unwrap_or(0),
                    init.candidate,
                ))),
                Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
            }
        })
    }));

    let gathering = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        if state == RTCIceGathererState::Complete {
            gathering.emit(EngineEvent::IceGatheringComplete);
        }
        Box::pin(async {})
    }));

    let states = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        states.emit(EngineEvent::ConnectionState(connection_state(state)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let id = track.id();
            let kind = track.kind();
            let handle: TrackHandle = track;
            match kind {
                RTPCodecType::Audio => events.emit(EngineEvent::RemoteTrack(AudioTrack::new(id, handle).into())),
                RTPCodecType::Video => events.emit(EngineEvent::RemoteTrack(VideoTrack::new(id, handle).into())),
                _ => debug!("Ignoring remote track {} of unknown kind", id),
            }
            Box::pin(async {})
        },
    ));
}

fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn local_track(track: &MediaTrack) -> Result<Arc<TrackLocalStaticSample>, EngineError> {
    track
        .handle()
        .clone()
        .downcast::<TrackLocalStaticSample>()
        .map_err(|_| EngineError::new(format!("track {} was not created by this engine", track.id())))
}

/// Write one encoded frame to a local track created by [`RtcEngine`]
pub async fn write_sample(track: &MediaTrack, data: Bytes, duration: Duration) -> Result<(), EngineError> {
    let local = local_track(track)?;
    local
        .write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(|e| EngineError::new(format!("Failed to write sample to {}: {}", track.id(), e)))
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_transport(
        &self,
        config: TransportConfig,
        events: EngineEvents,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&config),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create peer connection: {}", e)))?;
        install_handlers(&pc, events);

        Ok(Arc::new(RtcTransport {
            pc: Arc::new(pc),
            started: Instant::now(),
            bitrate: Mutex::new(BitrateBounds::default()),
            senders: Mutex::new(HashMap::new()),
        }))
    }

    fn create_track(&self, kind: MediaKind, id: &str) -> Result<MediaTrack, EngineError> {
        let stream_id = format!("rtc-helper-{}", Uuid::new_v4());
        let handle: TrackHandle = Arc::new(TrackLocalStaticSample::new(
            codec_capability(kind),
            id.to_owned(),
            stream_id,
        ));
        Ok(match kind {
            MediaKind::Audio => AudioTrack::new(id, handle).into(),
            MediaKind::Video => VideoTrack::new(id, handle).into(),
        })
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    started: Instant,
    bitrate: Mutex<BitrateBounds>,
    /// Senders of bound local tracks, by kind and track id
    senders: Mutex<HashMap<(MediaKind, String), Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    fn description(&self, description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        let converted = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        converted.map_err(|e| EngineError::new(format!("Invalid session description: {}", e)))
    }

    /// Milliseconds since the transport was created, for a report observed
    /// `age` ago
    fn report_time_ms(&self, age: Duration) -> f64 {
        self.started.elapsed().saturating_sub(age).as_secs_f64() * 1000.0
    }
}

#[async_trait]
impl EngineTransport for RtcTransport {
    fn set_bitrate(&self, bounds: BitrateBounds) {
        debug!(
            "Bitrate bounds {}/{}/{} bps (advisory, congestion control is internal)",
            bounds.min, bounds.current, bounds.max
        );
        *self.bitrate.lock() = bounds;
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = local_track(track)?;
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                local,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| EngineError::new(format!("Failed to add track {}: {}", track.id(), e)))?;
        let sender = transceiver.sender().await;
        self.senders
            .lock()
            .insert((track.kind(), track.id().to_owned()), sender);
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind, id: &str) -> Result<(), EngineError> {
        let sender = self.senders.lock().remove(&(kind, id.to_owned()));
        let Some(sender) = sender else {
            debug!("No sender bound for {} track {}", kind, id);
            return Ok(());
        };
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| EngineError::new(format!("Failed to remove track {}: {}", id, e)))
    }

    async fn create_offer(&self, role: Role) -> Result<SessionDescription, EngineError> {
        if role == Role::ReceiveOnly && self.pc.get_transceivers().await.is_empty() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                self.pc
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| EngineError::new(format!("Failed to add {:?} transceiver: {}", kind, e)))?;
            }
        }
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, _role: Role) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = self.description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| EngineError::new(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = self.description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| EngineError::new(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.sdp_mid),
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::new(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self, kind: MediaKind) -> Option<RawCounters> {
        let report = self.pc.get_stats().await;
        let mut counters: Option<RawCounters> = None;
        let mut packets_lost = None;
        let mut rtt_ms = None;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(outbound) if outbound.kind == kind.as_str() => {
                    let raw = counters.get_or_insert_with(RawCounters::default);
                    raw.timestamp_ms = self.report_time_ms(outbound.timestamp.elapsed());
                    raw.bytes_sent = Some(outbound.bytes_sent);
                    raw.packets_sent = Some(outbound.packets_sent);
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == kind.as_str() => {
                    packets_lost = Some(remote.packets_lost as i64);
                    rtt_ms = remote.round_trip_time.map(|secs| (secs * 1000.0).round() as u32);
                }
                _ => {}
            }
        }

        let mut raw = counters?;
        raw.packets_lost = packets_lost;
        raw.rtt_ms = rtt_ms;
        Some(raw)
    }

    fn close(&self) {
        let pc = self.pc.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        warn!("Failed to close peer connection: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close peer connection on"),
        }
    }
}
