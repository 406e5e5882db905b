//! One negotiated peer session
//!
//! A [`Connection`] owns a single engine transport and drives it through
//! track binding, offer/answer and ICE. Engine notifications arrive on
//! arbitrary threads; they are queued and replayed in order by a per-connection
//! dispatcher task, which updates the connection state and invokes the hooks.
//!
//! Disposal is final: it cancels suspended operations, clears every hook and
//! releases the transport. Nothing runs against the connection afterwards.

use super::WebRTCError;
use crate::config::IceServerConfig;
use crate::engine::{
    AudioTrack, BitrateBounds, ConnectionState, EngineEvent, EngineEvents, EngineTransport, IceCandidate,
    MediaEngine, MediaKind, MediaTrack, Role, SdpType, SessionDescription, TransportConfig, VideoTrack,
    WeakTrack,
};
use crate::stats::{self, AudioLevelMeter, AudioStats, VideoStats};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Hook = Arc<dyn Fn() + Send + Sync>;
type IceHook = Arc<dyn Fn(&IceCandidate) + Send + Sync>;
type IceCompleteHook = Arc<dyn Fn(&[IceCandidate]) + Send + Sync>;
type AudioHook = Arc<dyn Fn(&AudioTrack) + Send + Sync>;
type VideoHook = Arc<dyn Fn(&VideoTrack) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_ice: Option<IceHook>,
    on_ice_complete: Option<IceCompleteHook>,
    on_audio_connected: Option<AudioHook>,
    on_video_connected: Option<VideoHook>,
    on_connected: Option<Hook>,
    on_disconnected: Option<Hook>,
    on_connect_failed: Option<Hook>,
}

#[derive(Debug, Clone)]
enum GatherState {
    Gathering,
    Complete(Vec<IceCandidate>),
    Cancelled,
}

struct ConnState {
    connection_state: ConnectionState,
    disposed: bool,
    local_audio: Option<WeakTrack>,
    local_video: Option<WeakTrack>,
    remote_audio: Option<AudioTrack>,
    remote_video: Option<VideoTrack>,
    ice_candidates: Vec<IceCandidate>,
    bitrate: BitrateBounds,
    audio_stats: AudioStats,
    video_stats: VideoStats,
    level_meter: AudioLevelMeter,
}

thread_local! {
    /// Nesting depth of hook delivery on this thread
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running connection hooks
struct DeliveryScope;

impl DeliveryScope {
    fn enter() -> Self {
        DELIVERING.with(|depth| depth.set(depth.get() + 1));
        DeliveryScope
    }

    fn active() -> bool {
        DELIVERING.with(|depth| depth.get() > 0)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|depth| depth.set(depth.get() - 1));
    }
}

/// State touched by the dispatcher task
struct Shared {
    /// Held while an event is delivered and while disposing, so disposal
    /// from outside a hook waits for an in-flight delivery
    dispatch: Mutex<()>,
    state: Mutex<ConnState>,
    hooks: Mutex<Hooks>,
    gather_tx: watch::Sender<GatherState>,
}

impl Shared {
    /// Exclusive against delivery, except from inside a hook: a hook never
    /// waits on any connection's delivery, or two connections disposing
    /// each other from their hooks would block forever.
    fn exclusive(&self) -> Option<MutexGuard<'_, ()>> {
        if DeliveryScope::active() {
            None
        } else {
            Some(self.dispatch.lock())
        }
    }

    fn is_live(&self) -> bool {
        !self.state.lock().disposed
    }
}

pub struct Connection {
    id: String,
    transport: Arc<dyn EngineTransport>,
    shared: Arc<Shared>,
    /// Engine events queued until the dispatcher starts
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
    created_at: Instant,
}

impl Connection {
    /// Create a connection backed by a fresh engine transport.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn create(
        id: impl Into<String>,
        engine: &dyn MediaEngine,
        ice_servers: Vec<IceServerConfig>,
        bitrate: BitrateBounds,
    ) -> Result<Arc<Self>, WebRTCError> {
        let conn = Self::create_paused(id, engine, ice_servers, bitrate).await?;
        conn.start_dispatch();
        Ok(conn)
    }

    /// Like [`create`](Self::create), but engine events stay queued until
    /// [`start_dispatch`](Self::start_dispatch), so hooks installed in
    /// between see every event the engine reported during creation.
    pub(crate) async fn create_paused(
        id: impl Into<String>,
        engine: &dyn MediaEngine,
        ice_servers: Vec<IceServerConfig>,
        bitrate: BitrateBounds,
    ) -> Result<Arc<Self>, WebRTCError> {
        let id = id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = engine
            .create_transport(TransportConfig { ice_servers }, EngineEvents::new(events_tx))
            .await
            .map_err(|e| WebRTCError::EngineCreate(format!("{}: {}", id, e)))?;
        transport.set_bitrate(bitrate);

        let (gather_tx, _) = watch::channel(GatherState::Gathering);
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            dispatch: Mutex::new(()),
            state: Mutex::new(ConnState {
                connection_state: ConnectionState::New,
                disposed: false,
                local_audio: None,
                local_video: None,
                remote_audio: None,
                remote_video: None,
                ice_candidates: Vec::new(),
                bitrate,
                audio_stats: AudioStats::default(),
                video_stats: VideoStats::default(),
                level_meter: AudioLevelMeter::default(),
            }),
            hooks: Mutex::new(Hooks::default()),
            gather_tx,
        });

        info!(
            "Session {} created (bitrate {}/{}/{} bps)",
            id, bitrate.min, bitrate.current, bitrate.max
        );

        Ok(Arc::new(Self {
            id,
            transport,
            shared,
            pending_events: Mutex::new(Some(events_rx)),
            dispatcher: Mutex::new(None),
            closed_tx,
            created_at: Instant::now(),
        }))
    }

    /// Start replaying queued engine events. No-op once started or disposed.
    pub(crate) fn start_dispatch(&self) {
        let mut dispatcher = self.dispatcher.lock();
        let Some(events) = self.pending_events.lock().take() else {
            return;
        };
        if self.is_disposed() {
            return;
        }
        *dispatcher = Some(tokio::spawn(dispatch_events(self.shared.clone(), self.id.clone(), events)));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection_state
    }

    /// True while the transport is connecting or connected
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    pub fn bitrate_bounds(&self) -> BitrateBounds {
        self.shared.state.lock().bitrate
    }

    /// Candidates gathered so far, in discovery order
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.shared.state.lock().ice_candidates.clone()
    }

    pub fn local_audio_track(&self) -> Option<AudioTrack> {
        match self.shared.state.lock().local_audio.as_ref()?.upgrade()? {
            MediaTrack::Audio(track) => Some(track),
            MediaTrack::Video(_) => None,
        }
    }

    pub fn local_video_track(&self) -> Option<VideoTrack> {
        match self.shared.state.lock().local_video.as_ref()?.upgrade()? {
            MediaTrack::Video(track) => Some(track),
            MediaTrack::Audio(_) => None,
        }
    }

    pub fn remote_audio_track(&self) -> Option<AudioTrack> {
        self.shared.state.lock().remote_audio.clone()
    }

    pub fn remote_video_track(&self) -> Option<VideoTrack> {
        self.shared.state.lock().remote_video.clone()
    }

    pub fn on_ice(&self, hook: impl Fn(&IceCandidate) + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_ice = Some(Arc::new(hook)));
    }

    /// Fires once with every candidate gathered, in order
    pub fn on_ice_complete(&self, hook: impl Fn(&[IceCandidate]) + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_ice_complete = Some(Arc::new(hook)));
    }

    pub fn on_audio_connected(&self, hook: impl Fn(&AudioTrack) + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_audio_connected = Some(Arc::new(hook)));
    }

    pub fn on_video_connected(&self, hook: impl Fn(&VideoTrack) + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_video_connected = Some(Arc::new(hook)));
    }

    pub fn on_connected(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_connected = Some(Arc::new(hook)));
    }

    /// Fires on every DISCONNECTED or CLOSED report, including repeats
    pub fn on_disconnected(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_disconnected = Some(Arc::new(hook)));
    }

    pub fn on_connect_failed(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.set_hook(|hooks| hooks.on_connect_failed = Some(Arc::new(hook)));
    }

    fn set_hook(&self, install: impl FnOnce(&mut Hooks)) {
        let _dispatch = self.shared.exclusive();
        if self.is_disposed() {
            debug!("Session {} is disposed, hook ignored", self.id);
            return;
        }
        install(&mut self.shared.hooks.lock());
    }

    /// Bind a local track. A track already bound for the same kind is
    /// replaced.
    pub async fn add_track(&self, track: impl Into<MediaTrack>) -> Result<(), WebRTCError> {
        let track = track.into();
        self.ensure_live("add track")?;
        let previous = {
            let mut state = self.shared.state.lock();
            let slot = match track.kind() {
                MediaKind::Audio => &mut state.local_audio,
                MediaKind::Video => &mut state.local_video,
            };
            slot.replace(track.downgrade())
        };
        if let Some(previous) = previous {
            warn!(
                "Session {} replacing local {} track {} with {}",
                self.id,
                track.kind(),
                previous.id(),
                track.id()
            );
            self.cancellable("remove track", self.transport.remove_track(previous.kind(), previous.id()))
                .await?;
        }
        debug!("Session {} add {} track {}", self.id, track.kind(), track.id());
        self.cancellable("add track", self.transport.add_track(&track)).await
    }

    /// Generate a local offer for `role` and apply it as the local
    /// description. Returns the SDP text.
    pub async fn create_offer(&self, role: Role) -> Result<String, WebRTCError> {
        self.ensure_live("create offer")?;
        let description = self.cancellable("create offer", self.transport.create_offer(role)).await?;
        self.apply_local(description).await
    }

    /// Generate a local answer for `role` and apply it as the local
    /// description. Returns the SDP text.
    pub async fn create_answer(&self, role: Role) -> Result<String, WebRTCError> {
        self.ensure_live("create answer")?;
        let description = self.cancellable("create answer", self.transport.create_answer(role)).await?;
        self.apply_local(description).await
    }

    async fn apply_local(&self, description: SessionDescription) -> Result<String, WebRTCError> {
        debug!("Session {} local {}:\n{}", self.id, description.sdp_type, description.sdp);
        let sdp = description.sdp.clone();
        self.cancellable("set local description", self.transport.set_local_description(description))
            .await?;
        Ok(sdp)
    }

    pub async fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) -> Result<(), WebRTCError> {
        self.ensure_live("set remote description")?;
        debug!("Session {} remote {}:\n{}", self.id, sdp_type, sdp);
        let description = SessionDescription {
            sdp_type,
            sdp: sdp.to_string(),
        };
        self.cancellable("set remote description", self.transport.set_remote_description(description))
            .await
    }

    /// Forward a remote candidate. Failures are logged, never returned.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if self.is_disposed() {
            debug!("Session {} is disposed, candidate dropped", self.id);
            return;
        }
        debug!("Session {} remote candidate: {}", self.id, candidate.candidate);
        if let Err(e) = self.cancellable("add ice candidate", self.transport.add_ice_candidate(candidate)).await {
            warn!("Session {} ignoring ICE candidate: {}", self.id, e);
        }
    }

    /// Wait until local gathering completes and return every gathered
    /// candidate. Resolves with `Cancelled` if the connection is disposed.
    pub async fn wait_ice_complete(&self) -> Result<Vec<IceCandidate>, WebRTCError> {
        let mut gather = self.shared.gather_tx.subscribe();
        loop {
            let current = gather.borrow_and_update().clone();
            match current {
                GatherState::Complete(candidates) => return Ok(candidates),
                GatherState::Cancelled => return Err(self.cancelled("ice gathering")),
                GatherState::Gathering => {}
            }
            if gather.changed().await.is_err() {
                return Err(self.cancelled("ice gathering"));
            }
        }
    }

    /// Run an engine (or exchange) operation, resolving with `Cancelled`
    /// as soon as the connection is disposed.
    pub(crate) async fn cancellable<T, E, F>(&self, what: &str, operation: F) -> Result<T, WebRTCError>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let closed = self.closed_tx.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(closed) => Err(self.cancelled(what)),
            result = operation => result.map_err(|e| WebRTCError::negotiation(&self.id, what, e)),
        }
    }

    fn cancelled(&self, what: &str) -> WebRTCError {
        WebRTCError::Cancelled(format!("{} {}: connection disposed", self.id, what))
    }

    fn ensure_live(&self, what: &str) -> Result<(), WebRTCError> {
        if self.is_disposed() {
            return Err(self.cancelled(what));
        }
        Ok(())
    }

    /// Sample the outbound audio stream and return the new snapshot.
    /// Without a fresh report the previous snapshot is returned.
    pub async fn audio_stats(&self) -> Option<AudioStats> {
        if self.is_disposed() {
            return None;
        }
        let raw = self.transport.stats(MediaKind::Audio).await;
        let mut state = self.shared.state.lock();
        if state.disposed {
            return None;
        }
        if let Some(raw) = raw {
            state.audio_stats = stats::sample_audio(&state.audio_stats, &raw);
        }
        Some(state.audio_stats.clone())
    }

    /// Sample the outbound video stream and return the new snapshot.
    /// Without a fresh report the previous snapshot is returned.
    pub async fn video_stats(&self) -> Option<VideoStats> {
        if self.is_disposed() {
            return None;
        }
        let raw = self.transport.stats(MediaKind::Video).await;
        let mut state = self.shared.state.lock();
        if state.disposed {
            return None;
        }
        if let Some(raw) = raw {
            state.video_stats = stats::sample_video(&state.video_stats, &raw);
        }
        Some(state.video_stats.clone())
    }

    /// Start a new averaging window at the last audio snapshot
    pub fn reset_average_audio_level(&self) {
        let mut state = self.shared.state.lock();
        let snapshot = state.audio_stats.clone();
        state.level_meter.reset(&snapshot);
    }

    /// RMS audio level since the last reset (or the last call)
    pub fn average_audio_level(&self) -> f64 {
        let mut state = self.shared.state.lock();
        let snapshot = state.audio_stats.clone();
        state.level_meter.average(&snapshot)
    }

    /// Tear the connection down. Idempotent.
    pub fn dispose(&self) {
        let _dispatch = self.shared.exclusive();
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.connection_state = ConnectionState::Closed;
            state.local_audio = None;
            state.local_video = None;
            state.remote_audio = None;
            state.remote_video = None;
            state.ice_candidates.clear();
        }
        *self.shared.hooks.lock() = Hooks::default();
        self.closed_tx.send_replace(true);
        self.shared.gather_tx.send_replace(GatherState::Cancelled);
        self.pending_events.lock().take();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.transport.close();
        info!("Session {} disposed after {:?}", self.id, self.age());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn dispatch_events(shared: Arc<Shared>, id: String, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        deliver(&shared, &id, event);
    }
    debug!("Session {} event channel closed", id);
}

fn deliver(shared: &Shared, id: &str, event: EngineEvent) {
    let _dispatch = shared.dispatch.lock();
    let _scope = DeliveryScope::enter();
    if shared.state.lock().disposed {
        debug!("Session {} is disposed, dropping {:?}", id, event);
        return;
    }

    match event {
        EngineEvent::IceCandidate(candidate) => {
            debug!("Session {} local candidate: {}", id, candidate.candidate);
            shared.state.lock().ice_candidates.push(candidate.clone());
            let hook = shared.hooks.lock().on_ice.clone();
            if let Some(hook) = hook.filter(|_| shared.is_live()) {
                hook(&candidate);
            }
        }
        EngineEvent::IceGatheringComplete => {
            if matches!(*shared.gather_tx.borrow(), GatherState::Complete(_)) {
                return;
            }
            let candidates = shared.state.lock().ice_candidates.clone();
            info!("Session {} ICE gathering complete ({} candidates)", id, candidates.len());
            shared.gather_tx.send_replace(GatherState::Complete(candidates.clone()));
            let hook = shared.hooks.lock().on_ice_complete.clone();
            if let Some(hook) = hook.filter(|_| shared.is_live()) {
                hook(&candidates);
            }
        }
        EngineEvent::ConnectionState(next) => {
            {
                let mut state = shared.state.lock();
                let current = state.connection_state;
                let terminal = current == ConnectionState::Closed
                    || (current == ConnectionState::Failed && next != ConnectionState::Closed);
                if terminal {
                    debug!("Session {} ignoring {:?} after {:?}", id, next, current);
                    return;
                }
                debug!("Session {} state change: {:?} -> {:?}", id, current, next);
                state.connection_state = next;
            }
            let hook = {
                let hooks = shared.hooks.lock();
                match next {
                    ConnectionState::Connected => hooks.on_connected.clone(),
                    ConnectionState::Failed => hooks.on_connect_failed.clone(),
                    ConnectionState::Disconnected | ConnectionState::Closed => hooks.on_disconnected.clone(),
                    ConnectionState::New | ConnectionState::Connecting => None,
                }
            };
            match next {
                ConnectionState::Connected => info!("Session {} connected", id),
                ConnectionState::Failed => warn!("Session {} connection failed", id),
                ConnectionState::Disconnected | ConnectionState::Closed => info!("Session {} {:?}", id, next),
                _ => {}
            }
            if let Some(hook) = hook.filter(|_| shared.is_live()) {
                hook();
            }
        }
        EngineEvent::RemoteTrack(MediaTrack::Audio(track)) => {
            {
                let mut state = shared.state.lock();
                if state.remote_audio.is_some() {
                    debug!("Session {} ignoring extra remote audio track {}", id, track.id());
                    return;
                }
                state.remote_audio = Some(track.clone());
            }
            info!("Session {} remote audio track {}", id, track.id());
            let hook = shared.hooks.lock().on_audio_connected.clone();
            if let Some(hook) = hook.filter(|_| shared.is_live()) {
                hook(&track);
            }
        }
        EngineEvent::RemoteTrack(MediaTrack::Video(track)) => {
            {
                let mut state = shared.state.lock();
                if state.remote_video.is_some() {
                    debug!("Session {} ignoring extra remote video track {}", id, track.id());
                    return;
                }
                state.remote_video = Some(track.clone());
            }
            info!("Session {} remote video track {}", id, track.id());
            let hook = shared.hooks.lock().on_video_connected.clone();
            if let Some(hook) = hook.filter(|_| shared.is_live()) {
                hook(&track);
            }
        }
    }
}
