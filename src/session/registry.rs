//! Session registry
//!
//! Maps caller-chosen session ids to their live [`Connection`]. Starting a
//! negotiation under an id that is already in use disposes the previous
//! connection first. A connection that fails, disconnects or closes removes
//! itself before the caller's disconnect callback runs.
//!
//! Connections are never disposed while the map lock is held: disposal waits
//! for in-flight hook delivery, and those hooks take the map lock.

use super::negotiation::{self, LocalMedia};
use super::signaling::{decode_candidate, encode_candidate, ICE_COMPLETE_SENTINEL};
use super::{Connection, WebRTCError};
use crate::config::IceServerConfig;
use crate::engine::{AudioTrack, BitrateBounds, EngineContext, VideoTrack};
use crate::stats::{AudioStats, VideoStats};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Sessions = Arc<Mutex<HashMap<String, Arc<Connection>>>>;

/// Settings applied to every connection at creation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDefaults {
    pub ice_servers: Vec<IceServerConfig>,
    pub bitrate: BitrateBounds,
}

type Notify = Arc<dyn Fn() + Send + Sync>;

/// Caller hooks for one session
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_ice: Option<Arc<dyn Fn(String) + Send + Sync>>,
    on_connected: Option<Notify>,
    on_disconnect: Option<Notify>,
    on_audio_connected: Option<Arc<dyn Fn(AudioTrack) + Send + Sync>>,
    on_video_connected: Option<Arc<dyn Fn(VideoTrack) + Send + Sync>>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trickled local candidates as JSON payloads; an empty string marks the
    /// end of gathering
    pub fn on_ice(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_ice = Some(Arc::new(callback));
        self
    }

    pub fn on_connected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    /// Runs after the session has been removed from the registry
    pub fn on_disconnect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn on_audio_connected(mut self, callback: impl Fn(AudioTrack) + Send + Sync + 'static) -> Self {
        self.on_audio_connected = Some(Arc::new(callback));
        self
    }

    pub fn on_video_connected(mut self, callback: impl Fn(VideoTrack) + Send + Sync + 'static) -> Self {
        self.on_video_connected = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_ice", &self.on_ice.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_audio_connected", &self.on_audio_connected.is_some())
            .field("on_video_connected", &self.on_video_connected.is_some())
            .finish()
    }
}

pub struct SessionRegistry {
    sessions: Sessions,
    engine: Arc<EngineContext>,
    defaults: RwLock<SessionDefaults>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<EngineContext>, defaults: SessionDefaults) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            engine,
            defaults: RwLock::new(defaults),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    pub fn defaults(&self) -> SessionDefaults {
        self.defaults.read().clone()
    }

    /// Applies to sessions started afterwards
    pub fn set_bitrate_bounds(&self, bitrate: BitrateBounds) {
        info!("Bitrate bounds set to {}/{}/{} bps", bitrate.min, bitrate.current, bitrate.max);
        self.defaults.write().bitrate = bitrate;
    }

    /// Applies to sessions started afterwards
    pub fn set_ice_servers(&self, ice_servers: Vec<IceServerConfig>) {
        info!("Using {} ICE servers", ice_servers.len());
        self.defaults.write().ice_servers = ice_servers;
    }

    /// Push local media, offering first. `exchange` delivers our offer (with
    /// embedded candidates) to the remote sink and returns its answer.
    pub async fn start_push<F, Fut, E>(
        &self,
        id: &str,
        media: LocalMedia,
        callbacks: SessionCallbacks,
        exchange: F,
    ) -> Result<(), WebRTCError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: fmt::Display,
    {
        info!("Starting push session {}", id);
        media.ensure_present()?;
        let conn = self.open(id, &callbacks).await?;
        let result = negotiation::push_with_local_offer(&conn, &media, exchange).await;
        self.settle(&conn, result)
    }

    /// Push local media in answer to a remote offer. Returns the answer with
    /// embedded candidates.
    pub async fn accept_push(
        &self,
        id: &str,
        media: LocalMedia,
        offer: &str,
        callbacks: SessionCallbacks,
    ) -> Result<String, WebRTCError> {
        info!("Accepting push session {}", id);
        media.ensure_present()?;
        let conn = self.open(id, &callbacks).await?;
        let result = negotiation::push_with_remote_offer(&conn, &media, offer).await;
        self.settle(&conn, result)
    }

    /// Pull remote media, offering first. `exchange` delivers our offer and
    /// returns the remote answer.
    pub async fn start_pull<F, Fut, E>(
        &self,
        id: &str,
        callbacks: SessionCallbacks,
        exchange: F,
    ) -> Result<(), WebRTCError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: fmt::Display,
    {
        info!("Starting pull session {}", id);
        let conn = self.open(id, &callbacks).await?;
        let result = negotiation::pull_with_local_offer(&conn, exchange).await;
        self.settle(&conn, result)
    }

    /// Pull remote media in answer to a remote offer. Returns the answer.
    pub async fn accept_pull(
        &self,
        id: &str,
        offer: &str,
        callbacks: SessionCallbacks,
    ) -> Result<String, WebRTCError> {
        info!("Accepting pull session {}", id);
        let conn = self.open(id, &callbacks).await?;
        let result = negotiation::pull_with_remote_offer(&conn, offer).await;
        self.settle(&conn, result)
    }

    /// Dispose any previous session under `id`, then create, wire and
    /// register a new connection
    async fn open(&self, id: &str, callbacks: &SessionCallbacks) -> Result<Arc<Connection>, WebRTCError> {
        let previous = self.sessions.lock().remove(id);
        if let Some(previous) = previous {
            info!("Replacing session {}", id);
            previous.dispose();
        }

        let engine = self
            .engine
            .engine()
            .ok_or_else(|| WebRTCError::EngineCreate("media engine is not initialized".to_string()))?;
        let defaults = self.defaults();
        let conn = Connection::create_paused(id, engine.as_ref(), defaults.ice_servers, defaults.bitrate).await?;
        self.wire(&conn, callbacks);

        let displaced = self.sessions.lock().insert(id.to_string(), conn.clone());
        if let Some(displaced) = displaced {
            debug!("Session {} displaced by a concurrent start", id);
            displaced.dispose();
        }
        conn.start_dispatch();
        Ok(conn)
    }

    fn wire(&self, conn: &Arc<Connection>, callbacks: &SessionCallbacks) {
        let teardown: Notify = {
            let sessions = self.sessions.clone();
            let weak = Arc::downgrade(conn);
            let on_disconnect = callbacks.on_disconnect.clone();
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    if remove_if_current(&sessions, &conn) {
                        info!("Session {} removed from registry", conn.id());
                    }
                    conn.dispose();
                }
                if let Some(on_disconnect) = &on_disconnect {
                    on_disconnect();
                }
            })
        };
        let on_failed = teardown.clone();
        conn.on_disconnected(move || teardown());
        conn.on_connect_failed(move || on_failed());

        if let Some(on_connected) = callbacks.on_connected.clone() {
            conn.on_connected(move || on_connected());
        }
        if let Some(on_ice) = callbacks.on_ice.clone() {
            let id = conn.id().to_string();
            let trickle = on_ice.clone();
            conn.on_ice(move |candidate| match encode_candidate(candidate) {
                Ok(payload) => trickle(payload),
                Err(e) => warn!("Session {} {}", id, e),
            });
            conn.on_ice_complete(move |_| on_ice(ICE_COMPLETE_SENTINEL.to_string()));
        }
        if let Some(on_audio) = callbacks.on_audio_connected.clone() {
            conn.on_audio_connected(move |track| on_audio(track.clone()));
        }
        if let Some(on_video) = callbacks.on_video_connected.clone() {
            conn.on_video_connected(move |track| on_video(track.clone()));
        }
    }

    /// A failed flow leaves nothing behind
    fn settle<T>(&self, conn: &Arc<Connection>, result: Result<T, WebRTCError>) -> Result<T, WebRTCError> {
        if let Err(e) = &result {
            warn!("Session {} negotiation failed: {}", conn.id(), e);
            remove_if_current(&self.sessions, conn);
            conn.dispose();
        }
        result
    }

    /// Forward a trickled remote candidate. Unknown ids, the completion
    /// sentinel and unparsable payloads are ignored.
    pub async fn add_ice_candidate(&self, id: &str, payload: &str) {
        let conn = match self.get(id) {
            Some(conn) => conn,
            None => {
                debug!("Session {} not found, candidate dropped", id);
                return;
            }
        };
        match decode_candidate(payload) {
            Ok(Some(candidate)) => conn.add_ice_candidate(candidate).await,
            Ok(None) => debug!("Session {} remote gathering complete", id),
            Err(e) => warn!("Session {} {}", id, e),
        }
    }

    /// Dispose and forget one session. Returns false if it was not registered.
    pub fn release(&self, id: &str) -> bool {
        let conn = self.sessions.lock().remove(id);
        match conn {
            Some(conn) => {
                info!("Releasing session {}", id);
                conn.dispose();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let all: Vec<Arc<Connection>> = self.sessions.lock().drain().map(|(_, conn)| conn).collect();
        if !all.is_empty() {
            info!("Releasing {} sessions", all.len());
        }
        for conn in all {
            conn.dispose();
        }
    }

    /// Fresh audio sample for `id`, or `None` if no such session exists
    pub async fn audio_stats(&self, id: &str) -> Option<AudioStats> {
        self.get(id)?.audio_stats().await
    }

    /// Fresh video sample for `id`, or `None` if no such session exists
    pub async fn video_stats(&self, id: &str) -> Option<VideoStats> {
        self.get(id)?.video_stats().await
    }

    /// Start a new audio level averaging window on `id`
    pub fn reset_average_audio_level(&self, id: &str) -> Result<(), WebRTCError> {
        self.require(id)?.reset_average_audio_level();
        Ok(())
    }

    /// RMS audio level of `id` since its last reset, over the last sampled
    /// snapshot
    pub fn average_audio_level(&self, id: &str) -> Result<f64, WebRTCError> {
        Ok(self.require(id)?.average_audio_level())
    }

    fn require(&self, id: &str) -> Result<Arc<Connection>, WebRTCError> {
        self.get(id).ok_or_else(|| WebRTCError::SessionNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }
}

/// Remove the entry for `conn` only if it is still the registered one
fn remove_if_current(sessions: &Sessions, conn: &Arc<Connection>) -> bool {
    let mut map = sessions.lock();
    match map.get(conn.id()) {
        Some(current) if Arc::ptr_eq(current, conn) => {
            map.remove(conn.id());
            true
        }
        _ => false,
    }
}
