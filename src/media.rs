//! Local track cache
//!
//! Capture code asks for a track by id and gets the same track back until it
//! is removed. The cache holds the only strong reference a connection
//! depends on: removing a track lets bound connections see it go away.

use crate::engine::{AudioTrack, EngineError, MediaEngine, MediaKind, MediaTrack, VideoTrack};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct TrackCache {
    engine: Arc<dyn MediaEngine>,
    tracks: Mutex<HashMap<String, MediaTrack>>,
}

impl TrackCache {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the track registered under `id`, creating it on first use.
    /// An id already used by the other kind is an error.
    pub fn get_or_create(&self, kind: MediaKind, id: &str) -> Result<MediaTrack, EngineError> {
        let mut tracks = self.tracks.lock();
        if let Some(track) = tracks.get(id) {
            if track.kind() != kind {
                return Err(EngineError::new(format!(
                    "track {} is a {} track, not {}",
                    id,
                    track.kind(),
                    kind
                )));
            }
            return Ok(track.clone());
        }
        let track = self.engine.create_track(kind, id)?;
        debug!("Created local {} track {}", kind, id);
        tracks.insert(id.to_string(), track.clone());
        Ok(track)
    }

    pub fn audio(&self, id: &str) -> Result<AudioTrack, EngineError> {
        match self.get_or_create(MediaKind::Audio, id)? {
            MediaTrack::Audio(track) => Ok(track),
            MediaTrack::Video(_) => Err(EngineError::new(format!("track {} is not audio", id))),
        }
    }

    pub fn video(&self, id: &str) -> Result<VideoTrack, EngineError> {
        match self.get_or_create(MediaKind::Video, id)? {
            MediaTrack::Video(track) => Ok(track),
            MediaTrack::Audio(_) => Err(EngineError::new(format!("track {} is not video", id))),
        }
    }

    pub fn remove(&self, id: &str) -> Option<MediaTrack> {
        self.tracks.lock().remove(id)
    }

    /// Drop every cached track
    pub fn release(&self) {
        let released = std::mem::take(&mut *self.tracks.lock());
        if !released.is_empty() {
            info!("Released {} local tracks", released.len());
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }
}
