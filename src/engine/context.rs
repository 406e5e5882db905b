//! Process-scoped media engine lifetime
//!
//! The engine (codec factories, device module) is shared by every connection
//! in the process. Ordering: `initialize` once, `release` once, and only
//! `initialize` again after the release completed.

use super::{EngineError, MediaEngine};
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
pub struct EngineContext {
    engine: Mutex<Option<Arc<dyn MediaEngine>>>,
}

impl EngineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the engine if none is live. A second call returns the existing
    /// engine without invoking `build`.
    pub fn initialize<F>(&self, build: F) -> Result<Arc<dyn MediaEngine>, EngineError>
    where
        F: FnOnce() -> Result<Arc<dyn MediaEngine>, EngineError>,
    {
        let mut slot = self.engine.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        info!("Initializing media engine");
        let engine = build()?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Context that starts out holding an already-built engine
    pub fn with_engine(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
        }
    }

    pub fn engine(&self) -> Option<Arc<dyn MediaEngine>> {
        self.engine.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// Shut the engine down. Returns false when nothing was initialized.
    ///
    /// Connections created from the released engine keep their own
    /// references; release them first.
    pub fn release(&self) -> bool {
        let engine = self.engine.lock().take();
        match engine {
            Some(engine) => {
                info!("Releasing media engine");
                engine.shutdown();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;

    #[test]
    fn initialize_is_idempotent() {
        let context = EngineContext::new();
        let first = context
            .initialize(|| Ok(Arc::new(FakeEngine::new()) as Arc<dyn MediaEngine>))
            .unwrap();
        let second = context
            .initialize(|| Err(EngineError::new("must not be called")))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn release_then_reinitialize_builds_fresh_engine() {
        let fake = Arc::new(FakeEngine::new());
        let context = EngineContext::with_engine(fake.clone());
        assert!(context.release());
        assert!(fake.is_shut_down());
        assert!(!context.is_initialized());
        assert!(!context.release());

        let fresh = context
            .initialize(|| Ok(Arc::new(FakeEngine::new()) as Arc<dyn MediaEngine>))
            .unwrap();
        assert!(!Arc::ptr_eq(&(fake as Arc<dyn MediaEngine>), &fresh));
    }

    #[test]
    fn failed_build_leaves_context_empty() {
        let context = EngineContext::new();
        assert!(context.initialize(|| Err(EngineError::new("no device"))).is_err());
        assert!(context.engine().is_none());
    }
}
