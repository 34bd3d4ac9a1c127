//! ==============================================================================
//! cache.rs - shared reading cache
//! ==============================================================================
//!
//! purpose:
//!     holds exactly one SensorSnapshot, written by the bus session task and
//!     read by any number of http handlers at the same time.
//!
//! locking:
//!     arc<rwlock<>> like the rest of the host:
//!     - arc: the same cache is handed to the session task and the web state
//!     - rwlock: many readers OR one writer; the write lock is only held for
//!       the assignment of an already decoded snapshot, so readers never see
//!       a half-updated value and never wait on decoding.
//!
//! ==============================================================================

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::SensorSnapshot;

#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<SensorSnapshot>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the stored snapshot as a whole
    pub async fn set(&self, snapshot: SensorSnapshot) {
        *self.inner.write().await = snapshot;
    }

    /// consistent copy of the current snapshot
    pub async fn get(&self) -> SensorSnapshot {
        self.inner.read().await.clone()
    }
}
