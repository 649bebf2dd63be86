use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockMap = DashMap<String, Arc<RwLock<()>>>;

pub type ReadGuard = NameGuard<OwnedRwLockReadGuard<()>>;
pub type WriteGuard = NameGuard<OwnedRwLockWriteGuard<()>>;

/// Reader/writer locks keyed by stored filename.
///
/// Chunk writers take the write side for a whole write-and-maybe-finalize
/// step, downloads hold the read side until their body is dropped. Files
/// with different names never contend. An entry lives only while some
/// guard holds it or some task waits on it.
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    locks: Arc<LockMap>,
}

/// Held lock on one filename. Dropping the last guard for a name removes
/// its entry from [`FileLocks`].
pub struct NameGuard<G> {
    guard: Option<G>,
    name: String,
    locks: Arc<LockMap>,
}

impl<G> fmt::Debug for NameGuard<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameGuard").field("name", &self.name).finish()
    }
}

impl<G> Drop for NameGuard<G> {
    fn drop(&mut self) {
        // release first so the map holds the only reference
        drop(self.guard.take());
        self.locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    fn guard<G>(&self, name: &str, guard: G) -> NameGuard<G> {
        NameGuard {
            guard: Some(guard),
            name: name.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Shared access for readers of `name`.
    pub async fn read(&self, name: &str) -> ReadGuard {
        let guard = self.entry(name).read_owned().await;
        self.guard(name, guard)
    }

    /// Exclusive access for the writer of `name`.
    pub async fn write(&self, name: &str) -> WriteGuard {
        let guard = self.entry(name).write_owned().await;
        self.guard(name, guard)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
