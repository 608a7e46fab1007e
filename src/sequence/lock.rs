use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-name mutual exclusion for read-modify-write cycles.
///
/// One async mutex per sequence name, created on first use. Entries are never
/// evicted; the map is bounded by the number of sequences an adapter serves.
#[derive(Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of `name` remains. Released on drop.
    pub async fn acquire(&self, name: &str) -> NamedLockGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        NamedLockGuard {
            name: name.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for NamedLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLocks").field("names", &self.len()).finish()
    }
}

pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}
