//! Per-relationship operation serialization.
//!
//! The relationship record plus its event chain is owned exclusively by the
//! logical task that currently holds its lock; hand-off between tasks goes
//! through the store, never through in-memory sharing. Distinct
//! relationships proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use accord_types::RelationshipId;

/// Registry of per-relationship mutexes.
#[derive(Default)]
pub struct RelationshipLocks {
    locks: Mutex<HashMap<RelationshipId, Arc<Mutex<()>>>>,
}

impl RelationshipLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one relationship, waiting if another task holds
    /// it. The guard must be held across every multi-step mutation.
    pub async fn acquire(&self, id: &RelationshipId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the mutex for a relationship that will see no further mutations.
    pub async fn discard(&self, id: &RelationshipId) {
        let mut locks = self.locks.lock().await;
        locks.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn same_relationship_is_serialized() {
        let locks = Arc::new(RelationshipLocks::new());
        let id = RelationshipId::new("r1");
        let inside = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let id = id.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&id).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_relationships_do_not_block() {
        let locks = Arc::new(RelationshipLocks::new());
        let guard_a = locks.acquire(&RelationshipId::new("a")).await;
        // Acquiring a different relationship's lock must not dead-wait.
        let guard_b = locks.acquire(&RelationshipId::new("b")).await;
        drop(guard_a);
        drop(guard_b);
    }
}
