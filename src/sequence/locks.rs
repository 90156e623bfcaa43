use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::Partition;

/// In-process registry of per-partition locks.
///
/// Renumbering a partition is a multi-step sequence of writes, so two
/// requests for the same `(lab, date)` must not interleave.
#[derive(Debug, Default)]
pub struct PartitionLocks {
    slots: Mutex<HashMap<Partition, Arc<AsyncMutex<()>>>>,
}

/// Held partition locks, released on drop.
#[derive(Debug)]
pub struct PartitionGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl PartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, partition: &Partition) -> Arc<AsyncMutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Drop slots nobody is holding or waiting on.
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.entry(*partition).or_default().clone()
    }

    /// Lock every partition in `partitions`. Acquisition follows the set's
    /// sorted order, so overlapping requests cannot deadlock.
    pub async fn acquire(&self, partitions: &BTreeSet<Partition>) -> PartitionGuard {
        let mut guards = Vec::with_capacity(partitions.len());
        for partition in partitions {
            guards.push(self.slot(partition).lock_owned().await);
        }
        PartitionGuard { _guards: guards }
    }

    pub async fn acquire_one(&self, partition: Partition) -> PartitionGuard {
        self.acquire(&BTreeSet::from([partition])).await
    }
}
