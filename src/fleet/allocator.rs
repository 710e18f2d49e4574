use std::collections::{hash_map::Entry, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::{error::AllocationError, types::PartitionKey};

#[derive(Debug, Clone)]
struct SequenceCounter {
    next: u64,
    granted: u64,
    abandoned: BTreeSet<u64>,
}

/// Per-partition nonce counters.
///
/// Only the controller's event loop holds one of these, so requests are
/// serialized by construction and no locking is involved. State is purely in
/// memory: after a controller restart every counter is re-initialised from
/// its baseline on first use.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: HashMap<PartitionKey, SequenceCounter>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self, key: &PartitionKey) -> bool {
        self.counters.contains_key(key)
    }

    /// Returns the next nonce for `key` and advances the counter. The baseline
    /// is only consulted the first time a key is seen.
    pub fn request(&mut self, key: &PartitionKey, baseline: Option<u64>) -> Result<u64, AllocationError> {
        let counter = match self.counters.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let start = baseline.ok_or_else(|| AllocationError::Uninitialized(key.to_string()))?;
                info!("Initialising sequence for partition {} at {}", key, start);
                entry.insert(SequenceCounter {
                    next: start,
                    granted: 0,
                    abandoned: BTreeSet::new(),
                })
            }
        };

        let nonce = counter.next;
        counter.next = nonce
            .checked_add(1)
            .ok_or_else(|| AllocationError::Exhausted(key.to_string()))?;
        counter.granted += 1;

        debug!("Granted nonce {} on partition {}", nonce, key);
        Ok(nonce)
    }

    /// Overwrites the counter for `key`, e.g. after re-reading the external
    /// source of truth. Abandoned records are cleared.
    pub fn resync(&mut self, key: &PartitionKey, next: u64) {
        match self.counters.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let counter = entry.get_mut();
                info!("Resync partition {}: {} -> {}", key, counter.next, next);
                counter.next = next;
                counter.abandoned.clear();
            }
            Entry::Vacant(entry) => {
                info!("Resync partition {}: initialising at {}", key, next);
                entry.insert(SequenceCounter {
                    next,
                    granted: 0,
                    abandoned: BTreeSet::new(),
                });
            }
        }
    }

    /// Records a nonce that was granted but will never be consumed. The
    /// counter is not rewound; everything granted after it stays blocked
    /// downstream until an operator resyncs.
    pub fn record_abandoned(&mut self, key: &PartitionKey, nonce: u64) -> bool {
        let Some(counter) = self.counters.get_mut(key) else {
            warn!("Abandoned nonce {} reported for unknown partition {}", nonce, key);
            return false;
        };
        if nonce >= counter.next {
            warn!(
                "Abandoned nonce {} on partition {} was never granted",
                nonce, key
            );
            return false;
        }

        counter.abandoned.insert(nonce)
    }

    pub fn abandoned(&self, key: &PartitionKey) -> Vec<u64> {
        self.counters
            .get(key)
            .map(|counter| counter.abandoned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn peek(&self, key: &PartitionKey) -> Option<u64> {
        self.counters.get(key).map(|counter| counter.next)
    }

    pub fn granted(&self, key: &PartitionKey) -> u64 {
        self.counters.get(key).map(|counter| counter.granted).unwrap_or(0)
    }

    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.counters.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> PartitionKey {
        PartitionKey::new(name)
    }

    #[test]
    fn test_first_request_uses_baseline() {
        let mut allocator = SequenceAllocator::new();
        assert_eq!(allocator.request(&key("8453"), Some(40)).unwrap(), 40);
        // Baseline is ignored once initialised.
        assert_eq!(allocator.request(&key("8453"), Some(0)).unwrap(), 41);
        assert_eq!(allocator.peek(&key("8453")), Some(42));
    }

    #[test]
    fn test_unseen_key_without_baseline() {
        let mut allocator = SequenceAllocator::new();
        assert_eq!(
            allocator.request(&key("1"), None),
            Err(AllocationError::Uninitialized("1".to_string()))
        );
        assert!(!allocator.is_initialized(&key("1")));
    }

    #[test]
    fn test_grants_are_contiguous() {
        let mut allocator = SequenceAllocator::new();
        let nonces: Vec<u64> = (0..100)
            .map(|_| allocator.request(&key("8453"), Some(7)).unwrap())
            .collect();

        assert_eq!(nonces, (7..107).collect::<Vec<u64>>());
        assert_eq!(allocator.granted(&key("8453")), 100);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut allocator = SequenceAllocator::new();
        assert_eq!(allocator.request(&key("a"), Some(0)).unwrap(), 0);
        assert_eq!(allocator.request(&key("b"), Some(100)).unwrap(), 100);
        assert_eq!(allocator.request(&key("a"), None).unwrap(), 1);
        assert_eq!(allocator.request(&key("b"), None).unwrap(), 101);
    }

    #[test]
    fn test_abandoned_nonces_are_recorded_not_reused() {
        let mut allocator = SequenceAllocator::new();
        let first = allocator.request(&key("8453"), Some(5)).unwrap();
        allocator.request(&key("8453"), None).unwrap();

        assert!(allocator.record_abandoned(&key("8453"), first));
        assert!(!allocator.record_abandoned(&key("8453"), 99));
        assert_eq!(allocator.abandoned(&key("8453")), vec![5]);
        assert_eq!(allocator.request(&key("8453"), None).unwrap(), 7);
    }

    #[test]
    fn test_resync_overrides_counter() {
        let mut allocator = SequenceAllocator::new();
        allocator.request(&key("8453"), Some(5)).unwrap();
        allocator.record_abandoned(&key("8453"), 5);

        allocator.resync(&key("8453"), 5);
        assert!(allocator.abandoned(&key("8453")).is_empty());
        assert_eq!(allocator.request(&key("8453"), None).unwrap(), 5);

        allocator.resync(&key("8453"), 20);
        assert_eq!(allocator.request(&key("8453"), None).unwrap(), 20);
    }

    #[test]
    fn test_resync_initialises_unseen_partition() {
        let mut allocator = SequenceAllocator::new();
        allocator.resync(&key("10"), 3);

        assert!(allocator.is_initialized(&key("10")));
        assert_eq!(allocator.peek(&key("10")), Some(3));
        assert_eq!(allocator.granted(&key("10")), 0);
        assert_eq!(allocator.request(&key("10"), Some(50)).unwrap(), 3);
    }

    #[test]
    fn test_resync_keeps_grant_count() {
        let mut allocator = SequenceAllocator::new();
        allocator.request(&key("8453"), Some(0)).unwrap();
        allocator.request(&key("8453"), None).unwrap();

        allocator.resync(&key("8453"), 9);
        assert_eq!(allocator.granted(&key("8453")), 2);
        assert_eq!(allocator.peek(&key("8453")), Some(9));
    }

    #[test]
    fn test_exhausted_counter() {
        let mut allocator = SequenceAllocator::new();
        allocator.resync(&key("x"), u64::MAX);
        assert_eq!(
            allocator.request(&key("x"), None),
            Err(AllocationError::Exhausted("x".to_string()))
        );
    }
}
