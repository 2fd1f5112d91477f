//! Network PDU replay cache.

use bytes::Bytes;
use std::collections::{HashSet, VecDeque};

/// Default number of remembered PDUs
pub const DEFAULT_REPLAY_CACHE_SIZE: usize = 50;

/// Bounded FIFO of raw network PDUs seen recently.
///
/// A flooding bearer delivers the same PDU several times; the cache lets the
/// network layer drop the copies before attempting any decryption.
#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    order: VecDeque<Bytes>,
    seen: HashSet<Bytes>,
}

impl ReplayCache {
    /// Cache remembering at most `capacity` PDUs
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `pdu`; returns false if it was already present
    pub fn check_and_insert(&mut self, pdu: &[u8]) -> bool {
        if self.seen.contains(pdu) {
            return false;
        }
        let pdu = Bytes::copy_from_slice(pdu);
        self.seen.insert(pdu.clone());
        self.order.push_back(pdu);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    /// Number of remembered PDUs
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detected() {
        let mut cache = ReplayCache::default();
        assert!(cache.check_and_insert(&[1, 2, 3]));
        assert!(!cache.check_and_insert(&[1, 2, 3]));
        assert!(cache.check_and_insert(&[1, 2, 4]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut cache = ReplayCache::new(3);
        for i in 0u8..4 {
            assert!(cache.check_and_insert(&[i]));
        }
        assert_eq!(cache.len(), 3);
        // [0] was evicted, [1] is still remembered
        assert!(!cache.check_and_insert(&[1]));
        assert!(cache.check_and_insert(&[0]));
        assert_eq!(cache.len(), 3);
    }
}
