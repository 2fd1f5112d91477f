//! Reassembly table of the transport worker.

use crate::error::TransportError;
use bytes::Bytes;
use mesh_wire::{full_block_mask, Insert, SarBuffer};
use std::collections::HashMap;

/// Identity of one segmented transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SarKey {
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Reconstructed SeqAuth
    pub seq_auth: u32,
}

#[derive(Debug)]
struct SarEntry {
    buffer: SarBuffer,
    net_key_index: u16,
    generation: u64,
}

/// Result of offering a segment to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SarOutcome {
    /// First segment of a new transaction; arm the idle timer for `generation`
    Started {
        /// Block-ack to send back
        block_ack: u32,
        /// Generation of the new entry
        generation: u64,
    },
    /// Stored, more segments missing
    Accepted {
        /// Block-ack to send back
        block_ack: u32,
    },
    /// Already had this segment, or the transaction already completed
    Duplicate {
        /// Block-ack to send back
        block_ack: u32,
    },
    /// All segments present; arm the completion timer for `generation`
    Complete {
        /// Block-ack to send back
        block_ack: u32,
        /// Assembled upper transport PDU
        pdu: Bytes,
        /// Generation after completion
        generation: u64,
    },
    /// Table is full; segment dropped without an ack
    Full,
}

/// In-progress and recently completed reassemblies
#[derive(Debug)]
pub struct SarTable {
    entries: HashMap<SarKey, SarEntry>,
    capacity: usize,
    next_generation: u64,
}

impl SarTable {
    /// Table holding at most `capacity` transactions
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            next_generation: 0,
        }
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Offer segment `seg_o` of `seg_n` received under `net_key_index`
    pub fn insert(
        &mut self,
        key: SarKey,
        net_key_index: u16,
        seg_o: u8,
        seg_n: u8,
        segment: &[u8],
    ) -> Result<SarOutcome, TransportError> {
        let mut started = None;
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.capacity {
                return Ok(SarOutcome::Full);
            }
            let generation = self.generation();
            self.entries.insert(
                key,
                SarEntry {
                    buffer: SarBuffer::new(seg_n)?,
                    net_key_index,
                    generation,
                },
            );
            started = Some(generation);
        }

        let entry = match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return Err(TransportError::SarFailed { src: key.src }),
        };
        if entry.buffer.seg_n() != seg_n || entry.net_key_index != net_key_index {
            self.entries.remove(&key);
            return Err(TransportError::SarFailed { src: key.src });
        }
        if entry.buffer.is_complete() {
            return Ok(SarOutcome::Duplicate {
                block_ack: full_block_mask(seg_n),
            });
        }

        let inserted = match entry.buffer.insert(seg_o, segment) {
            Ok(inserted) => inserted,
            Err(e) => {
                if started.is_some() {
                    self.entries.remove(&key);
                }
                return Err(e.into());
            }
        };
        let block_ack = entry.buffer.block_ack();
        Ok(match inserted {
            Insert::Complete(pdu) => {
                self.next_generation += 1;
                entry.generation = self.next_generation;
                SarOutcome::Complete {
                    block_ack,
                    pdu,
                    generation: entry.generation,
                }
            }
            Insert::Duplicate => SarOutcome::Duplicate { block_ack },
            Insert::Accepted => match started {
                Some(generation) => SarOutcome::Started { block_ack, generation },
                None => SarOutcome::Accepted { block_ack },
            },
        })
    }

    /// Drop `key` if its timer is still the current one
    pub fn expire(&mut self, key: &SarKey, generation: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of tracked transactions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: SarKey = SarKey {
        src: 0x0003,
        dst: 0x1201,
        seq_auth: 0x3129ab,
    };

    #[test]
    fn test_started_then_complete() {
        let mut table = SarTable::new(4);
        let first = table.insert(KEY, 0, 1, 1, &[2u8; 5]).unwrap();
        let generation = match first {
            SarOutcome::Started { block_ack, generation } => {
                assert_eq!(block_ack, 0b10);
                generation
            }
            other => panic!("unexpected {:?}", other),
        };

        match table.insert(KEY, 0, 0, 1, &[1u8; 12]).unwrap() {
            SarOutcome::Complete { block_ack, pdu, generation: done } => {
                assert_eq!(block_ack, 0b11);
                assert_eq!(pdu.len(), 17);
                assert_ne!(done, generation);
                // the idle timer armed on creation no longer applies
                assert!(!table.expire(&KEY, generation));
                assert!(table.expire(&KEY, done));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_late_duplicate_after_completion() {
        let mut table = SarTable::new(4);
        table.insert(KEY, 0, 0, 0, &[1u8; 8]).unwrap();
        assert_eq!(
            table.insert(KEY, 0, 0, 0, &[1u8; 8]).unwrap(),
            SarOutcome::Duplicate { block_ack: 0b1 }
        );
    }

    #[test]
    fn test_mismatch_aborts_transaction() {
        let mut table = SarTable::new(4);
        table.insert(KEY, 0, 0, 2, &[1u8; 12]).unwrap();
        assert_eq!(
            table.insert(KEY, 0, 1, 3, &[1u8; 12]),
            Err(TransportError::SarFailed { src: 0x0003 })
        );
        assert!(table.is_empty());

        table.insert(KEY, 0, 0, 2, &[1u8; 12]).unwrap();
        assert_eq!(
            table.insert(KEY, 1, 1, 2, &[1u8; 12]),
            Err(TransportError::SarFailed { src: 0x0003 })
        );
    }

    #[test]
    fn test_capacity() {
        let mut table = SarTable::new(1);
        table.insert(KEY, 0, 0, 1, &[1u8; 12]).unwrap();
        let other = SarKey { seq_auth: 1, ..KEY };
        assert_eq!(table.insert(other, 0, 0, 1, &[1u8; 12]).unwrap(), SarOutcome::Full);
    }
}
