//! Segmentation of upper transport PDUs and the per-transaction reassembly
//! buffer.
//!
//! The buffer only tracks bytes and the received-segment bitmap; keying by
//! `(src, dst, SeqAuth)`, timers and acknowledgments belong to the transport
//! layer that owns the buffers.

use crate::error::WireError;
use crate::header::{MAX_SEG_N, SEGMENT_SIZE};
use bytes::{Bytes, BytesMut};

/// Splits an upper transport PDU into access segments
#[derive(Debug, Clone)]
pub struct Segmenter {
    segment_size: usize,
}

impl Segmenter {
    /// Create a segmenter with the mesh access segment size
    pub fn new() -> Self {
        Self {
            segment_size: SEGMENT_SIZE,
        }
    }

    /// SegN for a PDU of `len` bytes
    pub fn seg_n(&self, len: usize) -> Result<u8, WireError> {
        if len == 0 {
            return Err(WireError::Size(0));
        }
        let seg_n = (len - 1) / self.segment_size;
        if seg_n > MAX_SEG_N as usize {
            return Err(WireError::Size(len));
        }
        Ok(seg_n as u8)
    }

    /// Split `pdu` into at most 32 chunks of `SEGMENT_SIZE` bytes
    pub fn split(&self, pdu: &Bytes) -> Result<Vec<Bytes>, WireError> {
        let seg_n = self.seg_n(pdu.len())?;
        let mut segments = Vec::with_capacity(seg_n as usize + 1);
        let mut offset = 0;
        while offset < pdu.len() {
            let end = std::cmp::min(offset + self.segment_size, pdu.len());
            segments.push(pdu.slice(offset..end));
            offset = end;
        }
        Ok(segments)
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Block-ack mask covering segments `0..=seg_n`
pub fn full_block_mask(seg_n: u8) -> u32 {
    if seg_n >= MAX_SEG_N {
        u32::MAX
    } else {
        (1u32 << (seg_n as u32 + 1)) - 1
    }
}

/// What happened to a segment offered to a [`SarBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    /// Segment already present; nothing copied
    Duplicate,
    /// Segment stored, more missing
    Accepted,
    /// Last missing segment stored; the assembled PDU
    Complete(Bytes),
}

/// Reassembly buffer for one segmented transaction
#[derive(Debug, Clone)]
pub struct SarBuffer {
    seg_n: u8,
    received: u32,
    data: BytesMut,
    total_len: Option<usize>,
    complete: bool,
}

impl SarBuffer {
    /// Buffer sized `(seg_n + 1) × SEGMENT_SIZE`
    pub fn new(seg_n: u8) -> Result<Self, WireError> {
        if seg_n > MAX_SEG_N {
            return Err(WireError::Size(seg_n as usize));
        }
        let capacity = (seg_n as usize + 1) * SEGMENT_SIZE;
        Ok(Self {
            seg_n,
            received: 0,
            data: BytesMut::zeroed(capacity),
            total_len: None,
            complete: false,
        })
    }

    /// SegN this buffer was created for
    pub fn seg_n(&self) -> u8 {
        self.seg_n
    }

    /// Bitmap of received segments
    pub fn block_ack(&self) -> u32 {
        self.received
    }

    /// All segments are present
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Copy a segment into place
    pub fn insert(&mut self, seg_o: u8, segment: &[u8]) -> Result<Insert, WireError> {
        if seg_o > self.seg_n {
            return Err(WireError::Malformed);
        }
        let bit = 1u32 << seg_o;
        if self.received & bit != 0 {
            return Ok(Insert::Duplicate);
        }
        let last = seg_o == self.seg_n;
        // only the last segment may be short
        if segment.is_empty() || segment.len() > SEGMENT_SIZE || (!last && segment.len() != SEGMENT_SIZE) {
            return Err(WireError::Size(segment.len()));
        }

        let offset = seg_o as usize * SEGMENT_SIZE;
        self.data[offset..offset + segment.len()].copy_from_slice(segment);
        if last {
            self.total_len = Some(offset + segment.len());
        }
        self.received |= bit;

        if self.received == full_block_mask(self.seg_n) {
            self.complete = true;
            let len = self.total_len.unwrap_or(self.data.len());
            Ok(Insert::Complete(Bytes::copy_from_slice(&self.data[..len])))
        } else {
            Ok(Insert::Accepted)
        }
    }
}
