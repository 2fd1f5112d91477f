//! Network and lower transport headers.
//!
//! ```text
//! Network PDU
//! +-----+-----+-----+-----+------+------+---------------------+--------+
//! | IVI | NID | CTL | TTL | SEQ  | SRC  | DST ‖ TransportPDU  | NetMIC |
//! | 1b  | 7b  | 1b  | 7b  | 24b  | 16b  | encrypted           | 32/64b |
//! +-----+-----+-----+-----+------+------+---------------------+--------+
//!              \_____ obfuscated _____/
//! ```

use crate::codec::{Endian, Field, FieldPlan, Value};
use crate::error::WireError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Largest upper transport PDU sent unsegmented
pub const MAX_UNSEGMENTED_PDU: usize = 15;

/// Upper transport bytes carried by one access segment
pub const SEGMENT_SIZE: usize = 12;

/// Highest SegN value (32 segments)
pub const MAX_SEG_N: u8 = 31;

/// Control opcode of the Segment Acknowledgment message
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

const NETWORK_HEADER: FieldPlan = FieldPlan::new(&[
    Field::uint("ivi", 1),
    Field::uint("nid", 7),
    Field::uint("ctl", 1),
    Field::uint("ttl", 7),
    Field::uint("seq", 24),
    Field::uint("src", 16),
]);

const UNSEGMENTED_ACCESS: FieldPlan = FieldPlan::new(&[
    Field::uint("seg", 1),
    Field::uint("akf", 1),
    Field::uint("aid", 6),
    Field::remainder("upper", 8),
]);

const SEGMENTED_ACCESS: FieldPlan = FieldPlan::new(&[
    Field::uint("seg", 1),
    Field::uint("akf", 1),
    Field::uint("aid", 6),
    Field::uint("szmic", 1),
    Field::uint("seq_zero", 13),
    Field::uint("seg_o", 5),
    Field::uint("seg_n", 5),
    Field::remainder("segment", 8),
]);

const SEGMENT_ACK: FieldPlan = FieldPlan::new(&[
    Field::uint("seg", 1),
    Field::uint("opcode", 7),
    Field::uint("obo", 1),
    Field::uint("seq_zero", 13),
    Field::reserved(2),
    Field::uint("block_ack", 32),
]);

const UNSEGMENTED_CONTROL: FieldPlan = FieldPlan::new(&[
    Field::uint("seg", 1),
    Field::uint("opcode", 7),
    Field::remainder("params", 8),
]);

const SEGMENTED_CONTROL: FieldPlan = FieldPlan::new(&[
    Field::uint("seg", 1),
    Field::uint("opcode", 7),
    Field::reserved(1),
    Field::uint("seq_zero", 13),
    Field::uint("seg_o", 5),
    Field::uint("seg_n", 5),
    Field::remainder("segment", 8),
]);

/// Cleartext view of the first seven bytes of a network PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// Least significant bit of the IV index
    pub ivi: u8,
    /// Network key identifier
    pub nid: u8,
    /// Control message flag
    pub ctl: bool,
    /// Time to live
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source address
    pub src: u16,
}

impl NetworkHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 7;

    /// Pack the header
    pub fn encode(&self) -> Result<[u8; Self::SIZE], WireError> {
        let bytes = NETWORK_HEADER.encode(
            Endian::Big,
            &[
                Value::from(self.ivi),
                Value::from(self.nid),
                Value::from(self.ctl),
                Value::from(self.ttl),
                Value::from(self.seq),
                Value::from(self.src),
            ],
        )?;
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Unpack the header from the first seven bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE {
            return Err(WireError::Incomplete);
        }
        let d = NETWORK_HEADER.decode(Endian::Big, &buf[..Self::SIZE])?;
        Ok(Self {
            ivi: d.uint("ivi")? as u8,
            nid: d.uint("nid")? as u8,
            ctl: d.uint("ctl")? == 1,
            ttl: d.uint("ttl")? as u8,
            seq: d.uint("seq")? as u32,
            src: d.uint("src")? as u16,
        })
    }
}

/// Segment Acknowledgment control message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of a Low Power Node
    pub obo: bool,
    /// Low 13 bits of the acknowledged transaction's SeqAuth
    pub seq_zero: u16,
    /// Bit n set when segment n was received
    pub block_ack: u32,
}

/// Lower transport PDU, selected by the network CTL bit and the SEG bit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Whole upper transport access PDU
    UnsegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Encrypted upper transport PDU including TransMIC
        upper: Bytes,
    },
    /// One segment of an upper transport access PDU
    SegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// 64-bit TransMIC flag
        szmic: bool,
        /// Low 13 bits of SeqAuth
        seq_zero: u16,
        /// Index of this segment
        seg_o: u8,
        /// Index of the last segment
        seg_n: u8,
        /// Segment bytes
        segment: Bytes,
    },
    /// Segment Acknowledgment
    SegmentAck(SegmentAck),
    /// Any other unsegmented control message
    UnsegmentedControl {
        /// Control opcode
        opcode: u8,
        /// Parameters
        params: Bytes,
    },
    /// Segment of a control message
    SegmentedControl {
        /// Control opcode
        opcode: u8,
        /// Low 13 bits of SeqAuth
        seq_zero: u16,
        /// Index of this segment
        seg_o: u8,
        /// Index of the last segment
        seg_n: u8,
        /// Segment bytes
        segment: Bytes,
    },
}

impl LowerTransportPdu {
    /// Parse a transport PDU given the CTL bit of the carrying network PDU
    pub fn decode(ctl: bool, pdu: &[u8]) -> Result<Self, WireError> {
        let first = *pdu.first().ok_or(WireError::Incomplete)?;
        let seg = first & 0x80 != 0;

        match (ctl, seg) {
            (false, false) => {
                let d = UNSEGMENTED_ACCESS.decode(Endian::Big, pdu)?;
                Ok(Self::UnsegmentedAccess {
                    akf: d.uint("akf")? == 1,
                    aid: d.uint("aid")? as u8,
                    upper: Bytes::from(d.bytes("upper")?),
                })
            }
            (false, true) => {
                let d = SEGMENTED_ACCESS.decode(Endian::Big, pdu)?;
                let seg_o = d.uint("seg_o")? as u8;
                let seg_n = d.uint("seg_n")? as u8;
                if seg_o > seg_n {
                    return Err(WireError::Malformed);
                }
                Ok(Self::SegmentedAccess {
                    akf: d.uint("akf")? == 1,
                    aid: d.uint("aid")? as u8,
                    szmic: d.uint("szmic")? == 1,
                    seq_zero: d.uint("seq_zero")? as u16,
                    seg_o,
                    seg_n,
                    segment: Bytes::from(d.bytes("segment")?),
                })
            }
            (true, false) if first & 0x7f == SEGMENT_ACK_OPCODE => {
                let d = SEGMENT_ACK.decode(Endian::Big, pdu)?;
                Ok(Self::SegmentAck(SegmentAck {
                    obo: d.uint("obo")? == 1,
                    seq_zero: d.uint("seq_zero")? as u16,
                    block_ack: d.uint("block_ack")? as u32,
                }))
            }
            (true, false) => {
                let d = UNSEGMENTED_CONTROL.decode(Endian::Big, pdu)?;
                Ok(Self::UnsegmentedControl {
                    opcode: d.uint("opcode")? as u8,
                    params: Bytes::from(d.bytes("params")?),
                })
            }
            (true, true) => {
                let d = SEGMENTED_CONTROL.decode(Endian::Big, pdu)?;
                Ok(Self::SegmentedControl {
                    opcode: d.uint("opcode")? as u8,
                    seq_zero: d.uint("seq_zero")? as u16,
                    seg_o: d.uint("seg_o")? as u8,
                    seg_n: d.uint("seg_n")? as u8,
                    segment: Bytes::from(d.bytes("segment")?),
                })
            }
        }
    }

    /// Whether the PDU travels with CTL=1
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::SegmentAck(_) | Self::UnsegmentedControl { .. } | Self::SegmentedControl { .. }
        )
    }

    /// Pack the PDU
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let bytes = match self {
            Self::UnsegmentedAccess { akf, aid, upper } => UNSEGMENTED_ACCESS.encode(
                Endian::Big,
                &[Value::from(0u8), Value::from(*akf), Value::from(*aid), Value::bytes(upper)],
            )?,
            Self::SegmentedAccess { akf, aid, szmic, seq_zero, seg_o, seg_n, segment } => {
                SEGMENTED_ACCESS.encode(
                    Endian::Big,
                    &[
                        Value::from(1u8),
                        Value::from(*akf),
                        Value::from(*aid),
                        Value::from(*szmic),
                        Value::from(*seq_zero),
                        Value::from(*seg_o),
                        Value::from(*seg_n),
                        Value::bytes(segment),
                    ],
                )?
            }
            Self::SegmentAck(ack) => SEGMENT_ACK.encode(
                Endian::Big,
                &[
                    Value::from(0u8),
                    Value::from(SEGMENT_ACK_OPCODE),
                    Value::from(ack.obo),
                    Value::from(ack.seq_zero),
                    Value::from(ack.block_ack),
                ],
            )?,
            Self::UnsegmentedControl { opcode, params } => UNSEGMENTED_CONTROL.encode(
                Endian::Big,
                &[Value::from(0u8), Value::from(*opcode), Value::bytes(params)],
            )?,
            Self::SegmentedControl { opcode, seq_zero, seg_o, seg_n, segment } => {
                SEGMENTED_CONTROL.encode(
                    Endian::Big,
                    &[
                        Value::from(1u8),
                        Value::from(*opcode),
                        Value::from(*seq_zero),
                        Value::from(*seg_o),
                        Value::from(*seg_n),
                        Value::bytes(segment),
                    ],
                )?
            }
        };
        Ok(Bytes::from(bytes))
    }
}

/// Rebuild SeqAuth from the 24-bit network SEQ and the 13-bit SeqZero.
pub fn seq_auth(seq: u32, seq_zero: u16) -> u32 {
    let candidate = (seq & 0x00ff_e000) | (seq_zero as u32 & 0x1fff);
    if candidate > seq {
        candidate.wrapping_sub(0x2000) & 0x00ff_ffff
    } else {
        candidate
    }
}

/// Low 13 bits of a SeqAuth
pub fn seq_zero(seq_auth: u32) -> u16 {
    (seq_auth & 0x1fff) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_network_header_pack_unpack() {
        let header = NetworkHeader { ivi: 0, nid: 0x68, ctl: false, ttl: 4, seq: 0x3129ab, src: 0x0003 };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, [0x68, 0x04, 0x31, 0x29, 0xab, 0x00, 0x03]);
        assert_eq!(NetworkHeader::decode(&bytes).unwrap(), header);
        assert_eq!(NetworkHeader::decode(&bytes[..6]), Err(WireError::Incomplete));
    }

    #[test]
    fn test_segmented_access_header() {
        let pdu = h("8026ac21cfdc18c52fdef772e0e17308");
        let decoded = LowerTransportPdu::decode(false, &pdu).unwrap();
        match &decoded {
            LowerTransportPdu::SegmentedAccess { akf, aid, szmic, seq_zero, seg_o, seg_n, segment } => {
                assert!(!akf);
                assert_eq!(*aid, 0);
                assert!(!szmic);
                assert_eq!(*seq_zero, 0x09ab);
                assert_eq!(*seg_o, 1);
                assert_eq!(*seg_n, 1);
                assert_eq!(segment.len(), SEGMENT_SIZE);
            }
            other => panic!("unexpected pdu {:?}", other),
        }
        assert_eq!(decoded.encode().unwrap().to_vec(), pdu);
    }

    #[test]
    fn test_segment_ack_layout() {
        let pdu = h("00a6ac00000003");
        let decoded = LowerTransportPdu::decode(true, &pdu).unwrap();
        assert_eq!(
            decoded,
            LowerTransportPdu::SegmentAck(SegmentAck { obo: true, seq_zero: 0x09ab, block_ack: 3 })
        );
        assert!(decoded.is_control());
        assert_eq!(decoded.encode().unwrap().to_vec(), pdu);
    }

    #[test]
    fn test_unsegmented_access_and_control() {
        let access = LowerTransportPdu::UnsegmentedAccess {
            akf: true,
            aid: 0x26,
            upper: Bytes::from_static(&[0x5a, 0x8b, 0xde, 0x6d, 0x91]),
        };
        let bytes = access.encode().unwrap();
        assert_eq!(bytes[0], 0x66);
        assert_eq!(LowerTransportPdu::decode(false, &bytes).unwrap(), access);

        let heartbeat = LowerTransportPdu::decode(true, &h("0a0000")).unwrap();
        assert_eq!(
            heartbeat,
            LowerTransportPdu::UnsegmentedControl { opcode: 0x0a, params: Bytes::from_static(&[0, 0]) }
        );
        assert_eq!(LowerTransportPdu::decode(false, &[]), Err(WireError::Incomplete));
    }

    #[test]
    fn test_seq_auth_reconstruction() {
        assert_eq!(seq_auth(0x3129ab, 0x09ab), 0x3129ab);
        assert_eq!(seq_auth(0x3129ac, 0x09ab), 0x3129ab);
        // SeqZero from before a 13-bit rollover
        assert_eq!(seq_auth(0x004002, 0x1ffe), 0x003ffe);
        assert_eq!(seq_zero(0x3129ab), 0x09ab);
    }
}
