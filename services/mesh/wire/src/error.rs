//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Field plan is inconsistent (more than one variable field, misplaced optional, width > 64)
    #[error("invalid field plan: {0}")]
    Plan(&'static str),

    /// No value supplied for a mandatory field
    #[error("missing value for {0}")]
    MissingValue(&'static str),

    /// More values supplied than the plan has fields
    #[error("too many values: {0}")]
    TooManyValues(usize),

    /// Value does not fit the field width
    #[error("value overflows {0}")]
    Overflow(&'static str),

    /// Value kind does not match the field kind
    #[error("wrong value kind for {0}")]
    Kind(&'static str),

    /// Input length does not match the plan, in bits
    #[error("length mismatch: expected {expected} bits, got {actual}")]
    Length {
        /// Bits the plan requires
        expected: usize,
        /// Bits available
        actual: usize,
    },

    /// Remainder is not a whole number of elements
    #[error("remainder of {0} not element aligned")]
    Remainder(&'static str),

    /// Encoded bit count is not a whole number of bytes
    #[error("unaligned encoding: {0} bits")]
    Unaligned(usize),

    /// Field name not present in a decoded record
    #[error("no field {0}")]
    Field(&'static str),

    /// Unknown PDU type
    #[error("unknown type {0}")]
    Type(u8),

    /// PDU payload length differs from what its type requires
    #[error("bad length for type {pdu_type}: {len}")]
    PduLength {
        /// PDU type octet
        pdu_type: u8,
        /// Payload length received
        len: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Incomplete PDU (need more data)
    #[error("incomplete pdu")]
    Incomplete,

    /// Malformed PDU structure
    #[error("malformed pdu")]
    Malformed,

    /// Bearer has no write handle or is stopped
    #[error("bearer not ready")]
    NotReady,

    /// Write handle reported a failure
    #[error("bearer write failed: {0}")]
    Write(String),
}
