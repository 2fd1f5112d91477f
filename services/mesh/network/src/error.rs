//! Network layer error types.

use mesh_crypto::CryptoError;
use mesh_storage::StorageError;
use mesh_wire::WireError;
use thiserror::Error;

/// Network layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// PDU shorter than header, destination, one transport byte and NetMIC
    #[error("network pdu too short: {0} bytes")]
    TooShort(usize),

    /// PDU longer than a network PDU can be
    #[error("network pdu too long: {0} bytes")]
    TooLong(usize),

    /// No network key carries the received NID
    #[error("no network key for nid {0:#04x}")]
    NetKeyNotFound(u8),

    /// Every candidate key failed to authenticate the PDU
    #[error("no valid network key for decryption")]
    NoValidNetKey,

    /// Bit packing failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Cipher failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
