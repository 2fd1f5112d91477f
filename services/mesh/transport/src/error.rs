//! Transport layer error types.

use mesh_crypto::CryptoError;
use mesh_network::NetworkError;
use mesh_storage::StorageError;
use mesh_wire::WireError;
use thiserror::Error;

/// Transport layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Segment disagrees with its transaction (SegN or network key)
    #[error("segmented transaction from {src:#06x} aborted")]
    SarFailed {
        /// Source of the transaction
        src: u16,
    },

    /// No application or device key authenticated the PDU
    #[error("no valid application key for decryption")]
    NoValidAppKey,

    /// Key material needed to send is not in the key store
    #[error("missing key material: {0}")]
    MissingKey(String),

    /// The block-ack mask was not completed within the retry budget
    #[error("segmented send to {dst:#06x} timed out")]
    Timeout {
        /// Destination of the transaction
        dst: u16,
    },

    /// Pending transaction table is full
    #[error("too many pending segmented transactions")]
    Busy,

    /// Upper transport PDU does not fit 32 segments
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Worker tasks are gone
    #[error("transport layer stopped")]
    Stopped,

    /// Bit packing failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Cipher failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network layer failure
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}
