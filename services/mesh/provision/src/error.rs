//! Provisioning error types.

use crate::session::ProvisioningState;
use mesh_crypto::CryptoError;
use mesh_storage::StorageError;
use mesh_wire::{FailureCode, ProvPduType, WireError};
use thiserror::Error;

/// Errors that end a provisioning session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Peer sent Provisioning Failed
    #[error("peer reported failure: {0:?}")]
    RemoteFailed(FailureCode),

    /// PDU of the wrong type for the current state
    #[error("unexpected {got:?} pdu in state {state:?}")]
    UnexpectedPdu {
        /// State the session was in
        state: ProvisioningState,
        /// Type that arrived
        got: ProvPduType,
    },

    /// PDU other than the one the device waits for
    #[error("expected {expected:?} pdu, got {got:?}")]
    OutOfOrder {
        /// Type the device waits for
        expected: ProvPduType,
        /// Type that arrived
        got: ProvPduType,
    },

    /// PDU could not be parsed or had the wrong length
    #[error("malformed pdu: {0}")]
    Malformed(WireError),

    /// Capabilities or Start outside what this node supports
    #[error("unsupported parameters: {0}")]
    Unsupported(&'static str),

    /// Peer random does not reproduce the peer confirmation
    #[error("confirmation mismatch")]
    ConfirmationFailed,

    /// Provisioning data did not authenticate
    #[error("provisioning data decryption failed")]
    DecryptionFailed,

    /// Nothing arrived within the per-PDU timeout
    #[error("timed out in state {0:?}")]
    Timeout(ProvisioningState),

    /// Another session is in flight
    #[error("provisioning session already active")]
    Busy,

    /// Session used after it completed or failed
    #[error("session is {0:?}")]
    Closed(ProvisioningState),

    /// Provisioning queue of the bearer is gone
    #[error("provisioning bearer stopped")]
    Stopped,

    /// Bearer write failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Cipher failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ProvisionError {
    /// Error code a device reports for this failure
    pub fn failure_code(&self) -> FailureCode {
        match self {
            ProvisionError::UnexpectedPdu { .. } | ProvisionError::OutOfOrder { .. } | ProvisionError::Closed(_) => {
                FailureCode::UnexpectedPdu
            }
            ProvisionError::Malformed(WireError::Type(_)) => FailureCode::InvalidPdu,
            ProvisionError::Malformed(_) | ProvisionError::Unsupported(_) => FailureCode::InvalidFormat,
            ProvisionError::ConfirmationFailed => FailureCode::ConfirmationFailed,
            ProvisionError::DecryptionFailed => FailureCode::DecryptionFailed,
            ProvisionError::Storage(StorageError::AddressSpaceExhausted) => FailureCode::CannotAssignAddresses,
            _ => FailureCode::UnexpectedError,
        }
    }
}
