//! Crypto error types.

use thiserror::Error;

/// Errors raised by the cipher layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key is not 16 bytes
    #[error("invalid key length: {0}")]
    KeyLength(usize),

    /// Nonce is not 13 bytes
    #[error("invalid nonce length: {0}")]
    NonceLength(usize),

    /// MIC size other than 4 or 8 bytes
    #[error("unsupported mic size: {0}")]
    MicSize(usize),

    /// ECB input is not a multiple of the block size
    #[error("input not block aligned: {0}")]
    UnalignedInput(usize),

    /// Ciphertext shorter than its MIC
    #[error("ciphertext too short: {0}")]
    Truncated(usize),

    /// MIC did not verify
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Peer public key is not a point on P-256
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The underlying cipher panicked or refused the input
    #[error("cipher failure")]
    Internal,
}
