//! Cryptographic primitives for the mesh node.
//!
//! Everything the network, transport and provisioning layers need to seal,
//! open and derive keys lives here:
//!
//! - **Block ciphers**: AES-128 ECB (privacy obfuscation), AES-CCM with a
//!   4 or 8 byte MIC, AES-CMAC
//! - **Key derivation**: `s1`, `k1`, `k2`, `k3`, `k4`
//! - **Key agreement**: P-256 ECDH for the provisioning handshake
//!
//! ```text
//! NetworkKey --k2--> (NID, EncryptionKey, PrivacyKey)
//!            --k3--> NetworkID
//!            --k1--> IdentityKey, BeaconKey
//! AppKey     --k4--> AID
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod ecdh;
pub mod error;
pub mod kdf;

pub use cipher::{aes_ccm, aes_ccm_open, aes_cmac, aes_ecb, MicSize, BLOCK_SIZE, NONCE_SIZE};
pub use ecdh::{random_array, EcdhKeyPair, PUBLIC_KEY_SIZE};
pub use error::CryptoError;
pub use kdf::{k1, k2, k3, k4, s1, K2Keys};

/// A 128-bit AES key
pub type Key128 = [u8; 16];
