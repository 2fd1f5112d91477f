//! P-256 key agreement used by the provisioning handshake.

use crate::error::CryptoError;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// Uncompressed public key size without the SEC1 tag (X ‖ Y)
pub const PUBLIC_KEY_SIZE: usize = 64;

/// An ephemeral P-256 key pair
pub struct EcdhKeyPair {
    secret: EphemeralSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EcdhKeyPair {
    /// Generate a fresh key pair from the OS random source
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        // skip the 0x04 uncompressed tag
        public.copy_from_slice(&point.as_bytes()[1..]);
        Self { secret, public }
    }

    /// Public key as X ‖ Y, the layout carried in the Provisioning Public Key PDU
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret (X coordinate) with a peer's X ‖ Y public key
    pub fn shared_secret(&self, peer: &[u8]) -> Result<[u8; 32], CryptoError> {
        if peer.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut sec1 = Vec::with_capacity(PUBLIC_KEY_SIZE + 1);
        sec1.push(0x04);
        sec1.extend_from_slice(peer);
        let peer = PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)?;

        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhKeyPair").finish_non_exhaustive()
    }
}

/// Fill an array from the OS random source
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
