//! Confirmation and session key derivations shared by both roles.
//!
//! ```text
//! ConfirmationSalt = s1(Invite ‖ Capabilities ‖ Start ‖ PubKeyProv ‖ PubKeyDev)
//! ConfirmationKey  = k1(ECDHSecret, ConfirmationSalt, "prck")
//! Confirmation     = CMAC(ConfirmationKey, Random ‖ AuthValue)
//! ProvisioningSalt = s1(ConfirmationSalt ‖ RandomProv ‖ RandomDev)
//! SessionKey       = k1(ECDHSecret, ProvisioningSalt, "prsk")
//! SessionNonce     = k1(ECDHSecret, ProvisioningSalt, "prsn")[3..]
//! DeviceKey        = k1(ECDHSecret, ProvisioningSalt, "prdk")
//! ```

use mesh_crypto::{aes_ccm, aes_ccm_open, aes_cmac, k1, s1, CryptoError, EcdhKeyPair, Key128, MicSize};
use mesh_wire::{PROVISIONING_DATA_MIC_SIZE, PROVISIONING_DATA_SIZE};

/// Auth value of the no-OOB method
pub(crate) const NO_OOB_AUTH: [u8; 16] = [0u8; 16];

/// Keys derived once both randoms are known
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionKeys {
    pub session_key: Key128,
    pub session_nonce: [u8; 13],
    pub device_key: Key128,
}

impl SessionKeys {
    pub fn seal(
        &self,
        block: &[u8; PROVISIONING_DATA_SIZE],
    ) -> Result<([u8; PROVISIONING_DATA_SIZE], [u8; PROVISIONING_DATA_MIC_SIZE]), CryptoError> {
        let (cipher, mic) = aes_ccm(&self.session_key, &self.session_nonce, block, MicSize::Long)?;
        let mut encrypted = [0u8; PROVISIONING_DATA_SIZE];
        let mut tag = [0u8; PROVISIONING_DATA_MIC_SIZE];
        encrypted.copy_from_slice(&cipher);
        tag.copy_from_slice(&mic);
        Ok((encrypted, tag))
    }

    pub fn open(&self, encrypted: &[u8], mic: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sealed = [encrypted, mic].concat();
        aes_ccm_open(&self.session_key, &self.session_nonce, &sealed, MicSize::Long)
    }
}

/// One side's view of the handshake
#[derive(Debug)]
pub(crate) struct Handshake {
    /// Payloads of Invite, Capabilities, Start and both public keys, in order
    pub inputs: Vec<u8>,
    pub key_pair: EcdhKeyPair,
    pub random: [u8; 16],
    secret: Option<[u8; 32]>,
    confirmation_salt: [u8; 16],
    confirmation_key: [u8; 16],
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            inputs: Vec::with_capacity(1 + 11 + 5 + 64 + 64),
            key_pair: EcdhKeyPair::generate(),
            random: mesh_crypto::random_array(),
            secret: None,
            confirmation_salt: [0u8; 16],
            confirmation_key: [0u8; 16],
        }
    }

    /// ECDH with the peer key, then salt and key from the complete inputs.
    /// Returns the local confirmation value.
    pub fn agree(&mut self, peer_public: &[u8]) -> Result<[u8; 16], CryptoError> {
        let secret = self.key_pair.shared_secret(peer_public)?;
        self.confirmation_salt = s1(&self.inputs)?;
        self.confirmation_key = k1(&secret, &self.confirmation_salt, b"prck")?;
        self.secret = Some(secret);
        self.confirmation_of(&self.random)
    }

    pub fn confirmation_of(&self, random: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
        let mut m = [0u8; 32];
        m[..16].copy_from_slice(random);
        m[16..].copy_from_slice(&NO_OOB_AUTH);
        aes_cmac(&self.confirmation_key, &m)
    }

    /// Whether `peer_random` reproduces `peer_confirmation`
    pub fn verify(&self, peer_random: &[u8; 16], peer_confirmation: &[u8; 16]) -> Result<bool, CryptoError> {
        Ok(&self.confirmation_of(peer_random)? == peer_confirmation)
    }

    pub fn session_keys(
        &self,
        provisioner_random: &[u8; 16],
        device_random: &[u8; 16],
    ) -> Result<SessionKeys, CryptoError> {
        let secret = self.secret.ok_or(CryptoError::InvalidPublicKey)?;
        let mut m = [0u8; 48];
        m[..16].copy_from_slice(&self.confirmation_salt);
        m[16..32].copy_from_slice(provisioner_random);
        m[32..].copy_from_slice(device_random);
        let salt = s1(&m)?;

        let nonce = k1(&secret, &salt, b"prsn")?;
        let mut session_nonce = [0u8; 13];
        session_nonce.copy_from_slice(&nonce[3..]);
        Ok(SessionKeys {
            session_key: k1(&secret, &salt, b"prsk")?,
            session_nonce,
            device_key: k1(&secret, &salt, b"prdk")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{ProvisioningData, ProvisioningFlags};

    fn pair() -> (Handshake, Handshake) {
        let mut a = Handshake::new();
        let mut b = Handshake::new();
        let shared = b"invite caps start".to_vec();
        let (pa, pb) = (*a.key_pair.public_key(), *b.key_pair.public_key());
        for side in [&mut a, &mut b] {
            side.inputs.extend_from_slice(&shared);
            side.inputs.extend_from_slice(&pa);
            side.inputs.extend_from_slice(&pb);
        }
        (a, b)
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let (mut a, mut b) = pair();
        let conf_a = a.agree(b.key_pair.public_key()).unwrap();
        let conf_b = b.agree(a.key_pair.public_key()).unwrap();

        assert!(b.verify(&a.random, &conf_a).unwrap());
        assert!(a.verify(&b.random, &conf_b).unwrap());
        assert!(!a.verify(&a.random, &conf_b).unwrap());

        let keys_a = a.session_keys(&a.random, &b.random).unwrap();
        let keys_b = b.session_keys(&a.random, &b.random).unwrap();
        assert_eq!(keys_a, keys_b);
    }

    #[test]
    fn test_provisioning_data_seal_open() {
        let (mut a, mut b) = pair();
        a.agree(b.key_pair.public_key()).unwrap();
        b.agree(a.key_pair.public_key()).unwrap();
        let keys = a.session_keys(&a.random, &b.random).unwrap();

        let data = ProvisioningData {
            net_key: [0x11; 16],
            key_index: 0,
            flags: ProvisioningFlags::IV_UPDATE,
            iv_index: 0x1234_5678,
            unicast_address: 0x0100,
        };
        let (encrypted, mic) = keys.seal(&data.encode().unwrap()).unwrap();
        let opened = b.session_keys(&a.random, &b.random).unwrap().open(&encrypted, &mic).unwrap();
        assert_eq!(ProvisioningData::decode(&opened).unwrap(), data);

        let mut bad = mic;
        bad[0] ^= 1;
        assert_eq!(keys.open(&encrypted, &bad), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_session_keys_need_secret() {
        let a = Handshake::new();
        assert!(a.session_keys(&[0; 16], &[0; 16]).is_err());
    }
}
