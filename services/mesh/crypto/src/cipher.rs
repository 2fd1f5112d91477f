//! AES-ECB, AES-CCM and AES-CMAC.
//!
//! All entry points validate key and nonce sizes up front and run the cipher
//! under a panic guard, so a misbehaving primitive surfaces as
//! [`CryptoError::Internal`] instead of unwinding through a layer worker.

use crate::error::CryptoError;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::Aes128;
use ccm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use std::panic::{self, AssertUnwindSafe};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Mesh CCM nonce size in bytes
pub const NONCE_SIZE: usize = 13;

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// Size of the message integrity check appended by CCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC (access NetMIC, default TransMIC)
    Short,
    /// 64-bit MIC (control NetMIC, SZMIC=1 TransMIC, provisioning data)
    Long,
}

impl MicSize {
    /// MIC length in bytes
    pub const fn len(self) -> usize {
        match self {
            MicSize::Short => 4,
            MicSize::Long => 8,
        }
    }

    /// NetMIC size selected by the CTL bit
    pub const fn for_ctl(ctl: bool) -> Self {
        if ctl {
            MicSize::Long
        } else {
            MicSize::Short
        }
    }

    /// TransMIC size selected by the SZMIC bit
    pub const fn for_szmic(szmic: bool) -> Self {
        Self::for_ctl(szmic)
    }
}

impl TryFrom<usize> for MicSize {
    type Error = CryptoError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(MicSize::Short),
            8 => Ok(MicSize::Long),
            other => Err(CryptoError::MicSize(other)),
        }
    }
}

fn guarded<T>(op: impl FnOnce() -> Result<T, CryptoError>) -> Result<T, CryptoError> {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(_) => Err(CryptoError::Internal),
    }
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != 16 {
        return Err(CryptoError::KeyLength(key.len()));
    }
    Ok(())
}

fn check_nonce(nonce: &[u8]) -> Result<(), CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::NonceLength(nonce.len()));
    }
    Ok(())
}

/// Encrypt block-aligned `data` with AES-128 in ECB mode.
pub fn aes_ecb(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedInput(data.len()));
    }
    guarded(|| {
        let cipher = Aes128::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
        let mut out = data.to_vec();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    })
}

fn seal_with<A: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = A::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<A>::from_slice(nonce), b"", &mut buffer)
        .map_err(|_| CryptoError::Internal)?;
    Ok((buffer, tag.to_vec()))
}

fn open_with<A: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = A::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::<A>::from_slice(nonce), b"", &mut buffer, Tag::<A>::from_slice(tag))
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buffer)
}

/// AES-CCM seal with empty associated data. Returns `(ciphertext, mic)`.
pub fn aes_ccm(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    mic: MicSize,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    check_key(key)?;
    check_nonce(nonce)?;
    guarded(|| match mic {
        MicSize::Short => seal_with::<Ccm32>(key, nonce, plaintext),
        MicSize::Long => seal_with::<Ccm64>(key, nonce, plaintext),
    })
}

/// AES-CCM open of `ciphertext ‖ mic`.
pub fn aes_ccm_open(
    key: &[u8],
    nonce: &[u8],
    sealed: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    check_nonce(nonce)?;
    if sealed.len() < mic.len() {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - mic.len());
    guarded(|| match mic {
        MicSize::Short => open_with::<Ccm32>(key, nonce, ciphertext, tag),
        MicSize::Long => open_with::<Ccm64>(key, nonce, ciphertext, tag),
    })
}

/// AES-CMAC over `data`.
pub fn aes_cmac(key: &[u8], data: &[u8]) -> Result<[u8; 16], CryptoError> {
    check_key(key)?;
    guarded(|| {
        let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
            .map_err(|_| CryptoError::KeyLength(key.len()))?;
        mac.update(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_ccm_provisioning_data_vector() {
        let key = h("c80253af86b33dfa450bbdb2a191fea3");
        let nonce = h("da7ddbe78b5f62b81d6847487e");
        let plaintext = h("efb2255e6422d330088e09bb015ed707056700010203040b0c");

        let (ciphertext, tag) = aes_ccm(&key, &nonce, &plaintext, MicSize::Long).unwrap();
        assert_eq!(ciphertext, h("d0bd7f4a89a2ff6222af59a90a60ad58acfe3123356f5cec29"));
        assert_eq!(tag, h("73e0ec50783b10c7"));

        let sealed = [ciphertext, tag].concat();
        let opened = aes_ccm_open(&key, &nonce, &sealed, MicSize::Long).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_ccm_open_rejects_tampering() {
        let key = h("c80253af86b33dfa450bbdb2a191fea3");
        let nonce = h("da7ddbe78b5f62b81d6847487e");
        let (ciphertext, tag) = aes_ccm(&key, &nonce, b"hello mesh", MicSize::Short).unwrap();
        assert_eq!(tag.len(), 4);

        let mut sealed = [ciphertext, tag].concat();
        sealed[0] ^= 0x01;
        assert_eq!(
            aes_ccm_open(&key, &nonce, &sealed, MicSize::Short),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_ccm_rejects_bad_sizes() {
        let key = [0u8; 16];
        assert_eq!(
            aes_ccm(&key, &[0u8; 12], b"x", MicSize::Short),
            Err(CryptoError::NonceLength(12))
        );
        assert_eq!(
            aes_ccm(&[0u8; 15], &[0u8; 13], b"x", MicSize::Short),
            Err(CryptoError::KeyLength(15))
        );
        assert_eq!(
            aes_ccm_open(&key, &[0u8; 13], &[1, 2, 3], MicSize::Short),
            Err(CryptoError::Truncated(3))
        );
        assert_eq!(MicSize::try_from(6), Err(CryptoError::MicSize(6)));
    }

    #[test]
    fn test_ecb_privacy_block() {
        let key = h("8b84eedec100067d670971dd2aa700cf");
        let mut block = vec![0u8; 5];
        block.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        block.extend_from_slice(&h("b5e5bfdacbaf6c"));

        let pecb = aes_ecb(&key, &block).unwrap();
        assert_eq!(&pecb[..6], &h("6ca487507564")[..]);
        assert_eq!(aes_ecb(&key, &[0u8; 15]), Err(CryptoError::UnalignedInput(15)));
    }
}
