//! Mesh key derivation functions.

use crate::cipher::aes_cmac;
use crate::error::CryptoError;

const ZERO_KEY: [u8; 16] = [0u8; 16];

/// Output of [`k2`]: the network key identifier and the two derived keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Keys {
    /// 7-bit network key identifier
    pub nid: u8,
    /// Network layer encryption key
    pub encryption_key: [u8; 16],
    /// Header obfuscation key
    pub privacy_key: [u8; 16],
}

/// Salt generation: `CMAC(0^128, m)`.
pub fn s1(m: &[u8]) -> Result<[u8; 16], CryptoError> {
    aes_cmac(&ZERO_KEY, m)
}

/// `CMAC(CMAC(salt, n), p)`.
pub fn k1(n: &[u8], salt: &[u8], p: &[u8]) -> Result<[u8; 16], CryptoError> {
    let t = aes_cmac(salt, n)?;
    aes_cmac(&t, p)
}

/// Network key material derivation.
pub fn k2(n: &[u8], p: &[u8]) -> Result<K2Keys, CryptoError> {
    let salt = s1(b"smk2")?;
    let t = aes_cmac(&salt, n)?;

    let t1 = aes_cmac(&t, &[p, &[0x01]].concat())?;
    let t2 = aes_cmac(&t, &[&t1[..], p, &[0x02]].concat())?;
    let t3 = aes_cmac(&t, &[&t2[..], p, &[0x03]].concat())?;

    // (t1 ‖ t2 ‖ t3) mod 2^263: last byte of t1, then t2 and t3
    Ok(K2Keys {
        nid: t1[15] & 0x7f,
        encryption_key: t2,
        privacy_key: t3,
    })
}

/// Network ID derivation.
pub fn k3(n: &[u8]) -> Result<[u8; 8], CryptoError> {
    let salt = s1(b"smk3")?;
    let t = aes_cmac(&salt, n)?;
    let full = aes_cmac(&t, b"id64\x01")?;
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..]);
    Ok(out)
}

/// Application key identifier (6 bits).
pub fn k4(n: &[u8]) -> Result<u8, CryptoError> {
    let salt = s1(b"smk4")?;
    let t = aes_cmac(&salt, n)?;
    let full = aes_cmac(&t, b"id6\x01")?;
    Ok(full[15] & 0x3f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_s1() {
        assert_eq!(s1(b"test").unwrap().to_vec(), h("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn test_k1() {
        let out = k1(
            &h("3216d1509884b533248541792b877f98"),
            &h("2ba14ffa0df84a2831938d57d276cab4"),
            &h("5a09d60797eeb4478aada59db3352a0d"),
        )
        .unwrap();
        assert_eq!(out.to_vec(), h("f6ed15a8934afbe7d83e8dcb57fcf5d7"));
    }

    #[test]
    fn test_k2_master_credentials() {
        let keys = k2(&h("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]).unwrap();
        assert_eq!(keys.nid, 0x7f);
        assert_eq!(keys.encryption_key.to_vec(), h("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(keys.privacy_key.to_vec(), h("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn test_k3() {
        let id = k3(&h("f7a2a44f8e8a8029064f173ddc1e2b00")).unwrap();
        assert_eq!(id.to_vec(), h("ff046958233db014"));
    }

    #[test]
    fn test_k4() {
        assert_eq!(k4(&h("3216d1509884b533248541792b877f98")).unwrap(), 0x38);
        assert_eq!(k4(&h("63964771734fbd76e3b40519d1d94a48")).unwrap(), 0x26);
    }

    #[test]
    fn test_kdf_rejects_short_salt() {
        assert_eq!(k1(b"n", &[0u8; 8], b"p"), Err(CryptoError::KeyLength(8)));
    }
}
