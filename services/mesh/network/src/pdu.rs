//! Network PDU sealing and opening for a single key.
//!
//! ```text
//! | IVI:1 NID:7 | CTL:1 TTL:7 SEQ:24 SRC:16 | DST:16 TransportPDU | NetMIC:32/64 |
//!               \------ obfuscated -------/ \--------- encrypted ----------/
//! ```
//!
//! The obfuscation mask is `AES-ECB(PrivacyKey, 0x0000000000 ‖ IVIndex ‖
//! PrivacyRandom)` where PrivacyRandom is the first seven encrypted bytes.

use crate::error::NetworkError;
use bytes::{BufMut, Bytes, BytesMut};
use mesh_crypto::{aes_ccm, aes_ccm_open, aes_ecb, MicSize};
use mesh_storage::NetKeyMaterial;
use mesh_wire::{network_nonce, NetworkHeader};
use serde::Serialize;

/// Smallest valid network PDU: header, DST, one transport byte, 32-bit NetMIC
pub const MIN_NETWORK_PDU: usize = NetworkHeader::SIZE + 2 + 1 + 4;

/// Largest network PDU carried by a bearer
pub const MAX_NETWORK_PDU: usize = 29;

const PRIVACY_RANDOM_SIZE: usize = 7;

/// A decoded network PDU, or one about to be encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkMessage {
    /// Low bit of the IV index used
    pub ivi: u8,
    /// NID of the network key used
    pub nid: u8,
    /// Control message
    pub ctl: bool,
    /// Time to live
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Lower transport PDU
    pub plain: Bytes,
    /// Full IV index used for the nonce and privacy mask
    pub iv_index: u32,
    /// Global index of the network key used
    pub net_key_index: u16,
}

impl NetworkMessage {
    /// Outbound message; IVI and NID are filled in when packed
    pub fn outbound(ctl: bool, ttl: u8, seq: u32, src: u16, dst: u16, plain: Bytes) -> Self {
        Self {
            ivi: 0,
            nid: 0,
            ctl,
            ttl,
            seq,
            src,
            dst,
            plain,
            iv_index: 0,
            net_key_index: 0,
        }
    }
}

fn privacy_mask(privacy_key: &[u8], iv_index: u32, random: &[u8]) -> Result<[u8; 6], NetworkError> {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&random[..PRIVACY_RANDOM_SIZE]);
    let pecb = aes_ecb(privacy_key, &block)?;
    let mut mask = [0u8; 6];
    mask.copy_from_slice(&pecb[..6]);
    Ok(mask)
}

/// Deobfuscate and decrypt `pdu` with one candidate key
pub fn unpack_with_key(
    material: &NetKeyMaterial,
    net_key_index: u16,
    iv_index: u32,
    pdu: &[u8],
) -> Result<NetworkMessage, NetworkError> {
    if pdu.len() < MIN_NETWORK_PDU {
        return Err(NetworkError::TooShort(pdu.len()));
    }
    if pdu.len() > MAX_NETWORK_PDU {
        return Err(NetworkError::TooLong(pdu.len()));
    }

    let mask = privacy_mask(&material.privacy_key, iv_index, &pdu[NetworkHeader::SIZE..])?;
    let mut clear = [0u8; NetworkHeader::SIZE];
    clear[0] = pdu[0];
    for (i, byte) in mask.iter().enumerate() {
        clear[i + 1] = pdu[i + 1] ^ byte;
    }
    let header = NetworkHeader::decode(&clear)?;

    let mic = MicSize::for_ctl(header.ctl);
    if pdu.len() < NetworkHeader::SIZE + 2 + 1 + mic.len() {
        return Err(NetworkError::TooShort(pdu.len()));
    }
    let nonce = network_nonce(header.ctl, header.ttl, header.seq, header.src, iv_index)?;
    let plain = aes_ccm_open(&material.encryption_key, &nonce, &pdu[NetworkHeader::SIZE..], mic)?;

    Ok(NetworkMessage {
        ivi: header.ivi,
        nid: header.nid,
        ctl: header.ctl,
        ttl: header.ttl,
        seq: header.seq,
        src: header.src,
        dst: u16::from_be_bytes([plain[0], plain[1]]),
        plain: Bytes::copy_from_slice(&plain[2..]),
        iv_index,
        net_key_index,
    })
}

/// Encrypt and obfuscate `msg` with `material` under `iv_index`
pub fn pack(msg: &NetworkMessage, material: &NetKeyMaterial, iv_index: u32) -> Result<Bytes, NetworkError> {
    let mic = MicSize::for_ctl(msg.ctl);
    let total = NetworkHeader::SIZE + 2 + msg.plain.len() + mic.len();
    if msg.plain.is_empty() {
        return Err(NetworkError::TooShort(total));
    }
    if total > MAX_NETWORK_PDU {
        return Err(NetworkError::TooLong(total));
    }

    let nonce = network_nonce(msg.ctl, msg.ttl, msg.seq, msg.src, iv_index)?;
    let mut plain = BytesMut::with_capacity(2 + msg.plain.len());
    plain.put_u16(msg.dst);
    plain.put_slice(&msg.plain);
    let (cipher, net_mic) = aes_ccm(&material.encryption_key, &nonce, &plain, mic)?;

    let header = NetworkHeader {
        ivi: (iv_index & 1) as u8,
        nid: material.nid,
        ctl: msg.ctl,
        ttl: msg.ttl,
        seq: msg.seq,
        src: msg.src,
    }
    .encode()?;

    let mut sealed = cipher;
    sealed.extend_from_slice(&net_mic);
    // privacy random spans into the NetMIC for short transport PDUs
    let mask = privacy_mask(&material.privacy_key, iv_index, &sealed)?;

    let mut out = BytesMut::with_capacity(total);
    out.put_u8(header[0]);
    for (i, byte) in mask.iter().enumerate() {
        out.put_u8(header[i + 1] ^ byte);
    }
    out.put_slice(&sealed);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::Key128;

    const IV_INDEX: u32 = 0x1234_5678;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn material() -> NetKeyMaterial {
        let key: Key128 = h("7dd7364cd842ad18c17c2b820c84c3d6").try_into().unwrap();
        NetKeyMaterial::derive(key).unwrap()
    }

    #[test]
    fn test_unpack_control_message() {
        let pdu = h("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df");
        let msg = unpack_with_key(&material(), 0, IV_INDEX, &pdu).unwrap();
        assert!(msg.ctl);
        assert_eq!(msg.ttl, 0);
        assert_eq!(msg.seq, 1);
        assert_eq!(msg.src, 0x1201);
        assert_eq!(msg.dst, 0xfffd);
        assert_eq!(msg.plain.to_vec(), h("034b50057e400000010000"));
        assert_eq!(msg.nid, 0x68);
    }

    #[test]
    fn test_pack_segments_bit_exact() {
        let material = material();
        let first = NetworkMessage::outbound(
            false,
            4,
            0x3129ab,
            0x0003,
            0x1201,
            Bytes::from(h("8026ac01ee9dddfd2169326d23f3afdf")),
        );
        assert_eq!(
            pack(&first, &material, IV_INDEX).unwrap().to_vec(),
            h("68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e")
        );

        let second = NetworkMessage::outbound(
            false,
            4,
            0x3129ac,
            0x0003,
            0x1201,
            Bytes::from(h("8026ac21cfdc18c52fdef772e0e17308")),
        );
        assert_eq!(
            pack(&second, &material, IV_INDEX).unwrap().to_vec(),
            h("681615b5dd4a846cae0c032bf0746f44f1b8cc8ce5edc57e55beed49c0")
        );
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let other: Key128 = h("f7a2a44f8e8a8029064f173ddc1e2b00").try_into().unwrap();
        let other = NetKeyMaterial::derive(other).unwrap();
        let pdu = h("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df");
        assert!(unpack_with_key(&other, 0, IV_INDEX, &pdu).is_err());
    }

    #[test]
    fn test_length_bounds() {
        let material = material();
        assert_eq!(
            unpack_with_key(&material, 0, IV_INDEX, &[0x68; 10]),
            Err(NetworkError::TooShort(10))
        );
        let big = NetworkMessage::outbound(false, 4, 1, 3, 4, Bytes::from(vec![0u8; 17]));
        assert_eq!(pack(&big, &material, IV_INDEX), Err(NetworkError::TooLong(30)));
    }
}
