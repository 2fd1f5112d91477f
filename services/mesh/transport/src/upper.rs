//! Upper transport encryption with application and device keys.

use crate::error::TransportError;
use bytes::Bytes;
use mesh_crypto::{aes_ccm, aes_ccm_open, Key128, MicSize};
use mesh_storage::KeyStore;
use mesh_wire::{transport_nonce, NonceType};
use serde::Serialize;
use tracing::trace;

/// Nonce inputs of one upper transport PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperContext {
    /// 64-bit TransMIC
    pub szmic: bool,
    /// SeqAuth (the sequence number for unsegmented PDUs)
    pub seq: u32,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// IV index
    pub iv_index: u32,
}

impl UpperContext {
    fn nonce(&self, kind: NonceType) -> Result<[u8; 13], TransportError> {
        Ok(transport_nonce(kind, self.szmic, self.seq, self.src, self.dst, self.iv_index)?)
    }

    fn mic(&self) -> MicSize {
        MicSize::for_szmic(self.szmic)
    }
}

/// Key that authenticated an inbound access PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyUsed {
    /// Application key with this global index
    Application(u16),
    /// Device key of the sending node
    Device,
    /// This node's own device key
    LocalDevice,
}

/// Seal an access payload; returns `ciphertext ‖ TransMIC`
pub fn encrypt_access(
    key: &Key128,
    kind: NonceType,
    ctx: &UpperContext,
    payload: &[u8],
) -> Result<Bytes, TransportError> {
    let nonce = ctx.nonce(kind)?;
    let (mut cipher, mic) = aes_ccm(key, &nonce, payload, ctx.mic())?;
    cipher.extend_from_slice(&mic);
    Ok(Bytes::from(cipher))
}

/// Find the key that opens `sealed` and return the access payload.
///
/// AKF=1 tries every application key whose AID matches; AKF=0 tries the
/// device key of the source node, then this node's own device key.
pub async fn decrypt_access(
    keys: &dyn KeyStore,
    akf: bool,
    aid: u8,
    ctx: &UpperContext,
    sealed: &[u8],
) -> Result<(Bytes, KeyUsed), TransportError> {
    if akf {
        let nonce = ctx.nonce(NonceType::Application)?;
        for candidate in keys.find_application_keys_by_aid(aid).await? {
            match aes_ccm_open(&candidate.material.key, &nonce, sealed, ctx.mic()) {
                Ok(plain) => return Ok((Bytes::from(plain), KeyUsed::Application(candidate.index))),
                Err(e) => trace!("App key {} rejected pdu: {}", candidate.index, e),
            }
        }
        return Err(TransportError::NoValidAppKey);
    }

    let nonce = ctx.nonce(NonceType::Device)?;
    if let Some(node) = keys.find_node_by_source(ctx.src).await? {
        if let Ok(plain) = aes_ccm_open(&node.device_key, &nonce, sealed, ctx.mic()) {
            return Ok((Bytes::from(plain), KeyUsed::Device));
        }
    }
    if let Some(own) = keys.local_device_key().await? {
        if let Ok(plain) = aes_ccm_open(&own, &nonce, sealed, ctx.mic()) {
            return Ok((Bytes::from(plain), KeyUsed::LocalDevice));
        }
    }
    Err(TransportError::NoValidAppKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_storage::{ApplicationKey, LocalNode, MemoryKeyStore, Node};
    use uuid::Uuid;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn key(s: &str) -> Key128 {
        h(s).try_into().unwrap()
    }

    fn device_ctx() -> UpperContext {
        UpperContext {
            szmic: false,
            seq: 0x3129ab,
            src: 0x0003,
            dst: 0x1201,
            iv_index: 0x1234_5678,
        }
    }

    #[test]
    fn test_encrypt_with_device_key() {
        let sealed = encrypt_access(
            &key("9d6dd0e96eb25dc19a40ed9914f8f03f"),
            NonceType::Device,
            &device_ctx(),
            &h("0056341263964771734fbd76e3b40519d1d94a48"),
        )
        .unwrap();
        assert_eq!(sealed.to_vec(), h("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308"));
    }

    #[tokio::test]
    async fn test_decrypt_with_source_device_key() {
        let keys = MemoryKeyStore::new(LocalNode {
            unicast_address: 0x1201,
            element_count: 1,
            device_key: None,
        });
        keys.store_node(Node {
            uuid: Uuid::from_bytes([3; 16]),
            unicast_address: 0x0003,
            element_count: 1,
            device_key: key("9d6dd0e96eb25dc19a40ed9914f8f03f"),
            net_keys: vec![0],
            app_keys: vec![],
            last_seq: None,
            friend: None,
        })
        .await
        .unwrap();

        let sealed = h("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308");
        let (plain, used) = decrypt_access(&keys, false, 0, &device_ctx(), &sealed).await.unwrap();
        assert_eq!(plain.to_vec(), h("0056341263964771734fbd76e3b40519d1d94a48"));
        assert_eq!(used, KeyUsed::Device);
    }

    #[tokio::test]
    async fn test_decrypt_with_local_device_key() {
        let keys = MemoryKeyStore::new(LocalNode {
            unicast_address: 0x1201,
            element_count: 1,
            device_key: Some(key("9d6dd0e96eb25dc19a40ed9914f8f03f")),
        });
        let sealed = h("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308");
        let (_, used) = decrypt_access(&keys, false, 0, &device_ctx(), &sealed).await.unwrap();
        assert_eq!(used, KeyUsed::LocalDevice);
    }

    #[tokio::test]
    async fn test_decrypt_with_application_key() {
        let keys = MemoryKeyStore::new(LocalNode {
            unicast_address: 0x0001,
            element_count: 1,
            device_key: None,
        });
        keys.add_application_key(ApplicationKey::new(5, 0, key("63964771734fbd76e3b40519d1d94a48")).unwrap());
        let ctx = UpperContext {
            szmic: false,
            seq: 7,
            src: 0x1201,
            dst: 0xffff,
            iv_index: 0x1234_5678,
        };

        let (plain, used) = decrypt_access(&keys, true, 0x26, &ctx, &h("5a8bde6d9106ea078a")).await.unwrap();
        assert_eq!(plain.to_vec(), h("0400000000"));
        assert_eq!(used, KeyUsed::Application(5));

        assert_eq!(
            decrypt_access(&keys, true, 0x25, &ctx, &h("5a8bde6d9106ea078a")).await,
            Err(TransportError::NoValidAppKey)
        );
    }
}
