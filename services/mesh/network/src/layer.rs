//! Network layer worker and sender.

use crate::error::NetworkError;
use crate::pdu::{pack, unpack_with_key, NetworkMessage, MIN_NETWORK_PDU};
use bytes::Bytes;
use mesh_storage::{KeyStore, ReplayCache, DEFAULT_REPLAY_CACHE_SIZE};
use mesh_wire::address::{is_group, is_virtual};
use mesh_wire::Bearer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Network layer configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Primary unicast address of this node
    pub unicast_address: u16,
    /// Elements of this node; their addresses follow the primary one
    pub element_count: u8,
    /// Number of raw PDUs remembered for duplicate suppression
    pub replay_cache_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            unicast_address: 0x0001,
            element_count: 1,
            replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
        }
    }
}

/// Receive side of the network layer; owns the replay cache
pub struct NetworkLayer {
    config: NetworkConfig,
    keys: Arc<dyn KeyStore>,
    cache: ReplayCache,
}

impl NetworkLayer {
    /// Create the layer
    pub fn new(config: NetworkConfig, keys: Arc<dyn KeyStore>) -> Self {
        let cache = ReplayCache::new(config.replay_cache_size);
        Self { config, keys, cache }
    }

    /// Decode a raw network PDU. `Ok(None)` means it was a duplicate.
    pub async fn decode(&mut self, pdu: &[u8]) -> Result<Option<NetworkMessage>, NetworkError> {
        if pdu.len() < MIN_NETWORK_PDU {
            return Err(NetworkError::TooShort(pdu.len()));
        }
        if !self.cache.check_and_insert(pdu) {
            trace!("Network rx duplicate pdu dropped");
            return Ok(None);
        }

        let ivi = pdu[0] >> 7;
        let nid = pdu[0] & 0x7f;
        let candidates = self.keys.find_network_keys_by_nid(nid).await?;
        if candidates.is_empty() {
            return Err(NetworkError::NetKeyNotFound(nid));
        }
        let iv_index = self.keys.current_iv_index().await?.rx_index(ivi);

        for candidate in candidates.iter() {
            match unpack_with_key(&candidate.material, candidate.index, iv_index, pdu) {
                Ok(msg) => {
                    self.keys.update_node_sequence(msg.src, msg.seq).await?;
                    debug!(
                        "Network rx src={:#06x} dst={:#06x} seq={:#08x} ttl={} ctl={}",
                        msg.src, msg.dst, msg.seq, msg.ttl, msg.ctl
                    );
                    return Ok(Some(msg));
                }
                Err(e) => trace!("Net key {} rejected pdu: {}", candidate.index, e),
            }
        }
        Err(NetworkError::NoValidNetKey)
    }

    /// Whether a decoded message belongs to the transport layer above
    pub fn accepts(&self, msg: &NetworkMessage) -> bool {
        if self.is_own(msg.src) {
            return false;
        }
        self.is_own(msg.dst) || is_group(msg.dst) || is_virtual(msg.dst)
    }

    fn is_own(&self, addr: u16) -> bool {
        let first = self.config.unicast_address as u32;
        let count = self.config.element_count.max(1) as u32;
        (first..first + count).contains(&(addr as u32))
    }

    /// Decode and filter one PDU; failures are logged and dropped
    pub async fn handle_pdu(&mut self, pdu: &[u8]) -> Option<NetworkMessage> {
        match self.decode(pdu).await {
            Ok(Some(msg)) if self.accepts(&msg) => Some(msg),
            Ok(Some(msg)) => {
                trace!("Network rx not for us: src={:#06x} dst={:#06x}", msg.src, msg.dst);
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Network rx dropped: {}", e);
                None
            }
        }
    }

    /// Consume PDUs from the bearer until either queue closes
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
        upward: mpsc::UnboundedSender<NetworkMessage>,
    ) {
        info!("Network layer started for {:#06x}", self.config.unicast_address);
        while let Some(pdu) = inbound.recv().await {
            if let Some(msg) = self.handle_pdu(&pdu).await {
                if upward.send(msg).is_err() {
                    warn!("Transport queue closed");
                    break;
                }
            }
        }
        info!("Network layer stopped");
    }

    /// Run the worker on its own task
    pub fn spawn(
        self,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        upward: mpsc::UnboundedSender<NetworkMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound, upward))
    }
}

/// Transmit side of the network layer
#[derive(Clone)]
pub struct NetworkSender {
    unicast_address: u16,
    keys: Arc<dyn KeyStore>,
    bearer: Arc<dyn Bearer>,
}

impl NetworkSender {
    /// Create a sender writing to `bearer`
    pub fn new(unicast_address: u16, keys: Arc<dyn KeyStore>, bearer: Arc<dyn Bearer>) -> Self {
        Self {
            unicast_address,
            keys,
            bearer,
        }
    }

    /// Address used as SRC of every PDU
    pub fn unicast_address(&self) -> u16 {
        self.unicast_address
    }

    /// Seal `plain` for `dst` with network key `net_key_index` and write it.
    /// The caller supplies the sequence number.
    pub async fn send(
        &self,
        net_key_index: u16,
        ctl: bool,
        ttl: u8,
        seq: u32,
        dst: u16,
        plain: Bytes,
    ) -> Result<NetworkMessage, NetworkError> {
        let key = self.keys.network_key(net_key_index).await?;
        let iv_index = self.keys.current_iv_index().await?.tx_index();
        let material = key.tx_material();

        let mut msg = NetworkMessage::outbound(ctl, ttl, seq, self.unicast_address, dst, plain);
        let pdu = pack(&msg, material, iv_index)?;
        msg.ivi = (iv_index & 1) as u8;
        msg.nid = material.nid;
        msg.iv_index = iv_index;
        msg.net_key_index = net_key_index;

        debug!(
            "Network tx src={:#06x} dst={:#06x} seq={:#08x} ttl={} ctl={} len={}",
            msg.src,
            dst,
            seq,
            ttl,
            ctl,
            pdu.len()
        );
        self.bearer.send_net_pdu(&pdu)?;
        Ok(msg)
    }
}
