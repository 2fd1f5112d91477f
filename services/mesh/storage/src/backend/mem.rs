//! In-memory key store for nodes without persistence and for tests

use crate::keys::{ApplicationKey, KeyRefreshPhase, NetworkKey};
use crate::node::{Node, NodeArena};
use crate::{
    AppKeyCandidate, AppKeyCandidates, IvIndexState, KeyStore, NetKeyCandidate, NetKeyCandidates,
    StorageError, MAX_SEQUENCE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_crypto::Key128;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of the node owning the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNode {
    /// Primary element address
    pub unicast_address: u16,
    /// Number of elements
    pub element_count: u8,
    /// Own device key, once provisioned
    pub device_key: Option<Key128>,
}

/// In-memory [`KeyStore`]
pub struct MemoryKeyStore {
    local: RwLock<LocalNode>,
    /// Network keys: index -> key
    net_keys: Arc<DashMap<u16, NetworkKey>>,
    /// Application keys: index -> key
    app_keys: Arc<DashMap<u16, ApplicationKey>>,
    nodes: RwLock<NodeArena>,
    iv: RwLock<IvIndexState>,
    seq: AtomicU32,
    low_address: u16,
}

impl MemoryKeyStore {
    /// Empty store for the node at `local.unicast_address`
    pub fn new(local: LocalNode) -> Self {
        Self {
            local: RwLock::new(local),
            net_keys: Arc::new(DashMap::new()),
            app_keys: Arc::new(DashMap::new()),
            nodes: RwLock::new(NodeArena::new()),
            iv: RwLock::new(IvIndexState::default()),
            seq: AtomicU32::new(0),
            low_address: 0x0001,
        }
    }

    /// Lowest address handed out by [`KeyStore::allocate_unicast_address`]
    pub fn with_low_address(mut self, low: u16) -> Self {
        self.low_address = low.max(1);
        self
    }

    /// First sequence number to use
    pub fn with_sequence(self, seq: u32) -> Self {
        self.set_sequence(seq);
        self
    }

    /// Continue from `seq`; a later IV index change resets it to 0
    pub fn set_sequence(&self, seq: u32) {
        self.seq.store(seq, Ordering::SeqCst);
    }

    /// Add or replace a network key
    pub fn add_network_key(&self, key: NetworkKey) {
        debug!(
            "Key store add net key index={} nid={:#04x}",
            key.index, key.current.nid
        );
        self.net_keys.insert(key.index, key);
    }

    /// Add or replace an application key
    pub fn add_application_key(&self, key: ApplicationKey) {
        debug!(
            "Key store add app key index={} aid={:#04x}",
            key.index, key.current.aid
        );
        self.app_keys.insert(key.index, key);
    }

    /// Start a key refresh on network key `index`
    pub fn begin_key_refresh(&self, index: u16, new_key: Key128) -> Result<(), StorageError> {
        let mut key = self
            .net_keys
            .get_mut(&index)
            .ok_or(StorageError::KeyNotFound(index))?;
        key.begin_key_refresh(new_key)?;
        info!("Key refresh phase 1 on net key index={}", index);
        Ok(())
    }

    /// Move network key `index` to `phase`
    pub fn set_key_refresh_phase(&self, index: u16, phase: KeyRefreshPhase) -> Result<(), StorageError> {
        let mut key = self
            .net_keys
            .get_mut(&index)
            .ok_or(StorageError::KeyNotFound(index))?;
        key.set_phase(phase);
        info!("Key refresh on net key index={} now {:?}", index, phase);
        Ok(())
    }

    /// Replace the IV index state
    pub async fn set_iv_index(&self, state: IvIndexState) {
        let mut iv = self.iv.write().await;
        if iv.index != state.index {
            // sequence numbers restart with a new IV index
            self.seq.store(0, Ordering::SeqCst);
        }
        *iv = state;
        info!("IV index {:#010x} updating={}", state.index, state.updating);
    }

    /// Adopt the outcome of being provisioned
    pub async fn set_local_device_key(&self, unicast_address: u16, device_key: Key128) {
        let mut local = self.local.write().await;
        local.unicast_address = unicast_address;
        local.device_key = Some(device_key);
    }

    /// Identity of this node
    pub async fn local_node(&self) -> LocalNode {
        *self.local.read().await
    }

    /// Snapshot of every stored node
    pub async fn nodes(&self) -> Vec<Node> {
        self.nodes.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn find_network_keys_by_nid(&self, nid: u8) -> Result<NetKeyCandidates, StorageError> {
        let mut found = NetKeyCandidates::new();
        for entry in self.net_keys.iter() {
            for material in entry.materials_for_nid(nid) {
                found.push(NetKeyCandidate {
                    index: entry.index,
                    material: material.clone(),
                });
            }
        }
        Ok(found)
    }

    async fn network_key(&self, index: u16) -> Result<NetworkKey, StorageError> {
        self.net_keys
            .get(&index)
            .map(|k| k.clone())
            .ok_or(StorageError::KeyNotFound(index))
    }

    async fn find_application_keys_by_aid(&self, aid: u8) -> Result<AppKeyCandidates, StorageError> {
        let mut found = AppKeyCandidates::new();
        for entry in self.app_keys.iter() {
            for material in entry.materials_for_aid(aid) {
                found.push(AppKeyCandidate {
                    index: entry.index,
                    net_key_index: entry.net_key_index,
                    material: *material,
                });
            }
        }
        Ok(found)
    }

    async fn application_key(&self, index: u16) -> Result<ApplicationKey, StorageError> {
        self.app_keys
            .get(&index)
            .map(|k| k.clone())
            .ok_or(StorageError::KeyNotFound(index))
    }

    async fn find_node_by_source(&self, addr: u16) -> Result<Option<Node>, StorageError> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .find_by_address(addr)
            .and_then(|id| nodes.get(id))
            .cloned())
    }

    async fn local_device_key(&self) -> Result<Option<Key128>, StorageError> {
        Ok(self.local.read().await.device_key)
    }

    async fn update_node_sequence(&self, addr: u16, seq: u32) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.find_by_address(addr).and_then(|id| nodes.get_mut(id)) {
            node.last_seq = Some(node.last_seq.map_or(seq, |last| last.max(seq)));
        }
        Ok(())
    }

    async fn next_sequence_number(&self) -> Result<u32, StorageError> {
        self.seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seq| {
                (seq <= MAX_SEQUENCE).then_some(seq + 1)
            })
            .map_err(|_| StorageError::SequenceExhausted)
    }

    async fn current_iv_index(&self) -> Result<IvIndexState, StorageError> {
        Ok(*self.iv.read().await)
    }

    async fn allocate_unicast_address(&self, uuid: Uuid, element_count: u8) -> Result<u16, StorageError> {
        let local = *self.local.read().await;
        let nodes = self.nodes.read().await;

        if let Some(node) = nodes.find_by_uuid(&uuid).and_then(|id| nodes.get(id)) {
            if node.element_count >= element_count {
                debug!("Reusing address {:#06x} for {}", node.unicast_address, uuid);
                return Ok(node.unicast_address);
            }
        }

        let reserved = [(local.unicast_address, local.element_count)];
        let addr = nodes
            .lowest_free_range(self.low_address, element_count, &reserved)
            .ok_or(StorageError::AddressSpaceExhausted)?;
        debug!("Allocated address {:#06x} (+{}) for {}", addr, element_count, uuid);
        Ok(addr)
    }

    async fn store_node(&self, node: Node) -> Result<(), StorageError> {
        debug!(
            "Key store node uuid={} addr={:#06x} elements={}",
            node.uuid, node.unicast_address, node.element_count
        );
        self.nodes.write().await.insert(node);
        Ok(())
    }

    async fn set_friend(&self, lpn: u16, friend: Option<u16>) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .find_by_address(lpn)
            .and_then(|id| nodes.get_mut(id))
            .ok_or(StorageError::NodeNotFound(lpn))?;
        if node.friend != friend {
            debug!("Node {:#06x} friend now {:?}", lpn, friend);
            node.friend = friend;
        }
        Ok(())
    }
}
