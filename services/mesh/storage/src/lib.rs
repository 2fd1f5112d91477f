//! Key, node and sequence state for the mesh node.
//!
//! The network, transport and provisioning layers never own key material
//! directly; they query a [`KeyStore`] by the short identifiers carried on
//! the air (NID, AID, source address) and get back every candidate key.
//! Decryption then tries each candidate in turn.
//!
//! Also home to the [`ReplayCache`] used by the network layer to drop
//! duplicate PDUs before decryption.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod dedup;
pub mod keys;
pub mod node;

use async_trait::async_trait;
use mesh_crypto::{CryptoError, Key128};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;
use uuid::Uuid;

pub use backend::mem::{LocalNode, MemoryKeyStore};
pub use dedup::{ReplayCache, DEFAULT_REPLAY_CACHE_SIZE};
pub use keys::{AppKeyMaterial, ApplicationKey, KeyRefreshPhase, NetKeyMaterial, NetworkKey};
pub use node::{Node, NodeArena, NodeId};

/// Largest sequence number a node may use
pub const MAX_SEQUENCE: u32 = 0x00ff_ffff;

/// A network key that matched a received NID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetKeyCandidate {
    /// Global index of the network key
    pub index: u16,
    /// Matching material (current or old)
    pub material: NetKeyMaterial,
}

/// An application key that matched a received AID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppKeyCandidate {
    /// Global index of the application key
    pub index: u16,
    /// Index of the bound network key
    pub net_key_index: u16,
    /// Matching material (current or old)
    pub material: AppKeyMaterial,
}

/// Candidate lists; one or two entries in practice
pub type NetKeyCandidates = SmallVec<[NetKeyCandidate; 2]>;

/// Candidate lists; one or two entries in practice
pub type AppKeyCandidates = SmallVec<[AppKeyCandidate; 2]>;

/// IV index and whether an IV update is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndexState {
    /// Current IV index
    pub index: u32,
    /// IV update in progress
    pub updating: bool,
}

impl IvIndexState {
    /// IV index used to transmit: the previous one while updating
    pub fn tx_index(&self) -> u32 {
        if self.updating {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// IV index to decrypt a PDU whose IVI bit is `ivi`
    pub fn rx_index(&self, ivi: u8) -> u32 {
        if (self.index & 1) as u8 != ivi & 1 {
            self.index.wrapping_sub(1)
        } else {
            self.index
        }
    }

    /// Low bit of the transmit IV index
    pub fn tx_ivi(&self) -> u8 {
        (self.tx_index() & 1) as u8
    }
}

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No key with that index
    #[error("key not found: index {0:#05x}")]
    KeyNotFound(u16),
    /// No node owns that address
    #[error("node not found: address {0:#06x}")]
    NodeNotFound(u16),
    /// No unicast range of the requested size is free
    #[error("unicast address space exhausted")]
    AddressSpaceExhausted,
    /// Sequence numbers are used up for this IV index
    #[error("sequence number space exhausted")]
    SequenceExhausted,
    /// Key derivation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// Invalid operation
    #[error("invalid operation: {0}")]
    Invalid(String),
}

/// Key and node lookups shared by every layer
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Every network key material whose NID equals `nid`
    async fn find_network_keys_by_nid(&self, nid: u8) -> Result<NetKeyCandidates, StorageError>;

    /// Network key by global index
    async fn network_key(&self, index: u16) -> Result<NetworkKey, StorageError>;

    /// Every application key material whose AID equals `aid`
    async fn find_application_keys_by_aid(&self, aid: u8) -> Result<AppKeyCandidates, StorageError>;

    /// Application key by global index
    async fn application_key(&self, index: u16) -> Result<ApplicationKey, StorageError>;

    /// Node owning the element address `addr`
    async fn find_node_by_source(&self, addr: u16) -> Result<Option<Node>, StorageError>;

    /// Device key of this node, once provisioned
    async fn local_device_key(&self) -> Result<Option<Key128>, StorageError>;

    /// Record the last sequence number seen from `addr`; unknown sources are ignored
    async fn update_node_sequence(&self, addr: u16, seq: u32) -> Result<(), StorageError>;

    /// Take the next 24-bit sequence number of this node
    async fn next_sequence_number(&self) -> Result<u32, StorageError>;

    /// Current IV index state
    async fn current_iv_index(&self) -> Result<IvIndexState, StorageError>;

    /// Primary address for a device: its previous address if the UUID is
    /// known, otherwise the lowest free range of `element_count` addresses
    async fn allocate_unicast_address(&self, uuid: Uuid, element_count: u8) -> Result<u16, StorageError>;

    /// Insert or replace a node record
    async fn store_node(&self, node: Node) -> Result<(), StorageError>;

    /// Record (or clear) the friend acknowledging for Low Power Node `lpn`
    async fn set_friend(&self, lpn: u16, friend: Option<u16>) -> Result<(), StorageError>;
}
