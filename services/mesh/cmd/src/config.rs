//! Configuration handling for the mesh node.
//!
//! Values come from the YAML file first (defaults when it is missing), then
//! from `BTMESH_*` environment variables, then from the command line.

use anyhow::{anyhow, bail, Context, Result};
use mesh_crypto::Key128;
use mesh_network::NetworkConfig;
use mesh_node::MeshNodeConfig;
use mesh_provision::ProvisionerConfig;
use mesh_storage::DEFAULT_REPLAY_CACHE_SIZE;
use mesh_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Identity of this node and the keys it starts with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Primary unicast address
    pub unicast_address: u16,
    /// Number of elements
    pub element_count: u8,
    /// Network key, 32 hex digits
    pub net_key: String,
    /// Global index of the network key
    pub net_key_index: u16,
    /// Application key, 32 hex digits
    pub app_key: String,
    /// Global index of the application key
    pub app_key_index: u16,
    /// Current IV index
    pub iv_index: u32,
    /// IV update in progress
    pub iv_update: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            unicast_address: 0x0001,
            element_count: 1,
            net_key: "7dd7364cd842ad18c17c2b820c84c3d6".to_string(),
            net_key_index: 0,
            app_key: "63964771734fbd76e3b40519d1d94a48".to_string(),
            app_key_index: 0,
            iv_index: 0,
            iv_update: false,
        }
    }
}

/// Network layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Raw PDUs remembered for duplicate suppression
    pub replay_cache_size: usize,
    /// TTL of outgoing messages
    pub default_ttl: u8,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
            default_ttl: 7,
        }
    }
}

/// Transport layer settings; durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Retransmissions per segment
    pub retries: u8,
    /// TTL of segment acknowledgments
    pub ack_ttl: u8,
    /// Retry loop tick
    pub retry_poll_ms: u64,
    /// Delay between first transmissions of consecutive segments
    pub segment_stagger_ms: u64,
    /// Lifetime of an incomplete reassembly
    pub sar_incomplete_ms: u64,
    /// Lifetime of a completed reassembly
    pub sar_complete_ms: u64,
    /// Reassembly table cap
    pub max_sar_entries: usize,
    /// Pending segmented transaction cap
    pub max_pending_transactions: usize,
    /// Wait for the response to a request
    pub response_timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            retries: defaults.retries,
            ack_ttl: defaults.ack_ttl,
            retry_poll_ms: defaults.retry_poll_interval.as_millis() as u64,
            segment_stagger_ms: defaults.segment_stagger.as_millis() as u64,
            sar_incomplete_ms: defaults.sar_incomplete_timeout.as_millis() as u64,
            sar_complete_ms: defaults.sar_complete_timeout.as_millis() as u64,
            max_sar_entries: defaults.max_sar_entries,
            max_pending_transactions: defaults.max_pending_transactions,
            response_timeout_ms: 5_000,
        }
    }
}

/// Provisioner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSection {
    /// Lowest unicast address handed to new nodes
    pub low_address: u16,
    /// Attention timer requested from devices, seconds
    pub attention_duration: u8,
    /// Wait for each provisioning PDU, milliseconds
    pub pdu_timeout_ms: u64,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            low_address: 0x0100,
            attention_duration: 5,
            pdu_timeout_ms: 30_000,
        }
    }
}

/// Mesh node configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and keys
    pub node: NodeSection,
    /// Network layer
    pub network: NetworkSection,
    /// Lower transport
    pub transport: TransportSection,
    /// Provisioner role
    pub provisioning: ProvisioningSection,
}

/// Decimal or `0x`-prefixed hexadecimal
pub fn parse_number<T: TryFrom<u64>>(value: &str) -> Result<T> {
    let raw = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    }
    .with_context(|| format!("invalid number {:?}", value))?;
    T::try_from(raw).map_err(|_| anyhow!("{} out of range", value))
}

fn parse_key(name: &str, value: &str) -> Result<Key128> {
    let bytes = hex::decode(value).with_context(|| format!("{} is not hex", name))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("{} must be 16 bytes", name))
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;

        info!(
            "Final mesh configuration: unicast={:#06x}, iv_index={:#010x}, default_ttl={}, retry_poll={}ms",
            config.node.unicast_address,
            config.node.iv_index,
            config.network.default_ttl,
            config.transport.retry_poll_ms
        );
        Ok(config)
    }

    /// Apply `BTMESH_*` overrides looked up through `var`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("BTMESH_UNICAST_ADDRESS") {
            self.node.unicast_address = parse_number(&v).context("BTMESH_UNICAST_ADDRESS")?;
            info!("Unicast address overridden by environment: {:#06x}", self.node.unicast_address);
        }
        if let Some(v) = var("BTMESH_IV_INDEX") {
            self.node.iv_index = parse_number(&v).context("BTMESH_IV_INDEX")?;
            info!("IV index overridden by environment: {:#010x}", self.node.iv_index);
        }
        if let Some(v) = var("BTMESH_NET_KEY") {
            self.node.net_key = v;
            info!("Network key overridden by environment");
        }
        if let Some(v) = var("BTMESH_APP_KEY") {
            self.node.app_key = v;
            info!("Application key overridden by environment");
        }
        if let Some(v) = var("BTMESH_DEFAULT_TTL") {
            self.network.default_ttl = parse_number(&v).context("BTMESH_DEFAULT_TTL")?;
            info!("Default TTL overridden by environment: {}", self.network.default_ttl);
        }
        if let Some(v) = var("BTMESH_RETRY_POLL_MS") {
            self.transport.retry_poll_ms = parse_number(&v).context("BTMESH_RETRY_POLL_MS")?;
            info!("Retry poll interval overridden by environment: {}ms", self.transport.retry_poll_ms);
        }
        if let Some(v) = var("BTMESH_RESPONSE_TIMEOUT_MS") {
            self.transport.response_timeout_ms = parse_number(&v).context("BTMESH_RESPONSE_TIMEOUT_MS")?;
            info!("Response timeout overridden by environment: {}ms", self.transport.response_timeout_ms);
        }
        if let Some(v) = var("BTMESH_LOW_ADDRESS") {
            self.provisioning.low_address = parse_number(&v).context("BTMESH_LOW_ADDRESS")?;
            info!("Provisioning low address overridden by environment: {:#06x}", self.provisioning.low_address);
        }
        Ok(())
    }

    /// Reject values the layers cannot work with
    pub fn validate(&self) -> Result<()> {
        let unicast = 0x0001..=0x7fff;
        if !unicast.contains(&self.node.unicast_address) {
            bail!("unicast address {:#06x} is not a unicast address", self.node.unicast_address);
        }
        if !unicast.contains(&self.provisioning.low_address) {
            bail!("low address {:#06x} is not a unicast address", self.provisioning.low_address);
        }
        if self.node.element_count == 0 {
            bail!("element count must be at least 1");
        }
        if self.network.default_ttl == 1 || self.network.default_ttl > 0x7f {
            bail!("default TTL {} is not usable", self.network.default_ttl);
        }
        if self.transport.retry_poll_ms == 0 {
            bail!("retry poll interval must be positive");
        }
        self.net_key()?;
        self.app_key()?;
        Ok(())
    }

    /// Network key material
    pub fn net_key(&self) -> Result<Key128> {
        parse_key("net_key", &self.node.net_key)
    }

    /// Application key material
    pub fn app_key(&self) -> Result<Key128> {
        parse_key("app_key", &self.node.app_key)
    }

    /// Per-PDU provisioning timeout
    pub fn pdu_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning.pdu_timeout_ms)
    }

    /// Layer settings for a node of `element_count` elements at `unicast_address`
    pub fn mesh_node_config(&self, unicast_address: u16, element_count: u8) -> MeshNodeConfig {
        let t = &self.transport;
        MeshNodeConfig {
            unicast_address,
            network: NetworkConfig {
                unicast_address,
                element_count,
                replay_cache_size: self.network.replay_cache_size,
            },
            transport: TransportConfig {
                unicast_address,
                net_key_index: self.node.net_key_index,
                default_ttl: self.network.default_ttl,
                ack_ttl: t.ack_ttl,
                retries: t.retries,
                segment_stagger: Duration::from_millis(t.segment_stagger_ms),
                retry_poll_interval: Duration::from_millis(t.retry_poll_ms),
                sar_incomplete_timeout: Duration::from_millis(t.sar_incomplete_ms),
                sar_complete_timeout: Duration::from_millis(t.sar_complete_ms),
                max_sar_entries: t.max_sar_entries,
                max_pending_transactions: t.max_pending_transactions,
                ..TransportConfig::default()
            },
            provisioner: ProvisionerConfig {
                net_key_index: self.node.net_key_index,
                attention_duration: self.provisioning.attention_duration,
                pdu_timeout: self.pdu_timeout(),
            },
            response_timeout: Duration::from_millis(t.response_timeout_ms),
        }
    }
}
