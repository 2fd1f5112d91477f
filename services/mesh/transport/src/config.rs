//! Transport layer configuration.

use std::time::Duration;

/// Timers, budgets and caps of the transport layer
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Primary unicast address of this node
    pub unicast_address: u16,
    /// Network key used with the local device key
    pub net_key_index: u16,
    /// TTL when the caller does not give one
    pub default_ttl: u8,
    /// TTL of segment acknowledgments
    pub ack_ttl: u8,
    /// Retransmissions of a segment after its first transmission
    pub retries: u8,
    /// Delay between the first transmissions of consecutive segments
    pub segment_stagger: Duration,
    /// Ack wait per transmission, before the per-hop part
    pub ack_timeout_base: Duration,
    /// Ack wait added per unit of TTL
    pub ack_timeout_per_hop: Duration,
    /// Retry loop tick
    pub retry_poll_interval: Duration,
    /// Lifetime of a reassembly entry that never completes
    pub sar_incomplete_timeout: Duration,
    /// Lifetime of a completed reassembly entry
    pub sar_complete_timeout: Duration,
    /// Reassembly table cap
    pub max_sar_entries: usize,
    /// Pending segmented transaction cap
    pub max_pending_transactions: usize,
}

impl TransportConfig {
    /// Wait for an ack after transmitting at `ttl`
    pub fn ack_timeout(&self, ttl: u8) -> Duration {
        self.ack_timeout_base + self.ack_timeout_per_hop * ttl as u32
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            unicast_address: 0x0001,
            net_key_index: 0,
            default_ttl: 7,
            ack_ttl: 5,
            retries: 3,
            segment_stagger: Duration::from_millis(200),
            ack_timeout_base: Duration::from_millis(550),
            ack_timeout_per_hop: Duration::from_millis(50),
            retry_poll_interval: Duration::from_millis(10),
            sar_incomplete_timeout: Duration::from_secs(10),
            sar_complete_timeout: Duration::from_secs(3),
            max_sar_entries: 64,
            max_pending_transactions: 32,
        }
    }
}
