//! Network layer of the mesh node.
//!
//! Inbound, raw PDUs from the bearer pass the replay cache, are matched to
//! network keys by NID, deobfuscated, authenticated and filtered by
//! destination before being queued for the transport layer. Outbound, the
//! [`NetworkSender`] seals transport PDUs under the transmit key and IV
//! index and hands them to the bearer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod layer;
pub mod pdu;

pub use error::NetworkError;
pub use layer::{NetworkConfig, NetworkLayer, NetworkSender};
pub use pdu::{pack, unpack_with_key, NetworkMessage, MAX_NETWORK_PDU, MIN_NETWORK_PDU};
