//! Lower and upper transport layers of the mesh node.
//!
//! ## Receive
//!
//! Network messages arrive on the worker's queue. Unsegmented access PDUs
//! are decrypted and delivered at once; segments are collected per
//! `(src, dst, SeqAuth)` in a capped reassembly table, each one answered
//! with a block-ack, and the assembled PDU is decrypted with the matching
//! application or device key. Entries expire through one-shot timers that
//! post back into the worker's inbox.
//!
//! ## Send
//!
//! [`TransportSender::send_access`] seals the payload and either emits a
//! single PDU or hands the segments to the retry loop, which staggers first
//! transmissions, retransmits on ack timeout and resolves the caller's
//! [`DeliveryHandle`] exactly once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod layer;
mod retry;
pub mod sar;
pub mod upper;

pub use config::TransportConfig;
pub use error::TransportError;
pub use layer::{
    AccessHandler, AccessKey, AccessMessage, DeliveryHandle, SendOptions, Transport, TransportSender,
};
pub use retry::{AckEvent, Delivery};
pub use upper::{decrypt_access, encrypt_access, KeyUsed, UpperContext};
