//! Provisioning handshake of the mesh node.
//!
//! [`ProvisioningSession`] and [`DeviceSession`] are the two halves of the
//! ECDH pairing as plain state machines: raw PDUs in, PDUs to write out.
//! [`Provisioner`] runs the provisioner half over a bearer's provisioning
//! queue with a per-PDU timeout, allocates the new node's unicast address
//! and records the node in the key store. [`respond`] runs the device half.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod error;
mod handshake;
pub mod session;

pub use driver::{respond, Provisioner, ProvisionerConfig};
pub use error::ProvisionError;
pub use session::{
    DeviceProvisioned, DeviceSession, Output, ProvisionedDevice, ProvisioningSession, ProvisioningState,
};
