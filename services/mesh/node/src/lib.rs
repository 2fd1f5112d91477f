//! A complete mesh node: bearer, network layer, lower and upper transport
//! and the access layer, wired together behind [`MeshNode`].
//!
//! ## Access dispatch
//!
//! Every decrypted access message is first matched against the outstanding
//! requests (one per destination, keyed by address, completed by the
//! expected status opcode from that address). Anything else goes to the
//! registered [`mesh_transport::AccessHandler`].
//!
//! ## Messages
//!
//! [`access`] carries the opcode space this node speaks, the Configuration
//! messages needed to bring a freshly provisioned node into service and the
//! Generic OnOff messages. [`server::ModelServer`] answers them on behalf of
//! a simulated device.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod error;
pub mod node;
pub mod server;

pub use access::{AccessPdu, Message, ModelId, Opcode};
pub use error::NodeError;
pub use node::{MeshNode, MeshNodeConfig};
pub use server::ModelServer;
