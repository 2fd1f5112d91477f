//! Node error types.

use crate::access::Opcode;
use mesh_provision::ProvisionError;
use mesh_storage::StorageError;
use mesh_transport::TransportError;
use mesh_wire::WireError;
use thiserror::Error;

/// Errors surfaced by [`crate::MeshNode`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// No response arrived within the request timeout
    #[error("no response from {dst:#06x}")]
    Timeout {
        /// Destination of the request
        dst: u16,
    },

    /// A request to this destination is already waiting for its response
    #[error("request to {0:#06x} already pending")]
    RequestPending(u16),

    /// Opcode has no response; send it with `send_access` instead
    #[error("{0:?} has no response opcode")]
    NoResponse(Opcode),

    /// Destination node has no application key to address a model with
    #[error("no application key bound for {0:#06x}")]
    NoAppKey(u16),

    /// Access payload starts with an opcode outside the supported set
    #[error("unknown opcode {0:#08x}")]
    UnknownOpcode(u32),

    /// Remote node answered with a non-success status code
    #[error("{opcode:?} returned status {status:#04x}")]
    Status {
        /// Status message opcode
        opcode: Opcode,
        /// Status code reported
        status: u8,
    },

    /// Node tasks are gone
    #[error("node stopped")]
    Stopped,

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Provisioning failure
    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Key store failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Parameter packing failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
