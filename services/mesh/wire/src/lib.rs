//! Wire formats for the mesh node: the bit-level field codec, network and
//! lower transport headers, CCM nonces, provisioning PDUs, segmentation
//! buffers and bearer framing.
//!
//! ## Features
//!
//! - **Field plans**: `const` descriptors of non byte-aligned layouts, packed
//!   big- or little-endian at the bit level
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for PDU payloads
//! - **Segmentation**: 12-byte access segments and block-ack bookkeeping
//! - **Bearers**: advertising and GATT proxy framing behind one trait
//!
//! ## Layering
//!
//! ```text
//! +------------------------+   bearer.rs  (adv / proxy framing)
//! | Network PDU            |   header.rs  (NetworkHeader)
//! |  +------------------+  |   nonce.rs   (network nonce)
//! |  | Lower transport  |  |   header.rs  (LowerTransportPdu)
//! |  |  +------------+  |  |   chunk.rs   (Segmenter, SarBuffer)
//! |  |  | Upper PDU  |  |  |   nonce.rs   (application / device nonce)
//! |  |  +------------+  |  |
//! |  +------------------+  |
//! +------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod bearer;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod nonce;

// Re-export main types
pub use bearer::{loopback_pair, AdvBearer, Bearer, PduKind, ProxyBearer, WriteHandle, MAX_PROXY_ASSEMBLY};
pub use chunk::{full_block_mask, Insert, SarBuffer, Segmenter};
pub use codec::{ArrayLen, Decoded, Endian, Field, FieldKind, FieldPlan, Value};
pub use error::WireError;
pub use frame::{
    Capabilities, FailureCode, ProvPduType, ProvisioningData, ProvisioningFlags, ProvisioningPdu,
    Start, PROVISIONING_DATA_MIC_SIZE, PROVISIONING_DATA_SIZE,
};
pub use header::{
    seq_auth, seq_zero, LowerTransportPdu, NetworkHeader, SegmentAck, MAX_SEG_N,
    MAX_UNSEGMENTED_PDU, SEGMENT_SIZE,
};
pub use nonce::{network_nonce, proxy_nonce, transport_nonce, NonceType, NONCE_SIZE};
