//! Provisioning PDUs.
//!
//! ```text
//! +---------+--------------------------------+
//! | type 1B | payload (length fixed by type) |
//! +---------+--------------------------------+
//! ```

use crate::codec::{Endian, Field, FieldPlan, Value};
use crate::error::WireError;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the cleartext provisioning data block
pub const PROVISIONING_DATA_SIZE: usize = 25;

/// MIC appended to the encrypted provisioning data
pub const PROVISIONING_DATA_MIC_SIZE: usize = 8;

/// Provisioning PDU type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvPduType {
    /// Provisioning Invite
    Invite = 0x00,
    /// Provisioning Capabilities
    Capabilities = 0x01,
    /// Provisioning Start
    Start = 0x02,
    /// Provisioning Public Key
    PublicKey = 0x03,
    /// Provisioning Input Complete
    InputComplete = 0x04,
    /// Provisioning Confirmation
    Confirmation = 0x05,
    /// Provisioning Random
    Random = 0x06,
    /// Provisioning Data
    Data = 0x07,
    /// Provisioning Complete
    Complete = 0x08,
    /// Provisioning Failed
    Failed = 0x09,
}

impl ProvPduType {
    /// Payload length every PDU of this type must have
    pub const fn payload_len(self) -> usize {
        match self {
            ProvPduType::Invite => 1,
            ProvPduType::Capabilities => 11,
            ProvPduType::Start => 5,
            ProvPduType::PublicKey => 64,
            ProvPduType::InputComplete => 0,
            ProvPduType::Confirmation => 16,
            ProvPduType::Random => 16,
            ProvPduType::Data => PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE,
            ProvPduType::Complete => 0,
            ProvPduType::Failed => 1,
        }
    }
}

impl TryFrom<u8> for ProvPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProvPduType::Invite),
            0x01 => Ok(ProvPduType::Capabilities),
            0x02 => Ok(ProvPduType::Start),
            0x03 => Ok(ProvPduType::PublicKey),
            0x04 => Ok(ProvPduType::InputComplete),
            0x05 => Ok(ProvPduType::Confirmation),
            0x06 => Ok(ProvPduType::Random),
            0x07 => Ok(ProvPduType::Data),
            0x08 => Ok(ProvPduType::Complete),
            0x09 => Ok(ProvPduType::Failed),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Error code carried by Provisioning Failed
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    /// Prohibited
    Prohibited = 0x00,
    /// The PDU type is not recognized
    InvalidPdu = 0x01,
    /// The PDU parameters are outside the expected range
    InvalidFormat = 0x02,
    /// The PDU is not expected at this moment
    UnexpectedPdu = 0x03,
    /// The computed confirmation value was not the received one
    ConfirmationFailed = 0x04,
    /// Out of resources
    OutOfResources = 0x05,
    /// Provisioning data could not be decrypted
    DecryptionFailed = 0x06,
    /// Unexpected error
    UnexpectedError = 0x07,
    /// Device cannot assign consecutive unicast addresses
    CannotAssignAddresses = 0x08,
}

impl TryFrom<u8> for FailureCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FailureCode::Prohibited),
            0x01 => Ok(FailureCode::InvalidPdu),
            0x02 => Ok(FailureCode::InvalidFormat),
            0x03 => Ok(FailureCode::UnexpectedPdu),
            0x04 => Ok(FailureCode::ConfirmationFailed),
            0x05 => Ok(FailureCode::OutOfResources),
            0x06 => Ok(FailureCode::DecryptionFailed),
            0x07 => Ok(FailureCode::UnexpectedError),
            0x08 => Ok(FailureCode::CannotAssignAddresses),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Flags octet of the provisioning data block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProvisioningFlags: u8 {
        /// Network key is in key refresh phase 2
        const KEY_REFRESH = 1 << 0;
        /// IV update in progress
        const IV_UPDATE = 1 << 1;
    }
}

const CAPABILITIES: FieldPlan = FieldPlan::new(&[
    Field::uint("elements", 8),
    Field::uint("algorithms", 16),
    Field::uint("public_key_type", 8),
    Field::uint("static_oob_type", 8),
    Field::uint("output_oob_size", 8),
    Field::uint("output_oob_action", 16),
    Field::uint("input_oob_size", 8),
    Field::uint("input_oob_action", 16),
]);

const START: FieldPlan = FieldPlan::new(&[
    Field::uint("algorithm", 8),
    Field::uint("public_key", 8),
    Field::uint("auth_method", 8),
    Field::uint("auth_action", 8),
    Field::uint("auth_size", 8),
]);

/// Key index goes out big-endian with its 4 spare bits on top, so index
/// 0x0567 is sent as `05 67`, like every other field of the block.
const PROVISIONING_DATA: FieldPlan = FieldPlan::new(&[
    Field::bytes("net_key", 16),
    Field::reserved(4),
    Field::uint("key_index", 12),
    Field::uint("flags", 8),
    Field::uint("iv_index", 32),
    Field::uint("unicast", 16),
]);

/// Device capability record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of elements
    pub elements: u8,
    /// Supported algorithms bitmap (bit 0: FIPS P-256)
    pub algorithms: u16,
    /// Public key OOB availability
    pub public_key_type: u8,
    /// Static OOB availability
    pub static_oob_type: u8,
    /// Maximum output OOB size
    pub output_oob_size: u8,
    /// Supported output OOB actions
    pub output_oob_action: u16,
    /// Maximum input OOB size
    pub input_oob_size: u8,
    /// Supported input OOB actions
    pub input_oob_action: u16,
}

impl Capabilities {
    fn encode(&self) -> Result<Vec<u8>, WireError> {
        CAPABILITIES.encode(
            Endian::Big,
            &[
                Value::from(self.elements),
                Value::from(self.algorithms),
                Value::from(self.public_key_type),
                Value::from(self.static_oob_type),
                Value::from(self.output_oob_size),
                Value::from(self.output_oob_action),
                Value::from(self.input_oob_size),
                Value::from(self.input_oob_action),
            ],
        )
    }

    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let d = CAPABILITIES.decode(Endian::Big, payload)?;
        Ok(Self {
            elements: d.uint("elements")? as u8,
            algorithms: d.uint("algorithms")? as u16,
            public_key_type: d.uint("public_key_type")? as u8,
            static_oob_type: d.uint("static_oob_type")? as u8,
            output_oob_size: d.uint("output_oob_size")? as u8,
            output_oob_action: d.uint("output_oob_action")? as u16,
            input_oob_size: d.uint("input_oob_size")? as u8,
            input_oob_action: d.uint("input_oob_action")? as u16,
        })
    }
}

/// Method selection sent in Provisioning Start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Start {
    /// Algorithm (0: FIPS P-256)
    pub algorithm: u8,
    /// Public key via OOB
    pub public_key: u8,
    /// Authentication method (0: no OOB)
    pub auth_method: u8,
    /// Authentication action
    pub auth_action: u8,
    /// Authentication size
    pub auth_size: u8,
}

impl Start {
    /// FIPS P-256, in-band public key, no OOB authentication
    pub fn no_oob() -> Self {
        Self::default()
    }

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        START.encode(
            Endian::Big,
            &[
                Value::from(self.algorithm),
                Value::from(self.public_key),
                Value::from(self.auth_method),
                Value::from(self.auth_action),
                Value::from(self.auth_size),
            ],
        )
    }

    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let d = START.decode(Endian::Big, payload)?;
        Ok(Self {
            algorithm: d.uint("algorithm")? as u8,
            public_key: d.uint("public_key")? as u8,
            auth_method: d.uint("auth_method")? as u8,
            auth_action: d.uint("auth_action")? as u8,
            auth_size: d.uint("auth_size")? as u8,
        })
    }
}

/// Cleartext provisioning data distributed to a new node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningData {
    /// Network key
    pub net_key: [u8; 16],
    /// Network key index (12 bits)
    pub key_index: u16,
    /// Key refresh / IV update flags
    pub flags: ProvisioningFlags,
    /// Current IV index
    pub iv_index: u32,
    /// Primary element address
    pub unicast_address: u16,
}

impl ProvisioningData {
    /// Pack the 25-byte block
    pub fn encode(&self) -> Result<[u8; PROVISIONING_DATA_SIZE], WireError> {
        let bytes = PROVISIONING_DATA.encode(
            Endian::Big,
            &[
                Value::bytes(&self.net_key),
                Value::from(self.key_index),
                Value::from(self.flags.bits()),
                Value::from(self.iv_index),
                Value::from(self.unicast_address),
            ],
        )?;
        let mut out = [0u8; PROVISIONING_DATA_SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Unpack the 25-byte block
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let d = PROVISIONING_DATA.decode(Endian::Big, buf)?;
        let mut net_key = [0u8; 16];
        net_key.copy_from_slice(&d.bytes("net_key")?);
        Ok(Self {
            net_key,
            key_index: d.uint("key_index")? as u16,
            flags: ProvisioningFlags::from_bits_truncate(d.uint("flags")? as u8),
            iv_index: d.uint("iv_index")? as u32,
            unicast_address: d.uint("unicast")? as u16,
        })
    }
}

/// A provisioning PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    /// Start of provisioning
    Invite {
        /// Attention timer in seconds
        attention_duration: u8,
    },
    /// Device capabilities
    Capabilities(Capabilities),
    /// Selected provisioning method
    Start(Start),
    /// Public key X ‖ Y
    PublicKey([u8; 64]),
    /// Input OOB finished
    InputComplete,
    /// Confirmation value
    Confirmation([u8; 16]),
    /// Random value
    Random([u8; 16]),
    /// Encrypted provisioning data and MIC
    Data {
        /// Encrypted block
        encrypted: [u8; PROVISIONING_DATA_SIZE],
        /// 64-bit MIC
        mic: [u8; PROVISIONING_DATA_MIC_SIZE],
    },
    /// Provisioning finished
    Complete,
    /// Provisioning aborted
    Failed(FailureCode),
}

impl ProvisioningPdu {
    /// PDU type octet
    pub fn pdu_type(&self) -> ProvPduType {
        match self {
            Self::Invite { .. } => ProvPduType::Invite,
            Self::Capabilities(_) => ProvPduType::Capabilities,
            Self::Start(_) => ProvPduType::Start,
            Self::PublicKey(_) => ProvPduType::PublicKey,
            Self::InputComplete => ProvPduType::InputComplete,
            Self::Confirmation(_) => ProvPduType::Confirmation,
            Self::Random(_) => ProvPduType::Random,
            Self::Data { .. } => ProvPduType::Data,
            Self::Complete => ProvPduType::Complete,
            Self::Failed(_) => ProvPduType::Failed,
        }
    }

    /// Payload without the type octet
    pub fn payload(&self) -> Result<Vec<u8>, WireError> {
        Ok(match self {
            Self::Invite { attention_duration } => vec![*attention_duration],
            Self::Capabilities(caps) => caps.encode()?,
            Self::Start(start) => start.encode()?,
            Self::PublicKey(key) => key.to_vec(),
            Self::InputComplete | Self::Complete => Vec::new(),
            Self::Confirmation(value) | Self::Random(value) => value.to_vec(),
            Self::Data { encrypted, mic } => [&encrypted[..], &mic[..]].concat(),
            Self::Failed(code) => vec![*code as u8],
        })
    }

    /// Type octet followed by the payload
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let payload = self.payload()?;
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(self.pdu_type() as u8);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parse a PDU, checking the payload length its type requires
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (&type_octet, payload) = buf.split_first().ok_or(WireError::Incomplete)?;
        let pdu_type = ProvPduType::try_from(type_octet)?;
        if payload.len() != pdu_type.payload_len() {
            return Err(WireError::PduLength {
                pdu_type: type_octet,
                len: payload.len(),
            });
        }

        Ok(match pdu_type {
            ProvPduType::Invite => Self::Invite {
                attention_duration: payload[0],
            },
            ProvPduType::Capabilities => Self::Capabilities(Capabilities::decode(payload)?),
            ProvPduType::Start => Self::Start(Start::decode(payload)?),
            ProvPduType::PublicKey => {
                let mut key = [0u8; 64];
                key.copy_from_slice(payload);
                Self::PublicKey(key)
            }
            ProvPduType::InputComplete => Self::InputComplete,
            ProvPduType::Confirmation | ProvPduType::Random => {
                let mut value = [0u8; 16];
                value.copy_from_slice(payload);
                if pdu_type == ProvPduType::Confirmation {
                    Self::Confirmation(value)
                } else {
                    Self::Random(value)
                }
            }
            ProvPduType::Data => {
                let mut encrypted = [0u8; PROVISIONING_DATA_SIZE];
                let mut mic = [0u8; PROVISIONING_DATA_MIC_SIZE];
                encrypted.copy_from_slice(&payload[..PROVISIONING_DATA_SIZE]);
                mic.copy_from_slice(&payload[PROVISIONING_DATA_SIZE..]);
                Self::Data { encrypted, mic }
            }
            ProvPduType::Complete => Self::Complete,
            ProvPduType::Failed => Self::Failed(FailureCode::try_from(payload[0])?),
        })
    }
}
