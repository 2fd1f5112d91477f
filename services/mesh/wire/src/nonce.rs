//! CCM nonces for the network, upper transport and proxy layers.

use crate::codec::{Endian, Field, FieldPlan, Value};
use crate::error::WireError;

/// All mesh nonces are 13 bytes
pub const NONCE_SIZE: usize = 13;

/// Nonce type octet
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceType {
    /// Network layer
    Network = 0x00,
    /// Upper transport, application key
    Application = 0x01,
    /// Upper transport, device key
    Device = 0x02,
    /// Proxy configuration
    Proxy = 0x03,
}

impl TryFrom<u8> for NonceType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NonceType::Network),
            0x01 => Ok(NonceType::Application),
            0x02 => Ok(NonceType::Device),
            0x03 => Ok(NonceType::Proxy),
            _ => Err(WireError::Type(value)),
        }
    }
}

const NETWORK_NONCE: FieldPlan = FieldPlan::new(&[
    Field::uint("type", 8),
    Field::uint("ctl", 1),
    Field::uint("ttl", 7),
    Field::uint("seq", 24),
    Field::uint("src", 16),
    Field::reserved(16),
    Field::uint("iv_index", 32),
]);

const TRANSPORT_NONCE: FieldPlan = FieldPlan::new(&[
    Field::uint("type", 8),
    Field::uint("aszmic", 1),
    Field::reserved(7),
    Field::uint("seq", 24),
    Field::uint("src", 16),
    Field::uint("dst", 16),
    Field::uint("iv_index", 32),
]);

const PROXY_NONCE: FieldPlan = FieldPlan::new(&[
    Field::uint("type", 8),
    Field::reserved(8),
    Field::uint("seq", 24),
    Field::uint("src", 16),
    Field::reserved(16),
    Field::uint("iv_index", 32),
]);

fn to_nonce(bytes: Vec<u8>) -> [u8; NONCE_SIZE] {
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&bytes);
    out
}

/// Network nonce
pub fn network_nonce(ctl: bool, ttl: u8, seq: u32, src: u16, iv_index: u32) -> Result<[u8; NONCE_SIZE], WireError> {
    let bytes = NETWORK_NONCE.encode(
        Endian::Big,
        &[
            Value::from(NonceType::Network as u8),
            Value::from(ctl),
            Value::from(ttl),
            Value::from(seq),
            Value::from(src),
            Value::from(iv_index),
        ],
    )?;
    Ok(to_nonce(bytes))
}

/// Upper transport nonce; `kind` selects application or device key
pub fn transport_nonce(
    kind: NonceType,
    aszmic: bool,
    seq: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> Result<[u8; NONCE_SIZE], WireError> {
    if !matches!(kind, NonceType::Application | NonceType::Device) {
        return Err(WireError::Type(kind as u8));
    }
    let bytes = TRANSPORT_NONCE.encode(
        Endian::Big,
        &[
            Value::from(kind as u8),
            Value::from(aszmic),
            Value::from(seq),
            Value::from(src),
            Value::from(dst),
            Value::from(iv_index),
        ],
    )?;
    Ok(to_nonce(bytes))
}

/// Proxy nonce
pub fn proxy_nonce(seq: u32, src: u16, iv_index: u32) -> Result<[u8; NONCE_SIZE], WireError> {
    let bytes = PROXY_NONCE.encode(
        Endian::Big,
        &[Value::from(NonceType::Proxy as u8), Value::from(seq), Value::from(src), Value::from(iv_index)],
    )?;
    Ok(to_nonce(bytes))
}
