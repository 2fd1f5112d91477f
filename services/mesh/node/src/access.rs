//! Access layer messages.
//!
//! An access payload is an opcode of one, two or three octets followed by
//! the message parameters:
//!
//! ```text
//! 0xxxxxxx                     1 octet  (0x7f reserved)
//! 10xxxxxx xxxxxxxx            2 octets, SIG
//! 11xxxxxx zzzzzzzz zzzzzzzz   3 octets, vendor (company id little-endian)
//! ```
//!
//! Parameters are little-endian; the non byte-aligned ones (packed key
//! indexes) are described by [`FieldPlan`]s.

use crate::error::NodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_crypto::Key128;
use mesh_wire::{Endian, Field, FieldPlan, Value, WireError};
use serde::Serialize;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)*) => {
        /// Access opcodes this node sends or answers
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum Opcode {
            $($(#[$doc])* $name,)*
        }

        impl Opcode {
            /// Numeric opcode, most significant octet first
            pub const fn value(self) -> u32 {
                match self {
                    $(Opcode::$name => $value,)*
                }
            }

            /// Opcode for a numeric value
            pub fn from_value(value: u32) -> Option<Self> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    /// Config AppKey Add
    ConfigAppKeyAdd = 0x00,
    /// Config Composition Data Status
    ConfigCompositionDataStatus = 0x02,
    /// Config AppKey Status
    ConfigAppKeyStatus = 0x8003,
    /// Config Composition Data Get
    ConfigCompositionDataGet = 0x8008,
    /// Config Default TTL Get
    ConfigDefaultTtlGet = 0x800c,
    /// Config Default TTL Status
    ConfigDefaultTtlStatus = 0x800e,
    /// Config Model App Bind
    ConfigModelAppBind = 0x803d,
    /// Config Model App Status
    ConfigModelAppStatus = 0x803e,
    /// Generic OnOff Get
    GenericOnOffGet = 0x8201,
    /// Generic OnOff Set
    GenericOnOffSet = 0x8202,
    /// Generic OnOff Set Unacknowledged
    GenericOnOffSetUnacknowledged = 0x8203,
    /// Generic OnOff Status
    GenericOnOffStatus = 0x8204,
}

impl Opcode {
    /// Status opcode that answers this one, if any
    pub const fn response(self) -> Option<Opcode> {
        match self {
            Opcode::ConfigAppKeyAdd => Some(Opcode::ConfigAppKeyStatus),
            Opcode::ConfigCompositionDataGet => Some(Opcode::ConfigCompositionDataStatus),
            Opcode::ConfigDefaultTtlGet => Some(Opcode::ConfigDefaultTtlStatus),
            Opcode::ConfigModelAppBind => Some(Opcode::ConfigModelAppStatus),
            Opcode::GenericOnOffGet | Opcode::GenericOnOffSet => Some(Opcode::GenericOnOffStatus),
            _ => None,
        }
    }

    /// Configuration messages are sealed with the device key
    pub const fn uses_device_key(self) -> bool {
        !matches!(
            self,
            Opcode::GenericOnOffGet
                | Opcode::GenericOnOffSet
                | Opcode::GenericOnOffSetUnacknowledged
                | Opcode::GenericOnOffStatus
        )
    }
}

/// Append the air encoding of `value`
pub fn put_opcode(value: u32, out: &mut BytesMut) -> Result<(), NodeError> {
    match value {
        0x00..=0x7e => out.put_u8(value as u8),
        0x8000..=0xbfff => out.put_u16(value as u16),
        0xc0_0000..=0xff_ffff => {
            out.put_u8((value >> 16) as u8);
            out.put_u16(value as u16);
        }
        _ => return Err(NodeError::UnknownOpcode(value)),
    }
    Ok(())
}

/// Split an access payload into its numeric opcode and parameters
pub fn split_opcode(payload: &[u8]) -> Result<(u32, &[u8]), NodeError> {
    let first = *payload.first().ok_or(WireError::Incomplete)?;
    let len = match first >> 6 {
        0 | 1 if first == 0x7f => return Err(NodeError::UnknownOpcode(0x7f)),
        0 | 1 => 1,
        2 => 2,
        _ => 3,
    };
    if payload.len() < len {
        return Err(WireError::Incomplete.into());
    }
    let value = payload[..len].iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
    Ok((value, &payload[len..]))
}

/// Opcode plus parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    /// Message opcode
    pub opcode: Opcode,
    /// Encoded parameters
    pub params: Bytes,
}

impl AccessPdu {
    /// PDU with raw parameters
    pub fn new(opcode: Opcode, params: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            params: params.into(),
        }
    }

    /// Opcode octets followed by the parameters
    pub fn encode(&self) -> Result<Bytes, NodeError> {
        let mut out = BytesMut::with_capacity(3 + self.params.len());
        put_opcode(self.opcode.value(), &mut out)?;
        out.extend_from_slice(&self.params);
        Ok(out.freeze())
    }

    /// Parse an access payload; opcodes outside [`Opcode`] are rejected
    pub fn decode(payload: &[u8]) -> Result<Self, NodeError> {
        let (value, params) = split_opcode(payload)?;
        let opcode = Opcode::from_value(value).ok_or(NodeError::UnknownOpcode(value))?;
        Ok(Self::new(opcode, Bytes::copy_from_slice(params)))
    }
}

/// A message with a fixed opcode and typed parameters
pub trait Message: Sized {
    /// Opcode the message travels under
    const OPCODE: Opcode;

    /// Pack the parameters
    fn encode_params(&self) -> Result<Vec<u8>, WireError>;

    /// Unpack the parameters
    fn decode_params(params: &[u8]) -> Result<Self, WireError>;

    /// The message as a PDU
    fn to_pdu(&self) -> Result<AccessPdu, WireError> {
        Ok(AccessPdu::new(Self::OPCODE, self.encode_params()?))
    }

    /// Typed view of `pdu`, which must carry [`Message::OPCODE`]
    fn from_pdu(pdu: &AccessPdu) -> Result<Self, NodeError> {
        if pdu.opcode != Self::OPCODE {
            return Err(NodeError::UnknownOpcode(pdu.opcode.value()));
        }
        Ok(Self::decode_params(&pdu.params)?)
    }
}

/// Status code of a successful configuration change
pub const STATUS_SUCCESS: u8 = 0x00;
/// Status: invalid address
pub const STATUS_INVALID_ADDRESS: u8 = 0x01;
/// Status: invalid model
pub const STATUS_INVALID_MODEL: u8 = 0x02;
/// Status: invalid application key index
pub const STATUS_INVALID_APP_KEY_INDEX: u8 = 0x03;
/// Status: invalid network key index
pub const STATUS_INVALID_NET_KEY_INDEX: u8 = 0x04;

const APP_KEY_ADD: FieldPlan = FieldPlan::new(&[
    Field::uint("net_key_index", 12),
    Field::uint("app_key_index", 12),
    Field::bytes("app_key", 16),
]);

const APP_KEY_STATUS: FieldPlan = FieldPlan::new(&[
    Field::uint("status", 8),
    Field::uint("net_key_index", 12),
    Field::uint("app_key_index", 12),
]);

// Encoding picks the plan from the model id kind; decoding lets the length decide.
const MODEL_APP_SIG: FieldPlan = FieldPlan::new(&[
    Field::uint("element_address", 16),
    Field::uint("app_key_index", 16),
    Field::uint("model", 16),
]);

const MODEL_APP_VENDOR: FieldPlan = FieldPlan::new(&[
    Field::uint("element_address", 16),
    Field::uint("app_key_index", 16),
    Field::uint("model", 32),
]);

const MODEL_APP: FieldPlan = FieldPlan::new(&[
    Field::uint("element_address", 16),
    Field::uint("app_key_index", 16),
    Field::one_of("model", &[16, 32]),
]);

const ONOFF_SET: FieldPlan = FieldPlan::new(&[
    Field::uint("onoff", 8),
    Field::uint("tid", 8),
    Field::uint("transition_time", 8).optional(),
    Field::uint("delay", 8).optional(),
]);

const ONOFF_STATUS: FieldPlan = FieldPlan::new(&[
    Field::uint("present", 8),
    Field::uint("target", 8).optional(),
    Field::uint("remaining_time", 8).optional(),
]);

const COMPOSITION_HEADER: FieldPlan = FieldPlan::new(&[
    Field::uint("page", 8),
    Field::uint("cid", 16),
    Field::uint("pid", 16),
    Field::uint("vid", 16),
    Field::uint("crpl", 16),
    Field::uint("features", 16),
    Field::remainder("elements", 8),
]);

fn no_params(params: &[u8]) -> Result<(), WireError> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(WireError::Length {
            expected: 0,
            actual: params.len() * 8,
        })
    }
}

fn key128(bytes: Vec<u8>) -> Result<Key128, WireError> {
    bytes.try_into().map_err(|_| WireError::Malformed)
}

/// Identifier of a model: 16-bit SIG id or company plus vendor model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelId {
    /// Bluetooth SIG model
    Sig(u16),
    /// Vendor model
    Vendor {
        /// Company identifier
        company: u16,
        /// Model identifier within the company
        model: u16,
    },
}

impl ModelId {
    /// Configuration Server
    pub const CONFIG_SERVER: ModelId = ModelId::Sig(0x0000);
    /// Configuration Client
    pub const CONFIG_CLIENT: ModelId = ModelId::Sig(0x0001);
    /// Generic OnOff Server
    pub const GENERIC_ONOFF_SERVER: ModelId = ModelId::Sig(0x1000);
    /// Generic OnOff Client
    pub const GENERIC_ONOFF_CLIENT: ModelId = ModelId::Sig(0x1001);

    fn raw(self) -> u64 {
        match self {
            ModelId::Sig(id) => id as u64,
            ModelId::Vendor { company, model } => company as u64 | (model as u64) << 16,
        }
    }

    fn from_raw(raw: u64, vendor: bool) -> Self {
        if vendor {
            ModelId::Vendor {
                company: raw as u16,
                model: (raw >> 16) as u16,
            }
        } else {
            ModelId::Sig(raw as u16)
        }
    }
}

fn encode_model_app(element_address: u16, app_key_index: u16, model: ModelId) -> Result<Vec<u8>, WireError> {
    let plan = match model {
        ModelId::Sig(_) => MODEL_APP_SIG,
        ModelId::Vendor { .. } => MODEL_APP_VENDOR,
    };
    plan.encode(
        Endian::Little,
        &[element_address.into(), app_key_index.into(), Value::Uint(model.raw())],
    )
}

fn decode_model_app(params: &[u8]) -> Result<(u16, u16, ModelId), WireError> {
    let d = MODEL_APP.decode(Endian::Little, params)?;
    Ok((
        d.uint("element_address")? as u16,
        d.uint("app_key_index")? as u16,
        ModelId::from_raw(d.uint("model")?, params.len() == 8),
    ))
}

/// Config AppKey Add: hands an application key to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppKeyAdd {
    /// Network key the application key is bound to
    pub net_key_index: u16,
    /// Global index of the application key
    pub app_key_index: u16,
    /// Key material
    pub app_key: Key128,
}

impl Message for AppKeyAdd {
    const OPCODE: Opcode = Opcode::ConfigAppKeyAdd;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        APP_KEY_ADD.encode(
            Endian::Little,
            &[
                self.net_key_index.into(),
                self.app_key_index.into(),
                Value::bytes(&self.app_key),
            ],
        )
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let d = APP_KEY_ADD.decode(Endian::Little, params)?;
        Ok(Self {
            net_key_index: d.uint("net_key_index")? as u16,
            app_key_index: d.uint("app_key_index")? as u16,
            app_key: key128(d.bytes("app_key")?)?,
        })
    }
}

/// Config AppKey Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppKeyStatus {
    /// Status code
    pub status: u8,
    /// Network key index from the request
    pub net_key_index: u16,
    /// Application key index from the request
    pub app_key_index: u16,
}

impl Message for AppKeyStatus {
    const OPCODE: Opcode = Opcode::ConfigAppKeyStatus;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        APP_KEY_STATUS.encode(
            Endian::Little,
            &[
                self.status.into(),
                self.net_key_index.into(),
                self.app_key_index.into(),
            ],
        )
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let d = APP_KEY_STATUS.decode(Endian::Little, params)?;
        Ok(Self {
            status: d.uint("status")? as u8,
            net_key_index: d.uint("net_key_index")? as u16,
            app_key_index: d.uint("app_key_index")? as u16,
        })
    }
}

/// Config Model App Bind: binds an application key to a model of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAppBind {
    /// Element hosting the model
    pub element_address: u16,
    /// Application key to bind
    pub app_key_index: u16,
    /// Model to bind it to
    pub model: ModelId,
}

impl Message for ModelAppBind {
    const OPCODE: Opcode = Opcode::ConfigModelAppBind;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        encode_model_app(self.element_address, self.app_key_index, self.model)
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let (element_address, app_key_index, model) = decode_model_app(params)?;
        Ok(Self {
            element_address,
            app_key_index,
            model,
        })
    }
}

/// Config Model App Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAppStatus {
    /// Status code
    pub status: u8,
    /// Element from the request
    pub element_address: u16,
    /// Application key from the request
    pub app_key_index: u16,
    /// Model from the request
    pub model: ModelId,
}

impl Message for ModelAppStatus {
    const OPCODE: Opcode = Opcode::ConfigModelAppStatus;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        let mut out = vec![self.status];
        out.extend(encode_model_app(self.element_address, self.app_key_index, self.model)?);
        Ok(out)
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let (status, rest) = params.split_first().ok_or(WireError::Incomplete)?;
        let (element_address, app_key_index, model) = decode_model_app(rest)?;
        Ok(Self {
            status: *status,
            element_address,
            app_key_index,
            model,
        })
    }
}

/// Config Composition Data Get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionDataGet {
    /// Page number; only page 0 is defined
    pub page: u8,
}

impl Message for CompositionDataGet {
    const OPCODE: Opcode = Opcode::ConfigCompositionDataGet;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        Ok(vec![self.page])
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        match params {
            [page] => Ok(Self { page: *page }),
            _ => Err(WireError::Length {
                expected: 8,
                actual: params.len() * 8,
            }),
        }
    }
}

/// One element of the composition data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Element {
    /// GATT namespace location descriptor
    pub location: u16,
    /// SIG models hosted by the element
    pub sig_models: Vec<u16>,
    /// Vendor models hosted by the element
    pub vendor_models: Vec<ModelId>,
}

/// Config Composition Data Status, page 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositionData {
    /// Page number
    pub page: u8,
    /// Company identifier
    pub cid: u16,
    /// Product identifier
    pub pid: u16,
    /// Version identifier
    pub vid: u16,
    /// Minimum number of replay protection list entries
    pub crpl: u16,
    /// Relay, proxy, friend and low power feature bits
    pub features: u16,
    /// Elements, primary first
    pub elements: Vec<Element>,
}

impl Message for CompositionData {
    const OPCODE: Opcode = Opcode::ConfigCompositionDataStatus;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        let mut elements = BytesMut::new();
        for element in &self.elements {
            let sig = u8::try_from(element.sig_models.len()).map_err(|_| WireError::Overflow("sig_models"))?;
            let vendor =
                u8::try_from(element.vendor_models.len()).map_err(|_| WireError::Overflow("vendor_models"))?;
            elements.put_u16_le(element.location);
            elements.put_u8(sig);
            elements.put_u8(vendor);
            for id in &element.sig_models {
                elements.put_u16_le(*id);
            }
            for model in &element.vendor_models {
                match model {
                    ModelId::Vendor { company, model } => {
                        elements.put_u16_le(*company);
                        elements.put_u16_le(*model);
                    }
                    ModelId::Sig(_) => return Err(WireError::Kind("vendor_models")),
                }
            }
        }
        COMPOSITION_HEADER.encode(
            Endian::Little,
            &[
                self.page.into(),
                self.cid.into(),
                self.pid.into(),
                self.vid.into(),
                self.crpl.into(),
                self.features.into(),
                Value::bytes(&elements),
            ],
        )
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let d = COMPOSITION_HEADER.decode(Endian::Little, params)?;
        let raw = d.bytes("elements")?;
        let mut buf = raw.as_slice();
        let mut elements = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(WireError::Incomplete);
            }
            let location = buf.get_u16_le();
            let num_s = buf.get_u8() as usize;
            let num_v = buf.get_u8() as usize;
            if buf.remaining() < num_s * 2 + num_v * 4 {
                return Err(WireError::Incomplete);
            }
            let sig_models = (0..num_s).map(|_| buf.get_u16_le()).collect();
            let vendor_models = (0..num_v)
                .map(|_| ModelId::Vendor {
                    company: buf.get_u16_le(),
                    model: buf.get_u16_le(),
                })
                .collect();
            elements.push(Element {
                location,
                sig_models,
                vendor_models,
            });
        }
        Ok(Self {
            page: d.uint("page")? as u8,
            cid: d.uint("cid")? as u16,
            pid: d.uint("pid")? as u16,
            vid: d.uint("vid")? as u16,
            crpl: d.uint("crpl")? as u16,
            features: d.uint("features")? as u16,
            elements,
        })
    }
}

/// Config Default TTL Get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTtlGet;

impl Message for DefaultTtlGet {
    const OPCODE: Opcode = Opcode::ConfigDefaultTtlGet;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        Ok(Vec::new())
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        no_params(params).map(|_| Self)
    }
}

/// Config Default TTL Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTtlStatus {
    /// Default TTL of the node
    pub ttl: u8,
}

impl Message for DefaultTtlStatus {
    const OPCODE: Opcode = Opcode::ConfigDefaultTtlStatus;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        Ok(vec![self.ttl])
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        match params {
            [ttl] => Ok(Self { ttl: *ttl }),
            _ => Err(WireError::Length {
                expected: 8,
                actual: params.len() * 8,
            }),
        }
    }
}

/// Generic OnOff Get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnOffGet;

impl Message for OnOffGet {
    const OPCODE: Opcode = Opcode::GenericOnOffGet;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        Ok(Vec::new())
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        no_params(params).map(|_| Self)
    }
}

/// Optional transition of a Generic OnOff Set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Generic Default Transition Time format
    pub time: u8,
    /// Delay in 5ms steps
    pub delay: u8,
}

/// Generic OnOff Set; the same parameters travel unacknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnOffSet {
    /// Target state
    pub on: bool,
    /// Transaction identifier
    pub tid: u8,
    /// Transition to the target state
    pub transition: Option<Transition>,
}

impl OnOffSet {
    /// The same message as Generic OnOff Set Unacknowledged
    pub fn to_unacknowledged_pdu(&self) -> Result<AccessPdu, WireError> {
        Ok(AccessPdu::new(Opcode::GenericOnOffSetUnacknowledged, self.encode_params()?))
    }
}

impl Message for OnOffSet {
    const OPCODE: Opcode = Opcode::GenericOnOffSet;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        let mut values = vec![Value::from(self.on), self.tid.into()];
        if let Some(t) = self.transition {
            values.push(t.time.into());
            values.push(t.delay.into());
        }
        ONOFF_SET.encode(Endian::Little, &values)
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let d = ONOFF_SET.decode(Endian::Little, params)?;
        let transition = if d.contains("transition_time") {
            Some(Transition {
                time: d.uint("transition_time")? as u8,
                delay: d.uint("delay")? as u8,
            })
        } else {
            None
        };
        Ok(Self {
            on: d.uint("onoff")? != 0,
            tid: d.uint("tid")? as u8,
            transition,
        })
    }
}

/// Generic OnOff Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnOffStatus {
    /// Current state
    pub present: bool,
    /// Target state and remaining transition time, while transitioning
    pub target: Option<(bool, u8)>,
}

impl Message for OnOffStatus {
    const OPCODE: Opcode = Opcode::GenericOnOffStatus;

    fn encode_params(&self) -> Result<Vec<u8>, WireError> {
        let mut values = vec![Value::from(self.present)];
        if let Some((target, remaining)) = self.target {
            values.push(target.into());
            values.push(remaining.into());
        }
        ONOFF_STATUS.encode(Endian::Little, &values)
    }

    fn decode_params(params: &[u8]) -> Result<Self, WireError> {
        let d = ONOFF_STATUS.decode(Endian::Little, params)?;
        let target = if d.contains("target") {
            Some((d.uint("target")? != 0, d.uint("remaining_time")? as u8))
        } else {
            None
        };
        Ok(Self {
            present: d.uint("present")? != 0,
            target,
        })
    }
}
