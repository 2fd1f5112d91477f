//! Bit-level field codec.
//!
//! Every PDU whose fields are not byte aligned is described by a [`FieldPlan`]:
//! an ordered, `const` list of [`Field`]s. The plan packs values into a byte
//! buffer and unpacks them again, either as an MSB-first bit stream
//! ([`Endian::Big`], the layout used by network and transport headers) or as
//! an LSB-first bit stream with little-endian values ([`Endian::Little`], the
//! layout of access message parameters).
//!
//! ```text
//! Field::uint("ctl", 1)      1 bit value
//! Field::reserved(7)         7 zero bits, no value bound
//! Field::bytes("key", 16)    16 x 8 bit elements
//! Field::remainder("pdu", 8) whatever is left, in 8 bit elements
//! Field::one_of("model", &[16, 32])  width picked from the value / length
//! ```
//!
//! At most one variable-width field (`remainder` or `one_of`) is allowed per
//! plan. Optional fields must trail the plan, must be fixed width and cannot
//! be combined with a variable-width field.

use crate::error::WireError;

/// Bit order used for a whole encode or decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// MSB-first bit stream, big-endian values
    Big,
    /// LSB-first bit stream, little-endian values
    Little,
}

/// Element count of an array field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    /// Exactly this many elements
    Fixed(usize),
    /// Everything left once fixed fields are accounted for
    Remainder,
}

/// How a field occupies the bit stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned integer of the given width (1..=64)
    Uint(u8),
    /// Zero padding that binds no value
    Reserved(u8),
    /// Array of fixed-width elements
    Array {
        /// Width of every element in bits
        elem_bits: u8,
        /// Element count
        len: ArrayLen,
    },
    /// Integer whose width is one of the admissible sizes
    OneOf(&'static [u8]),
}

/// One entry of a [`FieldPlan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field name used to look up decoded values
    pub name: &'static str,
    /// Layout of the field
    pub kind: FieldKind,
    /// Present only if the input is long enough
    pub optional: bool,
}

impl Field {
    /// Unsigned integer field
    pub const fn uint(name: &'static str, bits: u8) -> Self {
        Self { name, kind: FieldKind::Uint(bits), optional: false }
    }

    /// Padding bits
    pub const fn reserved(bits: u8) -> Self {
        Self { name: "", kind: FieldKind::Reserved(bits), optional: false }
    }

    /// Fixed-length byte array
    pub const fn bytes(name: &'static str, len: usize) -> Self {
        Self::array(name, 8, len)
    }

    /// Fixed-length array of `elem_bits` wide elements
    pub const fn array(name: &'static str, elem_bits: u8, len: usize) -> Self {
        Self {
            name,
            kind: FieldKind::Array { elem_bits, len: ArrayLen::Fixed(len) },
            optional: false,
        }
    }

    /// Array consuming the remainder of the input
    pub const fn remainder(name: &'static str, elem_bits: u8) -> Self {
        Self {
            name,
            kind: FieldKind::Array { elem_bits, len: ArrayLen::Remainder },
            optional: false,
        }
    }

    /// Integer with one of several admissible widths
    pub const fn one_of(name: &'static str, widths: &'static [u8]) -> Self {
        Self { name, kind: FieldKind::OneOf(widths), optional: false }
    }

    /// Mark the field as optional trailing data
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn fixed_bits(&self) -> Option<usize> {
        match self.kind {
            FieldKind::Uint(bits) | FieldKind::Reserved(bits) => Some(bits as usize),
            FieldKind::Array { elem_bits, len: ArrayLen::Fixed(n) } => Some(elem_bits as usize * n),
            FieldKind::Array { len: ArrayLen::Remainder, .. } | FieldKind::OneOf(_) => None,
        }
    }
}

/// A value bound to a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer value
    Uint(u64),
    /// Array elements
    Array(Vec<u64>),
}

impl Value {
    /// Byte array value
    pub fn bytes(data: &[u8]) -> Self {
        Value::Array(data.iter().map(|b| *b as u64).collect())
    }

    /// Integer content, if any
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Array(_) => None,
        }
    }

    /// Array content narrowed to bytes, if every element fits
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Array(items) => items.iter().map(|v| u8::try_from(*v).ok()).collect(),
            Value::Uint(_) => None,
        }
    }
}

macro_rules! value_from_uint {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Uint(v as u64)
            }
        })*
    };
}

value_from_uint!(u8, u16, u32, u64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::bytes(v)
    }
}

/// Values produced by [`FieldPlan::decode`], addressable by field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    entries: Vec<(&'static str, Value)>,
}

impl Decoded {
    /// Look up a field
    pub fn get(&self, name: &'static str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Whether an optional field was present
    pub fn contains(&self, name: &'static str) -> bool {
        self.get(name).is_some()
    }

    /// Integer field
    pub fn uint(&self, name: &'static str) -> Result<u64, WireError> {
        self.get(name)
            .ok_or(WireError::Field(name))?
            .as_uint()
            .ok_or(WireError::Kind(name))
    }

    /// Byte array field
    pub fn bytes(&self, name: &'static str) -> Result<Vec<u8>, WireError> {
        self.get(name)
            .ok_or(WireError::Field(name))?
            .to_bytes()
            .ok_or(WireError::Kind(name))
    }

    /// Values in field order
    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }
}

struct BitWriter {
    buf: Vec<u8>,
    pos: usize,
    endian: Endian,
}

impl BitWriter {
    fn new(endian: Endian) -> Self {
        Self { buf: Vec::new(), pos: 0, endian }
    }

    fn set_bit(&mut self, bit: bool) {
        let byte = self.pos / 8;
        if byte == self.buf.len() {
            self.buf.push(0);
        }
        if bit {
            self.buf[byte] |= match self.endian {
                Endian::Big => 0x80 >> (self.pos % 8),
                Endian::Little => 1 << (self.pos % 8),
            };
        }
        self.pos += 1;
    }

    fn put(&mut self, value: u64, width: u8) {
        match self.endian {
            Endian::Big => {
                for i in (0..width).rev() {
                    self.set_bit((value >> i) & 1 == 1);
                }
            }
            Endian::Little => {
                for i in 0..width {
                    self.set_bit((value >> i) & 1 == 1);
                }
            }
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self { buf, pos: 0, endian }
    }

    fn bit(&mut self) -> u64 {
        let byte = self.buf[self.pos / 8];
        let set = match self.endian {
            Endian::Big => byte & (0x80 >> (self.pos % 8)),
            Endian::Little => byte & (1 << (self.pos % 8)),
        };
        self.pos += 1;
        (set != 0) as u64
    }

    fn take(&mut self, width: u8) -> u64 {
        let mut value = 0u64;
        match self.endian {
            Endian::Big => {
                for _ in 0..width {
                    value = (value << 1) | self.bit();
                }
            }
            Endian::Little => {
                for i in 0..width {
                    value |= self.bit() << i;
                }
            }
        }
        value
    }
}

fn fits(value: u64, width: u8) -> bool {
    width >= 64 || value < (1u64 << width)
}

/// Ordered field descriptor for one PDU layout
#[derive(Debug, Clone, Copy)]
pub struct FieldPlan {
    fields: &'static [Field],
}

impl FieldPlan {
    /// Wrap a field list
    pub const fn new(fields: &'static [Field]) -> Self {
        Self { fields }
    }

    /// The fields of this plan
    pub fn fields(&self) -> &'static [Field] {
        self.fields
    }

    /// Total width in bits when every field is fixed and present
    pub fn fixed_bits(&self) -> Option<usize> {
        self.fields.iter().map(Field::fixed_bits).sum()
    }

    fn validate(&self) -> Result<(), WireError> {
        let mut variable = 0;
        let mut seen_optional = false;
        for field in self.fields {
            let width_ok = match field.kind {
                FieldKind::Uint(bits) | FieldKind::Reserved(bits) => (1..=64).contains(&bits),
                FieldKind::Array { elem_bits, .. } => (1..=64).contains(&elem_bits),
                FieldKind::OneOf(widths) => {
                    !widths.is_empty() && widths.iter().all(|w| (1..=64).contains(w))
                }
            };
            if !width_ok {
                return Err(WireError::Plan("field width must be 1..=64 bits"));
            }
            if field.fixed_bits().is_none() {
                variable += 1;
            }
            if field.optional {
                if field.fixed_bits().is_none() {
                    return Err(WireError::Plan("optional field must be fixed width"));
                }
                seen_optional = true;
            } else if seen_optional {
                return Err(WireError::Plan("optional fields must trail the plan"));
            }
        }
        if variable > 1 {
            return Err(WireError::Plan("more than one variable-width field"));
        }
        if variable == 1 && seen_optional {
            return Err(WireError::Plan("optional fields cannot follow a variable-width field"));
        }
        Ok(())
    }

    /// Pack `values` (one per non-reserved field, in order) into bytes.
    ///
    /// Trailing optional fields may be omitted by passing fewer values.
    pub fn encode(&self, endian: Endian, values: &[Value]) -> Result<Vec<u8>, WireError> {
        self.validate()?;
        let mut writer = BitWriter::new(endian);
        let mut values = values.iter();

        for field in self.fields {
            if let FieldKind::Reserved(bits) = field.kind {
                writer.put(0, bits);
                continue;
            }
            let value = match values.next() {
                Some(value) => value,
                None if field.optional => break,
                None => return Err(WireError::MissingValue(field.name)),
            };
            match (field.kind, value) {
                (FieldKind::Uint(bits), Value::Uint(v)) => {
                    if !fits(*v, bits) {
                        return Err(WireError::Overflow(field.name));
                    }
                    writer.put(*v, bits);
                }
                (FieldKind::OneOf(widths), Value::Uint(v)) => {
                    let bits = widths
                        .iter()
                        .copied()
                        .filter(|w| fits(*v, *w))
                        .min()
                        .ok_or(WireError::Overflow(field.name))?;
                    writer.put(*v, bits);
                }
                (FieldKind::Array { elem_bits, len }, Value::Array(items)) => {
                    if let ArrayLen::Fixed(n) = len {
                        if items.len() != n {
                            return Err(WireError::Length {
                                expected: n * elem_bits as usize,
                                actual: items.len() * elem_bits as usize,
                            });
                        }
                    }
                    for item in items {
                        if !fits(*item, elem_bits) {
                            return Err(WireError::Overflow(field.name));
                        }
                        writer.put(*item, elem_bits);
                    }
                }
                _ => return Err(WireError::Kind(field.name)),
            }
        }

        let extra = values.count();
        if extra > 0 {
            return Err(WireError::TooManyValues(extra));
        }
        if writer.pos % 8 != 0 {
            return Err(WireError::Unaligned(writer.pos));
        }
        Ok(writer.buf)
    }

    /// Unpack `input` into named values.
    pub fn decode(&self, endian: Endian, input: &[u8]) -> Result<Decoded, WireError> {
        self.validate()?;
        let total = input.len() * 8;

        let mandatory: usize = self
            .fields
            .iter()
            .filter(|f| !f.optional)
            .filter_map(Field::fixed_bits)
            .sum();
        let optional: usize = self
            .fields
            .iter()
            .filter(|f| f.optional)
            .filter_map(Field::fixed_bits)
            .sum();
        let has_variable = self.fields.iter().any(|f| f.fixed_bits().is_none());

        let (with_optional, variable_bits) = if has_variable {
            if total < mandatory {
                return Err(WireError::Length { expected: mandatory, actual: total });
            }
            (false, total - mandatory)
        } else if total == mandatory + optional {
            (true, 0)
        } else if total == mandatory {
            (false, 0)
        } else {
            return Err(WireError::Length { expected: mandatory + optional, actual: total });
        };

        let mut reader = BitReader::new(input, endian);
        let mut entries = Vec::with_capacity(self.fields.len());

        for field in self.fields {
            if field.optional && !with_optional {
                break;
            }
            let value = match field.kind {
                FieldKind::Reserved(bits) => {
                    reader.take(bits);
                    None
                }
                FieldKind::Uint(bits) => Some(Value::Uint(reader.take(bits))),
                FieldKind::OneOf(widths) => {
                    let bits = widths
                        .iter()
                        .copied()
                        .find(|w| *w as usize == variable_bits)
                        .ok_or(WireError::Length {
                            expected: mandatory + widths.iter().copied().max().unwrap_or(0) as usize,
                            actual: total,
                        })?;
                    Some(Value::Uint(reader.take(bits)))
                }
                FieldKind::Array { elem_bits, len } => {
                    let count = match len {
                        ArrayLen::Fixed(n) => n,
                        ArrayLen::Remainder => {
                            if variable_bits % elem_bits as usize != 0 {
                                return Err(WireError::Remainder(field.name));
                            }
                            variable_bits / elem_bits as usize
                        }
                    };
                    Some(Value::Array((0..count).map(|_| reader.take(elem_bits)).collect()))
                }
            };
            if let Some(value) = value {
                entries.push((field.name, value));
            }
        }

        Ok(Decoded { entries })
    }
}
