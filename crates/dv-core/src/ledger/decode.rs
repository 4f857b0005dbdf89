//! Generic schema-driven account codec
//!
//! One routine walks an [`AccountSchema`] and reads (or writes) every field in
//! order. Nothing is returned unless the whole layout decoded.

use thiserror::Error;

use super::schema::{AccountSchema, FieldType, DISCRIMINATOR_LEN};
use super::Pubkey;

/// Failure to turn account bytes into a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} account too short: need at least {needed} bytes, got {actual}")]
    TooShort { kind: &'static str, needed: usize, actual: usize },

    #[error("field `{field}` runs past the end of the buffer at offset {offset}")]
    Truncated { field: &'static str, offset: usize },

    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field `{field}` has invalid bool byte {value}")]
    InvalidBool { field: &'static str, value: u8 },

    #[error("field `{field}` has unknown enum tag {value}")]
    InvalidEnumTag { field: &'static str, value: u8 },

    #[error("field `{field}` is {len} bytes, layout allows {max}")]
    StringTooLong { field: &'static str, len: usize, max: usize },

    #[error("{kind} layout mismatch: {trailing} non-zero trailing bytes")]
    LayoutMismatch { kind: &'static str, trailing: usize },

    #[error("no {kind} layout for program version {version}")]
    UnsupportedVersion { kind: &'static str, version: u16 },

    #[error("expected a {expected} account, found {found}")]
    UnexpectedKind { expected: &'static str, found: String },

    #[error("field `{0}` missing or of the wrong type")]
    MissingField(&'static str),
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Pubkey(Pubkey),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I64(i64),
    Bool(bool),
    Bytes32([u8; 32]),
    Str(String),
    Tag(u8),
}

/// Conversion out of a [`Value`]
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! from_value {
    ($ty:ty, $variant:ident) => {
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

from_value!(Pubkey, Pubkey);
from_value!(u16, U16);
from_value!(u32, U32);
from_value!(u64, U64);
from_value!(i64, I64);
from_value!(bool, Bool);
from_value!([u8; 32], Bytes32);
from_value!(String, Str);

impl FromValue for u8 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U8(v) | Value::Tag(v) => Some(*v),
            _ => None,
        }
    }
}

/// Named field values in layout order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    values: Vec<(&'static str, Value)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: append a field
    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.values.push((name, value));
        self
    }

    fn raw(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Required field
    pub fn get<T: FromValue>(&self, name: &'static str) -> Result<T, DecodeError> {
        self.raw(name)
            .and_then(T::from_value)
            .ok_or(DecodeError::MissingField(name))
    }

    /// Field that older layouts do not carry
    pub fn opt<T: FromValue>(&self, name: &'static str) -> Result<Option<T>, DecodeError> {
        match self.raw(name) {
            None => Ok(None),
            Some(v) => T::from_value(v).map(Some).ok_or(DecodeError::MissingField(name)),
        }
    }
}

/// Cursor over the account body
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated { field, offset: self.offset })?;
        let out = &self.data[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn read(&mut self, field: &'static str, ty: FieldType) -> Result<Value, DecodeError> {
        Ok(match ty {
            FieldType::Pubkey => Value::Pubkey(Pubkey::new(self.array::<32>(field)?)),
            FieldType::Bytes32 => Value::Bytes32(self.array::<32>(field)?),
            FieldType::U8 => Value::U8(self.array::<1>(field)?[0]),
            FieldType::U16 => Value::U16(u16::from_le_bytes(self.array(field)?)),
            FieldType::U32 => Value::U32(u32::from_le_bytes(self.array(field)?)),
            FieldType::U64 => Value::U64(u64::from_le_bytes(self.array(field)?)),
            FieldType::I64 => Value::I64(i64::from_le_bytes(self.array(field)?)),
            FieldType::Bool => match self.array::<1>(field)?[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                value => return Err(DecodeError::InvalidBool { field, value }),
            },
            FieldType::Tag { variants } => {
                let value = self.array::<1>(field)?[0];
                if value >= variants {
                    return Err(DecodeError::InvalidEnumTag { field, value });
                }
                Value::Tag(value)
            }
            FieldType::Str { max_len } => {
                let len = u32::from_le_bytes(self.array(field)?) as usize;
                if len > max_len {
                    return Err(DecodeError::StringTooLong { field, len, max: max_len });
                }
                let bytes = self.take(field, len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { field })?;
                Value::Str(s.to_string())
            }
        })
    }
}

/// Decode the body of an account (everything after the discriminator)
///
/// `data` must be the whole account including the discriminator.
pub fn decode_fields(schema: &AccountSchema, data: &[u8]) -> Result<Fields, DecodeError> {
    let kind = schema.kind.account_name();
    if data.len() < schema.min_len() {
        return Err(DecodeError::TooShort { kind, needed: schema.min_len(), actual: data.len() });
    }

    let mut reader = Reader { data: &data[DISCRIMINATOR_LEN..], offset: 0 };
    let mut fields = Fields::new();
    for spec in schema.fields {
        let value = reader.read(spec.name, spec.ty)?;
        fields.values.push((spec.name, value));
    }

    // Allocations are zero-padded, so anything else after the last field
    // means the bytes were written by a different layout.
    let trailing = reader.data[reader.offset..].iter().filter(|b| **b != 0).count();
    if trailing > 0 {
        return Err(DecodeError::LayoutMismatch { kind, trailing });
    }

    Ok(fields)
}

/// Encode a full account (discriminator + body, zero-padded to the
/// allocated size)
pub fn encode_fields(schema: &AccountSchema, fields: &Fields) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(schema.max_len());
    out.extend_from_slice(&schema.kind.discriminator());

    for spec in schema.fields {
        let name = spec.name;
        match spec.ty {
            FieldType::Pubkey => out.extend_from_slice(fields.get::<Pubkey>(name)?.as_bytes()),
            FieldType::Bytes32 => out.extend_from_slice(&fields.get::<[u8; 32]>(name)?),
            FieldType::U8 | FieldType::Tag { .. } => out.push(fields.get::<u8>(name)?),
            FieldType::U16 => out.extend_from_slice(&fields.get::<u16>(name)?.to_le_bytes()),
            FieldType::U32 => out.extend_from_slice(&fields.get::<u32>(name)?.to_le_bytes()),
            FieldType::U64 => out.extend_from_slice(&fields.get::<u64>(name)?.to_le_bytes()),
            FieldType::I64 => out.extend_from_slice(&fields.get::<i64>(name)?.to_le_bytes()),
            FieldType::Bool => out.push(u8::from(fields.get::<bool>(name)?)),
            FieldType::Str { max_len } => {
                let s = fields.get::<String>(name)?;
                if s.len() > max_len {
                    return Err(DecodeError::StringTooLong { field: name, len: s.len(), max: max_len });
                }
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }

    out.resize(schema.max_len(), 0);
    Ok(out)
}
