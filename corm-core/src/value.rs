use crate::{AnyResult, Error};
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// A dynamically typed column/parameter value.
///
/// Every variant carries an `Option` so the *type* of a NULL is preserved
/// (a NULL `Int64` and a NULL `Text` are different things to a provider's
/// column converter), mirroring how the workspace's reference data layer
/// keeps typed `NULL`s instead of collapsing to a single untyped `Null`.
/// `Value::Null` itself exists only for expressions with no declared type
/// (e.g. a literal `NULL` in a predicate).
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(Option<bool>),
    Int64(Option<i64>),
    Float64(Option<f64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    #[cfg(feature = "uuid")]
    Uuid(Option<uuid::Uuid>),
    #[cfg(feature = "decimal")]
    Decimal(Option<rust_decimal::Decimal>),
    #[cfg(feature = "time")]
    Timestamp(Option<time::PrimitiveDateTime>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Boolean(v) => v.is_none(),
            Value::Int64(v) => v.is_none(),
            Value::Float64(v) => v.is_none(),
            Value::Text(v) => v.is_none(),
            Value::Bytes(v) => v.is_none(),
            #[cfg(feature = "uuid")]
            Value::Uuid(v) => v.is_none(),
            #[cfg(feature = "decimal")]
            Value::Decimal(v) => v.is_none(),
            #[cfg(feature = "time")]
            Value::Timestamp(v) => v.is_none(),
        }
    }

    /// True when `self` and `other` carry the same variant, ignoring payload.
    /// Used by the schema registry to check that a discriminator column or a
    /// reverse-attribute pair agree on type.
    pub fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// The empty (NULL) value of the same variant as `self`.
    pub fn as_null_of_same_type(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Boolean(_) => Value::Boolean(None),
            Value::Int64(_) => Value::Int64(None),
            Value::Float64(_) => Value::Float64(None),
            Value::Text(_) => Value::Text(None),
            Value::Bytes(_) => Value::Bytes(None),
            #[cfg(feature = "uuid")]
            Value::Uuid(_) => Value::Uuid(None),
            #[cfg(feature = "decimal")]
            Value::Decimal(_) => Value::Decimal(None),
            #[cfg(feature = "time")]
            Value::Timestamp(_) => Value::Timestamp(None),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write_opt(f, v),
            Value::Int64(v) => write_opt(f, v),
            Value::Float64(v) => write_opt(f, v),
            Value::Text(v) => write_opt(f, v),
            Value::Bytes(v) => write_opt(f, &v.as_ref().map(|v| v.len())),
            #[cfg(feature = "uuid")]
            Value::Uuid(v) => write_opt(f, v),
            #[cfg(feature = "decimal")]
            Value::Decimal(v) => write_opt(f, v),
            #[cfg(feature = "time")]
            Value::Timestamp(v) => write_opt(f, v),
        }
    }
}

fn write_opt<T: Display>(f: &mut fmt::Formatter<'_>, v: &Option<T>) -> fmt::Result {
    match v {
        Some(v) => write!(f, "{v}"),
        None => write!(f, "NULL"),
    }
}

/// `Value` is used as an identity-map index key (unique-key lookups hash a
/// tuple of attribute values), so it needs `Eq`/`Hash` despite carrying an
/// `f64` variant. `Float64` is hashed and compared bit-for-bit rather than
/// by IEEE 754 equality, the usual trick for putting floats in a key type;
/// it means `NaN == NaN` here, which never matters for a unique key in
/// practice.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.map(f64::to_bits) == b.map(f64::to_bits),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            #[cfg(feature = "uuid")]
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            #[cfg(feature = "decimal")]
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            #[cfg(feature = "time")]
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.map(f64::to_bits).hash(state),
            Value::Text(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            #[cfg(feature = "uuid")]
            Value::Uuid(v) => v.hash(state),
            #[cfg(feature = "decimal")]
            Value::Decimal(v) => v.hash(state),
            #[cfg(feature = "time")]
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

/// Converts between a native Rust type and the dynamic [`Value`] representation.
///
/// Implemented for every scalar type that can back a `Required`/`Optional`
/// attribute. Reference (to-one) and collection (to-many) attributes do not
/// implement `AsValue`: their storage is the identity map, not a `Value`.
pub trait AsValue: Sized {
    /// A `Value` of this type's variant carrying `None`.
    fn empty_value() -> Value;
    fn into_value(self) -> Value;
    fn try_from_value(value: Value) -> AnyResult<Self>;
}

macro_rules! impl_as_value {
    ($ty:ty, $variant:ident) => {
        impl AsValue for $ty {
            fn empty_value() -> Value {
                Value::$variant(None)
            }
            fn into_value(self) -> Value {
                Value::$variant(Some(self))
            }
            fn try_from_value(value: Value) -> AnyResult<Self> {
                match value {
                    Value::$variant(Some(v)) => Ok(v),
                    Value::$variant(None) | Value::Null => Err(Error::msg(format!(
                        "Cannot convert NULL into non-optional {}",
                        stringify!($ty)
                    ))),
                    other => Err(Error::msg(format!(
                        "Cannot convert {other:?} into {}",
                        stringify!($ty)
                    ))),
                }
            }
        }

        impl AsValue for Option<$ty> {
            fn empty_value() -> Value {
                Value::$variant(None)
            }
            fn into_value(self) -> Value {
                match self {
                    Some(v) => Value::$variant(Some(v)),
                    None => Value::$variant(None),
                }
            }
            fn try_from_value(value: Value) -> AnyResult<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    Value::Null => Ok(None),
                    other => Err(Error::msg(format!(
                        "Cannot convert {other:?} into Option<{}>",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

impl_as_value!(bool, Boolean);
impl_as_value!(i64, Int64);
impl_as_value!(f64, Float64);
impl_as_value!(String, Text);
impl_as_value!(Vec<u8>, Bytes);
#[cfg(feature = "uuid")]
impl_as_value!(uuid::Uuid, Uuid);
#[cfg(feature = "decimal")]
impl_as_value!(rust_decimal::Decimal, Decimal);
#[cfg(feature = "time")]
impl_as_value!(time::PrimitiveDateTime, Timestamp);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(Some(v))
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(Some(v))
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(Some(v as i64))
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(Some(v))
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(Some(v))
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(Some(v.to_string()))
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Some(v))
    }
}

impl AsValue for i32 {
    fn empty_value() -> Value {
        Value::Int64(None)
    }
    fn into_value(self) -> Value {
        Value::Int64(Some(self as i64))
    }
    fn try_from_value(value: Value) -> AnyResult<Self> {
        i64::try_from_value(value).and_then(|v| {
            i32::try_from(v).map_err(|_| Error::msg(format!("Value {v} out of range for i32")))
        })
    }
}
