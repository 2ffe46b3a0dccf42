//! Host-side value model for the kernel boundary.
//!
//! The IDL carries structural types (`any`, unions) that a statically typed
//! host cannot pin down, so values cross the boundary as a tagged variant:
//! a primitive, a date, an enum member, an object reference, a host object,
//! a by-value struct, an ordered sequence, or a string-keyed mapping.

use crate::registry::{HostObject, ObjRef};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value crossing the kernel boundary.
#[derive(Clone)]
pub enum Value {
    /// `null`, equivalent to an absent value.
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Instant in time; travels as a `$jsii.date` tagged string.
    Date(DateTime<Utc>),
    /// Enum member, identified as `<fqn>/<MEMBER>` on the wire.
    EnumValue { fqn: String, member: String },
    /// Reference to an object living in the kernel (or a tracked host object).
    Ref(ObjRef),
    /// Host-originated object not yet known to the kernel. Marshaling against
    /// an interface type registers it and sends a synthetic handle.
    Host(Arc<dyn HostObject>),
    /// By-value struct, copied at the boundary.
    Struct(StructValue),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

/// A by-value struct instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub fqn: String,
    pub fields: BTreeMap<String, Value>,
}

impl StructValue {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl Value {
    /// Numeric view of the value, if it is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object-reference view of the value, if it is one.
    pub fn as_ref_value(&self) -> Option<&ObjRef> {
        match self {
            Value::Ref(objref) => Some(objref),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Value::Number(v) => f.debug_tuple("Number").field(v).finish(),
            Value::String(v) => f.debug_tuple("String").field(v).finish(),
            Value::Date(v) => f.debug_tuple("Date").field(v).finish(),
            Value::EnumValue { fqn, member } => write!(f, "EnumValue({}/{})", fqn, member),
            Value::Ref(objref) => f.debug_tuple("Ref").field(objref).finish(),
            Value::Host(_) => f.write_str("Host(..)"),
            Value::Struct(v) => f.debug_tuple("Struct").field(v).finish(),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (
                Value::EnumValue { fqn: af, member: am },
                Value::EnumValue { fqn: bf, member: bm },
            ) => af == bf && am == bm,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ObjRef> for Value {
    fn from(v: ObjRef) -> Self {
        Value::Ref(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// An error raised by host code while serving a callback.
///
/// The optional `cause` mirrors one layer of wrapping around the original
/// failure; the dispatcher reports the innermost message to the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct HostError {
    pub message: String,
    pub cause: Option<String>,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    /// The message forwarded to the kernel: the cause when one is recorded,
    /// the top-level message otherwise.
    pub fn report(&self) -> &str {
        self.cause.as_deref().unwrap_or(&self.message)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.report())
    }
}

impl std::error::Error for HostError {}
