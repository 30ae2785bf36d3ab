//! Business values - the dynamically typed content of an object
//!
//! A business object's properties are a `Fields` map of named `Value`s.
//! Values nest freely:
//! - `Class`: a plain nested record (stored as a composite subtree)
//! - `Array`: an ordered list of values
//! - `Object`: an embedded business object persisted as its own row
//! - `Ref`: a reference to an already-persisted object by id
//!
//! Field lookup goes through the `Fields` map by name, so the materializer
//! never needs runtime type inspection.

use crate::object::ObjectRef;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;
use uuid::Uuid;

/// Storage type of a structure node, selecting the typed slot a value lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    String,
    Long,
    Double,
    Boolean,
    DateTime,
    Guid,
    ByteArray,
    /// Reference to another business object
    Object,
    /// Composite nested record
    Class,
}

impl StorageType {
    /// Get the string representation of the storage type
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::String => "string",
            StorageType::Long => "long",
            StorageType::Double => "double",
            StorageType::Boolean => "boolean",
            StorageType::DateTime => "datetime",
            StorageType::Guid => "guid",
            StorageType::ByteArray => "bytearray",
            StorageType::Object => "object",
            StorageType::Class => "class",
        }
    }

    /// Get all storage types
    pub fn all() -> &'static [StorageType] {
        &[
            StorageType::String,
            StorageType::Long,
            StorageType::Double,
            StorageType::Boolean,
            StorageType::DateTime,
            StorageType::Guid,
            StorageType::ByteArray,
            StorageType::Object,
            StorageType::Class,
        ]
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(StorageType::String),
            "long" | "int" | "integer" | "i64" => Ok(StorageType::Long),
            "double" | "float" | "f64" | "decimal" => Ok(StorageType::Double),
            "boolean" | "bool" => Ok(StorageType::Boolean),
            "datetime" | "date" | "timestamp" => Ok(StorageType::DateTime),
            "guid" | "uuid" => Ok(StorageType::Guid),
            "bytearray" | "bytes" | "blob" => Ok(StorageType::ByteArray),
            "object" | "reference" | "ref" => Ok(StorageType::Object),
            "class" | "composite" | "record" => Ok(StorageType::Class),
            _ => Err(Error::Validation(format!("Unknown storage type: {}", s))),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single business value.
///
/// Integral inputs widen to `Int`, floating inputs to `Float` (see the
/// `From` impls below).
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Bytes(Vec<u8>),
    /// Nested plain record
    Class(Fields),
    Array(Vec<Value>),
    /// Embedded business object, persisted as its own object row
    Object(ObjectRef),
    /// Already-persisted object, by id
    Ref(i64),
}

impl Value {
    /// Build an array value from anything convertible to values
    pub fn array<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Fields> {
        match self {
            Value::Class(fields) => Some(fields),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Guid(_) => "guid",
            Value::Bytes(_) => "bytes",
            Value::Class(_) => "class",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Ref(_) => "ref",
        }
    }

    /// Id of the object this value references, if it is a reference.
    ///
    /// Returns `Some(0)` for an embedded object that has not been assigned an id yet.
    pub fn referenced_id(&self) -> Option<i64> {
        match self {
            Value::Object(object) => Some(object.borrow().record.id),
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Guid(a), Value::Guid(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! widen_integral {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

widen_integral!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
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

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Fields> for Value {
    fn from(v: Fields) -> Self {
        Value::Class(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}


/// Named fields of a business object or nested record.
///
/// Backed by a `BTreeMap` so iteration (and therefore hashing) is in a
/// stable order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    /// Create an empty field map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Set a field, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Look up a field by name. `None` means the field does not exist;
    /// `Some(Value::Null)` means it exists and is null.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.0.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Fields(iter.into_iter().collect())
    }
}
