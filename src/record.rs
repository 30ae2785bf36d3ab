//! Value records - one attribute value per row
//!
//! A `ValueRecord` carries exactly one populated `Slot`: a typed value
//! chosen by the structure's storage type, or a content hash for composite
//! and array base records, or nothing at all for an explicitly stored null.

use crate::value::{StorageType, Value};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single populated column of a value record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "lowercase")]
pub enum Slot {
    /// Stored null (store-null-on-absence)
    Empty,
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Bytes(Vec<u8>),
    /// Content hash of a composite value or a whole array
    Hash(String),
}

impl Slot {
    /// Convert a scalar business value into the slot for `target`.
    ///
    /// Integral values widen into `Long`, floating values into `Double`;
    /// a `String` target accepts any scalar through its text form.
    pub fn convert(field: &str, value: &Value, target: StorageType) -> Result<Slot> {
        let mismatch = || {
            Error::conversion(field, target, format!("unsupported {} value", value.type_name()))
        };

        let slot = match target {
            StorageType::String => Slot::String(match value {
                Value::String(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                Value::Float(f) => f.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::DateTime(d) => d.to_rfc3339(),
                Value::Guid(g) => g.hyphenated().to_string(),
                _ => return Err(mismatch()),
            }),
            StorageType::Long => Slot::Long(match value {
                Value::Int(i) => *i,
                Value::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                    // i64::MAX as f64 rounds up to 2^63, itself out of range
                    if *f < i64::MIN as f64 || *f >= i64::MAX as f64 {
                        return Err(Error::conversion(field, target, format!("{} is out of range", f)));
                    }
                    *f as i64
                }
                Value::Bool(b) => i64::from(*b),
                Value::String(s) => s
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| Error::conversion(field, target, e.to_string()))?,
                _ => return Err(mismatch()),
            }),
            StorageType::Double => {
                let v: f64 = match value {
                    Value::Float(f) => *f,
                    Value::Int(i) => *i as f64,
                    Value::String(s) => s
                        .trim()
                        .parse()
                        .map_err(|e: std::num::ParseFloatError| Error::conversion(field, target, e.to_string()))?,
                    _ => return Err(mismatch()),
                };
                // SQLite stores NaN as NULL
                if v.is_nan() {
                    return Err(Error::conversion(field, target, "NaN cannot be stored"));
                }
                // -0.0 reads back as 0.0
                Slot::Double(if v == 0.0 { 0.0 } else { v })
            }
            StorageType::Boolean => Slot::Boolean(match value {
                Value::Bool(b) => *b,
                Value::Int(i) => *i != 0,
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    other => {
                        return Err(Error::conversion(field, target, format!("'{}' is not a boolean", other)));
                    }
                },
                _ => return Err(mismatch()),
            }),
            StorageType::DateTime => Slot::DateTime(match value {
                Value::DateTime(d) => *d,
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|e| Error::conversion(field, target, e.to_string()))?
                    .with_timezone(&Utc),
                _ => return Err(mismatch()),
            }),
            StorageType::Guid => Slot::Guid(match value {
                Value::Guid(g) => *g,
                Value::String(s) => Uuid::parse_str(s.trim())
                    .map_err(|e| Error::conversion(field, target, e.to_string()))?,
                _ => return Err(mismatch()),
            }),
            StorageType::ByteArray => Slot::Bytes(match value {
                Value::Bytes(b) => b.clone(),
                Value::String(s) => s.as_bytes().to_vec(),
                _ => return Err(mismatch()),
            }),
            StorageType::Object | StorageType::Class => return Err(mismatch()),
        };
        Ok(slot)
    }

    /// Value-level equality used by the change-tracking diff.
    ///
    /// Doubles compare bitwise.
    pub fn same_as(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Empty, Slot::Empty) => true,
            (Slot::String(a), Slot::String(b)) => a == b,
            (Slot::Long(a), Slot::Long(b)) => a == b,
            (Slot::Double(a), Slot::Double(b)) => a.to_bits() == b.to_bits(),
            (Slot::Boolean(a), Slot::Boolean(b)) => a == b,
            (Slot::DateTime(a), Slot::DateTime(b)) => a == b,
            (Slot::Guid(a), Slot::Guid(b)) => a == b,
            (Slot::Bytes(a), Slot::Bytes(b)) => a == b,
            (Slot::Hash(a), Slot::Hash(b)) => a == b,
            _ => false,
        }
    }

    /// Business value for a scalar slot. Hash slots have no scalar value.
    pub fn to_value(&self) -> Value {
        match self {
            Slot::Empty | Slot::Hash(_) => Value::Null,
            Slot::String(s) => Value::String(s.clone()),
            Slot::Long(i) => Value::Int(*i),
            Slot::Double(f) => Value::Float(*f),
            Slot::Boolean(b) => Value::Bool(*b),
            Slot::DateTime(d) => Value::DateTime(*d),
            Slot::Guid(g) => Value::Guid(*g),
            Slot::Bytes(b) => Value::Bytes(b.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// Short display form
    pub fn describe(&self) -> String {
        match self {
            Slot::Empty => "null".to_string(),
            Slot::String(s) => format!("{:?}", s),
            Slot::Long(i) => i.to_string(),
            Slot::Double(f) => f.to_string(),
            Slot::Boolean(b) => b.to_string(),
            Slot::DateTime(d) => d.to_rfc3339(),
            Slot::Guid(g) => g.to_string(),
            Slot::Bytes(b) => format!("<{} bytes>", b.len()),
            Slot::Hash(h) => format!("#{}", &h[..h.len().min(12)]),
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// One attribute value row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub id: i64,
    pub object_id: i64,
    pub structure_id: i64,
    /// Anchor record: the array base for elements, the composite record for its children
    pub array_parent_id: Option<i64>,
    /// Zero-based position; set exactly on array elements
    pub array_index: Option<i64>,
    pub slot: Slot,
}

impl ValueRecord {
    pub fn new(
        id: i64,
        object_id: i64,
        structure_id: i64,
        array_parent_id: Option<i64>,
        array_index: Option<i64>,
        slot: Slot,
    ) -> Self {
        Self {
            id,
            object_id,
            structure_id,
            array_parent_id,
            array_index,
            slot,
        }
    }

    /// Is this record an array element
    pub fn is_element(&self) -> bool {
        self.array_index.is_some()
    }
}
