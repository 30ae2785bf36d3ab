//! Content hashing for objects and nested values
//!
//! Composite and array values are stored as a single hash on their anchor
//! record, so change detection never needs a deep field comparison.
//! Structurally equal values must hash equal:
//! - fields are visited in name order
//! - null fields are skipped (a null field and a missing field are the same content)
//! - object references hash by target id, whether embedded or by `Ref`

use crate::object::BusinessObject;
use crate::value::{Fields, Value};

/// Stable content hash provider.
pub trait ContentHasher {
    /// Hash an arbitrary nested value
    fn hash_value(&self, value: &Value) -> String;

    /// Hash a whole object: business keys plus properties
    fn hash_object(&self, object: &BusinessObject) -> String;
}

/// Blake3 content hasher over a tagged, length-prefixed encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl Blake3Hasher {
    pub fn new() -> Self {
        Self
    }
}

impl ContentHasher for Blake3Hasher {
    fn hash_value(&self, value: &Value) -> String {
        let mut hasher = blake3::Hasher::new();
        feed_value(&mut hasher, value);
        hasher.finalize().to_hex().to_string()
    }

    fn hash_object(&self, object: &BusinessObject) -> String {
        let mut hasher = blake3::Hasher::new();
        let record = &object.record;
        feed_str(&mut hasher, &object.scheme);
        feed_opt_i64(&mut hasher, record.code_int);
        match &record.code_string {
            Some(code) => {
                hasher.update(&[1]);
                feed_str(&mut hasher, code);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        match record.code_guid {
            Some(guid) => {
                hasher.update(&[1]);
                hasher.update(guid.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(&[u8::from(record.flag)]);
        match &record.note {
            Some(note) => {
                hasher.update(&[1]);
                feed_str(&mut hasher, note);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        if let Some(fields) = &object.properties {
            feed_fields(&mut hasher, fields);
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn feed_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn feed_opt_i64(hasher: &mut blake3::Hasher, v: Option<i64>) {
    match v {
        Some(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

fn feed_fields(hasher: &mut blake3::Hasher, fields: &Fields) {
    let present: Vec<_> = fields.iter().filter(|(_, v)| !v.is_null()).collect();
    hasher.update(b"C");
    hasher.update(&(present.len() as u64).to_le_bytes());
    for (name, value) in present {
        feed_str(hasher, name);
        feed_value(hasher, value);
    }
}

fn feed_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"N");
        }
        Value::Bool(b) => {
            hasher.update(b"B");
            hasher.update(&[u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(b"I");
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update(b"F");
            hasher.update(&f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(b"S");
            feed_str(hasher, s);
        }
        Value::DateTime(d) => {
            hasher.update(b"D");
            hasher.update(&d.timestamp().to_le_bytes());
            hasher.update(&d.timestamp_subsec_nanos().to_le_bytes());
        }
        Value::Guid(g) => {
            hasher.update(b"G");
            hasher.update(g.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update(b"Y");
            hasher.update(&(b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
        Value::Class(fields) => feed_fields(hasher, fields),
        Value::Array(items) => {
            hasher.update(b"A");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        Value::Object(_) | Value::Ref(_) => {
            hasher.update(b"R");
            hasher.update(&value.referenced_id().unwrap_or(0).to_le_bytes());
        }
    }
}
