//! JSON documents for business objects
//!
//! ```json
//! {
//!   "scheme": "Person",
//!   "id": 0,
//!   "properties": {
//!     "Name": "A",
//!     "Friend": {"$object": {"scheme": "Person", "properties": {"Name": "B"}}},
//!     "Employer": {"$ref": 42}
//!   }
//! }
//! ```
//!
//! Any other JSON object is a nested record.

use std::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number};
use crate::{Error, Result};
use crate::object::{BusinessObject, ObjectRef};
use crate::value::{Fields, Value};

const OBJECT_KEY: &str = "$object";
const REF_KEY: &str = "$ref";

/// Serialized form of one business object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub scheme: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub properties: Option<Map<String, serde_json::Value>>,
}

impl Document {
    /// Build the business object graph this document describes
    pub fn into_object(self) -> Result<ObjectRef> {
        let mut object = BusinessObject::new(self.scheme, Fields::new());
        object.record.id = self.id;
        object.record.parent_id = self.parent_id;
        object.record.code_string = self.code;
        object.record.note = self.note;
        object.properties = match self.properties {
            Some(map) => Some(fields_from_json(&map)?),
            None => None,
        };
        Ok(object.into_ref())
    }

    /// Snapshot a business object, embedded objects included
    pub fn from_object(object: &BusinessObject) -> Self {
        Self {
            scheme: object.scheme.clone(),
            id: object.record.id,
            parent_id: object.record.parent_id,
            code: object.record.code_string.clone(),
            note: object.record.note.clone(),
            properties: object.properties.as_ref().map(fields_to_json),
        }
    }
}

/// Read one document or an array of documents from a file
pub fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let contents = std::fs::read_to_string(path)?;
    parse_documents(&contents)
}

pub fn parse_documents(contents: &str) -> Result<Vec<Document>> {
    let raw: serde_json::Value = serde_json::from_str(contents)?;
    match raw {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

pub fn fields_from_json(map: &Map<String, serde_json::Value>) -> Result<Fields> {
    let mut fields = Fields::new();
    for (name, raw) in map {
        fields.insert(name.clone(), value_from_json(raw)?);
    }
    Ok(fields)
}

pub fn value_from_json(raw: &serde_json::Value) -> Result<Value> {
    Ok(match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => number(n)?,
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(value_from_json).collect::<Result<Vec<_>>>()?)
        }
        serde_json::Value::Object(map) => {
            if let Some(inner) = map.get(OBJECT_KEY) {
                let document: Document = serde_json::from_value(inner.clone())?;
                Value::Object(document.into_object()?)
            } else if let Some(target) = map.get(REF_KEY) {
                let id = target
                    .as_i64()
                    .ok_or_else(|| Error::Validation(format!("{} must be an integer id, got {}", REF_KEY, target)))?;
                Value::Ref(id)
            } else {
                Value::Class(fields_from_json(map)?)
            }
        }
    })
}

fn number(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Int(i));
    }
    n.as_f64()
        .map(Value::Float)
        .ok_or_else(|| Error::Validation(format!("number {} is out of range", n)))
}

pub fn fields_to_json(fields: &Fields) -> Map<String, serde_json::Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value_to_json(value)))
        .collect()
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::DateTime(d) => json!(d.to_rfc3339()),
        Value::Guid(g) => json!(g.to_string()),
        Value::Bytes(b) => json!(b),
        Value::Class(fields) => serde_json::Value::Object(fields_to_json(fields)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Object(object) => json!({ OBJECT_KEY: Document::from_object(&object.borrow()) }),
        Value::Ref(id) => json!({ REF_KEY: id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSON: &str = r#"{
        "scheme": "Person",
        "properties": {
            "Name": "A",
            "Age": 31,
            "Score": 1.5,
            "Tags": ["x", null],
            "Address": {"City": "Oslo"},
            "Friend": {"$object": {"scheme": "Person", "id": 7, "properties": {"Name": "B"}}},
            "Employer": {"$ref": 42}
        }
    }"#;

    #[test]
    fn test_parse_nested_document() {
        let documents = parse_documents(PERSON).unwrap();
        assert_eq!(documents.len(), 1);
        let object = documents.into_iter().next().unwrap().into_object().unwrap();
        let object = object.borrow();
        assert!(object.record.is_new());

        let fields = object.properties.as_ref().unwrap();
        assert_eq!(fields.get("Age"), Some(&Value::Int(31)));
        assert_eq!(fields.get("Score"), Some(&Value::Float(1.5)));
        assert_eq!(fields.get("Tags"), Some(&Value::Array(vec![Value::from("x"), Value::Null])));
        assert!(matches!(fields.get("Address"), Some(Value::Class(_))));
        assert_eq!(fields.get("Employer"), Some(&Value::Ref(42)));
        match fields.get("Friend") {
            Some(Value::Object(friend)) => assert_eq!(friend.borrow().id(), 7),
            other => panic!("expected embedded object, got {:?}", other),
        }
    }

    #[test]
    fn test_document_array_and_back() {
        let text = format!("[{}, {}]", PERSON, PERSON);
        let documents = parse_documents(&text).unwrap();
        assert_eq!(documents.len(), 2);

        let object = documents[0].clone().into_object().unwrap();
        let again = Document::from_object(&object.borrow());
        assert_eq!(again, documents[0]);
    }

    #[test]
    fn test_missing_properties_kept_as_none() {
        let documents = parse_documents(r#"{"scheme": "Person"}"#).unwrap();
        let object = documents.into_iter().next().unwrap().into_object().unwrap();
        assert!(object.borrow().properties.is_none());
    }

    #[test]
    fn test_bad_ref_is_rejected() {
        let err = value_from_json(&json!({"$ref": "seven"})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
