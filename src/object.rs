//! Object records - one persisted entity per business object
//!
//! An `ObjectRecord` is the fixed-column part of an object (identity,
//! hierarchy, audit fields, business keys). The dynamic part lives in the
//! object's `Fields` and is stored as attribute-value records.

use crate::value::Fields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use uuid::Uuid;

/// Shared, mutable handle to a business object inside one object graph.
///
/// Identity is the allocation: two handles are the same object exactly when
/// `Rc::ptr_eq` holds.
pub type ObjectRef = Rc<RefCell<BusinessObject>>;

/// Fixed columns of a persisted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Unique id; 0 until assigned
    pub id: i64,
    /// Owning object, for hierarchical organization
    pub parent_id: Option<i64>,
    pub scheme_id: i64,
    pub owner_id: Option<i64>,
    pub modifier_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub code_int: Option<i64>,
    pub code_string: Option<String>,
    pub code_guid: Option<Uuid>,
    pub flag: bool,
    pub note: Option<String>,
    /// Content hash over business keys and properties
    pub hash: Option<String>,
}

impl ObjectRecord {
    /// A fresh, unsaved record
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            parent_id: None,
            scheme_id: 0,
            owner_id: None,
            modifier_id: None,
            created_at: now,
            modified_at: now,
            valid_from: None,
            valid_to: None,
            code_int: None,
            code_string: None,
            code_guid: None,
            flag: false,
            note: None,
            hash: None,
        }
    }

    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    /// True when both rows carry the same stored content, ignoring the
    /// modification audit columns.
    pub fn same_content(&self, other: &ObjectRecord) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.scheme_id == other.scheme_id
            && self.owner_id == other.owner_id
            && self.valid_from == other.valid_from
            && self.valid_to == other.valid_to
            && self.code_int == other.code_int
            && self.code_string == other.code_string
            && self.code_guid == other.code_guid
            && self.flag == other.flag
            && self.note == other.note
            && self.hash == other.hash
    }
}

impl Default for ObjectRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A business object: its record, the name of its type, and its properties.
#[derive(Debug, Clone)]
pub struct BusinessObject {
    pub record: ObjectRecord,
    /// Name of the type (scheme) this object belongs to
    pub scheme: String,
    /// Properties bag; `None` is rejected by the collector
    pub properties: Option<Fields>,
}

impl BusinessObject {
    /// Create a new, unsaved business object
    pub fn new(scheme: impl Into<String>, properties: Fields) -> Self {
        Self {
            record: ObjectRecord::new(),
            scheme: scheme.into(),
            properties: Some(properties),
        }
    }

    /// Set the id (for saving an object that already exists)
    pub fn with_id(mut self, id: i64) -> Self {
        self.record.id = id;
        self
    }

    /// Set the parent object id
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.record.parent_id = Some(parent_id);
        self
    }

    /// Set the free-text note
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.record.note = Some(note.into());
        self
    }

    /// Set the string business code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.record.code_string = Some(code.into());
        self
    }

    /// Wrap into a shared handle
    pub fn into_ref(self) -> ObjectRef {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }
}
