//! Structures - per-scheme field definitions
//!
//! Every scheme owns a forest of `StructureNode`s. Root nodes have no
//! parent; a composite (`Class`) node owns a subtree describing the nested
//! record's fields. The materializer walks this forest in lock-step with a
//! business object's `Fields`.
//!
//! Structures are derived from `TypeDescriptor`s registered in a
//! `SchemaRegistry`, which stands in for reflecting over a business type.

use crate::value::StorageType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A scheme: the type definition objects are stored against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemeRef {
    pub id: i64,
    pub name: String,
}

/// One field definition within a scheme's structure tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureNode {
    pub id: i64,
    pub scheme_id: i64,
    /// `None` for root fields
    pub parent_id: Option<i64>,
    pub name: String,
    pub storage_type: StorageType,
    pub is_array: bool,
    /// Store an empty record when the value is null
    pub store_null: bool,
}

/// What an array element holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Scalar,
    Composite,
    Reference,
}

impl ElementKind {
    fn of(storage_type: StorageType) -> Self {
        match storage_type {
            StorageType::Class => ElementKind::Composite,
            StorageType::Object => ElementKind::Reference,
            _ => ElementKind::Scalar,
        }
    }
}

/// How a structure node is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    /// Single typed value
    Scalar,
    /// Base record carrying the array hash, plus one record per element
    Array(ElementKind),
    /// Record carrying the nested value's hash, plus the child subtree
    Composite,
    /// Record carrying the referenced object's id
    Reference,
}

impl StructureNode {
    /// Classify this node for materialization
    pub fn kind(&self) -> StructureKind {
        if self.is_array {
            return StructureKind::Array(ElementKind::of(self.storage_type));
        }
        match ElementKind::of(self.storage_type) {
            ElementKind::Composite => StructureKind::Composite,
            ElementKind::Reference => StructureKind::Reference,
            ElementKind::Scalar => StructureKind::Scalar,
        }
    }

    /// Whether this node owns child structures
    pub fn has_children(&self) -> bool {
        self.storage_type == StorageType::Class
    }
}

/// Declarative description of one field of a business type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub store_null: bool,
    /// Nested fields, for `class` fields only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDescriptor>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            storage_type,
            array: false,
            store_null: false,
            fields: Vec::new(),
        }
    }

    /// Mark as an array field
    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// Store an empty record when the value is null
    pub fn store_null(mut self) -> Self {
        self.store_null = true;
        self
    }

    /// Composite field with nested fields
    pub fn class(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            ..Self::new(name, StorageType::Class)
        }
    }
}

/// Declarative description of a business type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Check that composite fields have children and scalars do not
    pub fn validate(&self) -> Result<()> {
        fn check(scheme: &str, fields: &[FieldDescriptor]) -> Result<()> {
            for field in fields {
                if field.name.is_empty() {
                    return Err(Error::Schema {
                        scheme: scheme.to_string(),
                        reason: "field with empty name".to_string(),
                    });
                }
                if field.storage_type != StorageType::Class && !field.fields.is_empty() {
                    return Err(Error::Schema {
                        scheme: scheme.to_string(),
                        reason: format!("field '{}' of type {} cannot have nested fields", field.name, field.storage_type),
                    });
                }
                check(scheme, &field.fields)?;
            }
            Ok(())
        }
        check(&self.name, &self.fields)
    }
}

/// Registry of known business types, keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a type
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<()> {
        descriptor.validate()?;
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    /// Load descriptors from a JSON file holding an array of types
    pub fn load_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let descriptors: Vec<TypeDescriptor> = serde_json::from_str(&contents)?;
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }
}

/// Source of structure trees for the persistence pipeline.
pub trait StructureProvider {
    /// Find or create the scheme for a type name
    fn ensure_scheme(&self, name: &str) -> Result<SchemeRef>;

    /// Ordered child definitions; `parent = None` returns the root fields
    fn children(&self, scheme_id: i64, parent: Option<i64>) -> Result<Vec<StructureNode>>;

    /// Derive structures for a scheme from its registered type, returning the roots
    fn sync_structures(&self, scheme: &SchemeRef) -> Result<Vec<StructureNode>>;

    /// Look up a single node by id
    fn node(&self, scheme_id: i64, id: i64) -> Result<Option<StructureNode>>;
}
