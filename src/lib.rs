//! # Eavstore - Generic attribute-value object store
//!
//! Persists arbitrary, nested, typed object graphs into a small fixed
//! relational schema instead of one table per business type.
//!
//! Eavstore provides:
//! - Object graph collection with identity assignment
//! - Structure-tree driven materialization into attribute-value records
//! - Two persistence strategies: delete-insert and change-tracking diff
//! - SQLite-backed storage with tracked and bulk commit paths
//! - Structure catalog with an explicit, injectable cache

pub mod value;
pub mod object;
pub mod structure;
pub mod record;
pub mod hash;
pub mod ident;
pub mod collector;
pub mod materializer;
pub mod strategy;
pub mod reader;
pub mod permission;
pub mod pipeline;
pub mod storage;
pub mod document;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use value::{Fields, StorageType, Value};
pub use object::{BusinessObject, ObjectRecord, ObjectRef};
pub use structure::{SchemaRegistry, SchemeRef, StructureKind, StructureNode, TypeDescriptor};
pub use record::{Slot, ValueRecord};
pub use strategy::PersistStrategy;
pub use pipeline::{NotFoundPolicy, PersistConfig, Persister, SaveReport};
pub use storage::{SqliteStore, StructureCache, StructureCatalog};

/// Result type alias for Eavstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Eavstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Authorization(String),

    #[error("Object not found: {0}")]
    NotFound(i64),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Schema error for '{scheme}': {reason}")]
    Schema { scheme: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Cycle detected: object of scheme '{0}' references one of its ancestors")]
    CycleDetected(String),

    #[error("Nesting exceeds the maximum depth of {0}")]
    NestingTooDeep(usize),

    #[error("Cannot store field '{field}' as {target}: {reason}")]
    Conversion {
        field: String,
        target: StorageType,
        reason: String,
    },

    #[error("Reference in field '{0}' points at an object without an id")]
    UnresolvedReference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a conversion failure on a named field
    pub(crate) fn conversion(field: &str, target: StorageType, reason: impl Into<String>) -> Self {
        Error::Conversion {
            field: field.to_string(),
            target,
            reason: reason.into(),
        }
    }
}
