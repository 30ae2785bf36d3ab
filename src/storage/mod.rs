//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - schemes(id, name)
//! - structures(id, scheme_id, parent_id, name, storage_type, is_array, store_null)
//! - objects(id, parent_id, scheme_id, audit columns, business keys, hash)
//! - object_values(id, object_id, structure_id, array_parent_id, array_index, typed columns, hash)

pub mod schema;
pub mod sqlite;
pub mod commit;
pub mod catalog;

pub use sqlite::{SqliteStore, TxScope, DbStats};
pub use commit::{CommitSummary, ObjectWrite, RowOutcome};
pub use catalog::{StructureCache, StructureCatalog};
