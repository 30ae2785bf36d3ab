//! SQLite storage implementation

use std::path::Path;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;
use crate::{Error, Result};
use crate::object::ObjectRecord;
use crate::record::{Slot, ValueRecord};
use crate::structure::{SchemeRef, StructureNode};
use crate::value::StorageType;
use super::schema;

/// Largest number of ids bound into one `IN (...)` list
const ID_CHUNK: usize = 500;

const OBJECT_COLUMNS: &str = "id, parent_id, scheme_id, owner_id, modifier_id, created_at, modified_at, \
     valid_from, valid_to, code_int, code_string, code_guid, flag, note, hash";

const VALUE_COLUMNS: &str = "id, object_id, structure_id, array_parent_id, array_index, value_string, \
     value_long, value_double, value_bool, value_datetime, value_guid, value_bytes, hash";

const STRUCTURE_COLUMNS: &str = "id, scheme_id, parent_id, name, storage_type, is_array, store_null";

/// SQLite-backed storage for objects, values and structures
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        self.conn.pragma_update(None, "foreign_keys", true)?;
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        Ok(())
    }

    /// How long a writer waits on a locked database before failing
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    // ========== Transactions ==========

    /// Begin a transaction for bulk operations
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        Ok(())
    }

    /// Commit a transaction
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Rollback a transaction
    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Whether a transaction is currently open on this connection
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Join the open transaction, or open one that this scope owns
    pub fn scope(&self) -> Result<TxScope<'_>> {
        let owned = !self.in_transaction();
        if owned {
            self.begin_transaction()?;
        }
        Ok(TxScope {
            store: self,
            owned,
            finished: false,
        })
    }

    // ========== Scheme Operations ==========

    /// Find a scheme by name
    pub fn find_scheme(&self, name: &str) -> Result<Option<SchemeRef>> {
        self.conn
            .query_row("SELECT id, name FROM schemes WHERE name = ?1", [name], |row| {
                Ok(SchemeRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .optional()
            .map_err(Into::into)
    }

    /// Insert a scheme
    pub fn insert_scheme(&self, name: &str) -> Result<SchemeRef> {
        self.conn.execute("INSERT INTO schemes (name) VALUES (?1)", [name])?;
        Ok(SchemeRef {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Get a scheme by id
    pub fn get_scheme(&self, id: i64) -> Result<Option<SchemeRef>> {
        self.conn
            .query_row("SELECT id, name FROM schemes WHERE id = ?1", [id], |row| {
                Ok(SchemeRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .optional()
            .map_err(Into::into)
    }

    /// List all schemes
    pub fn list_schemes(&self) -> Result<Vec<SchemeRef>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM schemes ORDER BY id")?;
        let schemes = stmt
            .query_map([], |row| {
                Ok(SchemeRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schemes)
    }

    // ========== Structure Operations ==========

    /// Ordered child structures of `parent` (root fields when `None`)
    pub fn structure_children(&self, scheme_id: i64, parent: Option<i64>) -> Result<Vec<StructureNode>> {
        let sql = format!(
            "SELECT {} FROM structures WHERE scheme_id = ?1 AND parent_id IS ?2 ORDER BY position, id",
            STRUCTURE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let nodes = stmt
            .query_map(params![scheme_id, parent], |row| self.row_to_structure(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Get a structure by id
    pub fn get_structure(&self, id: i64) -> Result<Option<StructureNode>> {
        let sql = format!("SELECT {} FROM structures WHERE id = ?1", STRUCTURE_COLUMNS);
        self.conn
            .query_row(&sql, [id], |row| self.row_to_structure(row))
            .optional()
            .map_err(Into::into)
    }

    /// Find a structure by name below `parent`
    pub fn find_structure(&self, scheme_id: i64, parent: Option<i64>, name: &str) -> Result<Option<StructureNode>> {
        let sql = format!(
            "SELECT {} FROM structures WHERE scheme_id = ?1 AND parent_id IS ?2 AND name = ?3",
            STRUCTURE_COLUMNS
        );
        self.conn
            .query_row(&sql, params![scheme_id, parent, name], |row| self.row_to_structure(row))
            .optional()
            .map_err(Into::into)
    }

    /// Insert a structure, returning its id
    pub fn insert_structure(&self, node: &StructureNode, position: i64) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO structures (scheme_id, parent_id, name, storage_type, is_array, store_null, position)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                node.scheme_id,
                node.parent_id,
                node.name,
                node.storage_type.as_str(),
                node.is_array,
                node.store_null,
                position,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update the definition of an existing structure
    pub fn update_structure(&self, node: &StructureNode, position: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE structures SET storage_type = ?2, is_array = ?3, store_null = ?4, position = ?5 WHERE id = ?1",
            params![node.id, node.storage_type.as_str(), node.is_array, node.store_null, position],
        )?;
        Ok(())
    }

    /// Count structures of a scheme
    pub fn count_structures(&self, scheme_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM structures WHERE scheme_id = ?1",
            [scheme_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Helper to convert a row to a StructureNode
    fn row_to_structure(&self, row: &rusqlite::Row) -> rusqlite::Result<StructureNode> {
        let type_str: String = row.get(4)?;
        let storage_type: StorageType = type_str.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(StructureNode {
            id: row.get(0)?,
            scheme_id: row.get(1)?,
            parent_id: row.get(2)?,
            name: row.get(3)?,
            storage_type,
            is_array: row.get(5)?,
            store_null: row.get(6)?,
        })
    }

    // ========== Object Operations ==========

    /// Insert an object row
    pub fn insert_object(&self, record: &ObjectRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO objects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            OBJECT_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params![
            record.id,
            record.parent_id,
            record.scheme_id,
            record.owner_id,
            record.modifier_id,
            record.created_at,
            record.modified_at,
            record.valid_from,
            record.valid_to,
            record.code_int,
            record.code_string,
            record.code_guid,
            record.flag,
            record.note,
            record.hash,
        ])?;
        Ok(())
    }

    /// Update an object row
    pub fn update_object(&self, record: &ObjectRecord) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            UPDATE objects SET parent_id = ?2, scheme_id = ?3, owner_id = ?4, modifier_id = ?5,
                created_at = ?6, modified_at = ?7, valid_from = ?8, valid_to = ?9, code_int = ?10,
                code_string = ?11, code_guid = ?12, flag = ?13, note = ?14, hash = ?15
            WHERE id = ?1
            "#,
        )?;
        let changed = stmt.execute(params![
            record.id,
            record.parent_id,
            record.scheme_id,
            record.owner_id,
            record.modifier_id,
            record.created_at,
            record.modified_at,
            record.valid_from,
            record.valid_to,
            record.code_int,
            record.code_string,
            record.code_guid,
            record.flag,
            record.note,
            record.hash,
        ])?;
        if changed == 0 {
            return Err(Error::NotFound(record.id));
        }
        Ok(())
    }

    /// Get an object row by id
    pub fn get_object(&self, id: i64) -> Result<Option<ObjectRecord>> {
        let sql = format!("SELECT {} FROM objects WHERE id = ?1", OBJECT_COLUMNS);
        self.conn
            .query_row(&sql, [id], |row| self.row_to_object(row))
            .optional()
            .map_err(Into::into)
    }

    /// Check whether an object row exists
    pub fn object_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM objects WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Child objects of a parent
    pub fn find_children(&self, parent_id: i64) -> Result<Vec<ObjectRecord>> {
        let sql = format!("SELECT {} FROM objects WHERE parent_id = ?1 ORDER BY id", OBJECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let objects = stmt
            .query_map([parent_id], |row| self.row_to_object(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(objects)
    }

    /// Count all objects
    pub fn count_objects(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Helper to convert a row to an ObjectRecord
    fn row_to_object(&self, row: &rusqlite::Row) -> rusqlite::Result<ObjectRecord> {
        Ok(ObjectRecord {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            scheme_id: row.get(2)?,
            owner_id: row.get(3)?,
            modifier_id: row.get(4)?,
            created_at: row.get(5)?,
            modified_at: row.get(6)?,
            valid_from: row.get(7)?,
            valid_to: row.get(8)?,
            code_int: row.get(9)?,
            code_string: row.get(10)?,
            code_guid: row.get(11)?,
            flag: row.get(12)?,
            note: row.get(13)?,
            hash: row.get(14)?,
        })
    }

    // ========== Value Operations ==========

    /// Insert a value row
    pub fn insert_value(&self, record: &ValueRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO object_values ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            VALUE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let c = SlotColumns::from(&record.slot);
        stmt.execute(params![
            record.id,
            record.object_id,
            record.structure_id,
            record.array_parent_id,
            record.array_index,
            c.string,
            c.long,
            c.double,
            c.boolean,
            c.datetime,
            c.guid,
            c.bytes,
            c.hash,
        ])?;
        Ok(())
    }

    /// Patch the slot of an existing value row in place
    pub fn update_value(&self, record: &ValueRecord) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            UPDATE object_values SET value_string = ?2, value_long = ?3, value_double = ?4,
                value_bool = ?5, value_datetime = ?6, value_guid = ?7, value_bytes = ?8, hash = ?9
            WHERE id = ?1
            "#,
        )?;
        let c = SlotColumns::from(&record.slot);
        stmt.execute(params![
            record.id, c.string, c.long, c.double, c.boolean, c.datetime, c.guid, c.bytes, c.hash,
        ])?;
        Ok(())
    }

    /// Delete a value row by id
    pub fn delete_value(&self, id: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM object_values WHERE id = ?1")?;
        stmt.execute([id])?;
        Ok(())
    }

    /// Delete every value row of an object
    pub fn delete_values_for_object(&self, object_id: i64) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM object_values WHERE object_id = ?1")?;
        Ok(stmt.execute([object_id])?)
    }

    /// Load all value rows of the given objects, in id order
    pub fn load_values(&self, object_ids: &[i64]) -> Result<Vec<ValueRecord>> {
        let mut values = Vec::new();
        for chunk in object_ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM object_values WHERE object_id IN ({}) ORDER BY id",
                VALUE_COLUMNS, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| self.row_to_value(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            values.extend(rows);
        }
        values.sort_by_key(|v| v.id);
        Ok(values)
    }

    /// Count all value rows
    pub fn count_values(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM object_values", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Helper to convert a row to a ValueRecord
    fn row_to_value(&self, row: &rusqlite::Row) -> rusqlite::Result<ValueRecord> {
        let slot = if let Some(hash) = row.get::<_, Option<String>>(12)? {
            Slot::Hash(hash)
        } else if let Some(s) = row.get::<_, Option<String>>(5)? {
            Slot::String(s)
        } else if let Some(v) = row.get::<_, Option<i64>>(6)? {
            Slot::Long(v)
        } else if let Some(v) = row.get::<_, Option<f64>>(7)? {
            Slot::Double(v)
        } else if let Some(v) = row.get::<_, Option<bool>>(8)? {
            Slot::Boolean(v)
        } else if let Some(v) = row.get::<_, Option<DateTime<Utc>>>(9)? {
            Slot::DateTime(v)
        } else if let Some(v) = row.get::<_, Option<Uuid>>(10)? {
            Slot::Guid(v)
        } else if let Some(v) = row.get::<_, Option<Vec<u8>>>(11)? {
            Slot::Bytes(v)
        } else {
            Slot::Empty
        };

        Ok(ValueRecord {
            id: row.get(0)?,
            object_id: row.get(1)?,
            structure_id: row.get(2)?,
            array_parent_id: row.get(3)?,
            array_index: row.get(4)?,
            slot,
        })
    }

    // ========== Maintenance ==========

    /// Highest object or value id in use (seed for the id sequence)
    pub fn max_assigned_id(&self) -> Result<i64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(m) FROM (SELECT MAX(id) AS m FROM objects UNION ALL SELECT MAX(id) FROM object_values)",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Delete all objects and values (structures are kept)
    pub fn clear_objects(&self) -> Result<()> {
        self.conn.execute("DELETE FROM object_values", [])?;
        self.conn.execute("DELETE FROM objects", [])?;
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let schemes: i64 = self.conn.query_row("SELECT COUNT(*) FROM schemes", [], |row| row.get(0))?;
        let structures: i64 = self.conn.query_row("SELECT COUNT(*) FROM structures", [], |row| row.get(0))?;
        Ok(DbStats {
            schemes: schemes as usize,
            structures: structures as usize,
            objects: self.count_objects()?,
            values: self.count_values()?,
        })
    }
}

/// A transaction boundary that joins an already-open transaction.
///
/// Only the scope that opened the transaction commits it; dropping an
/// owning scope without committing rolls back.
pub struct TxScope<'a> {
    store: &'a SqliteStore,
    owned: bool,
    finished: bool,
}

impl TxScope<'_> {
    /// Whether this scope opened the transaction
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// Commit if this scope owns the transaction.
    ///
    /// A failed COMMIT (a deferred foreign key violation) leaves the scope
    /// unfinished, so dropping it rolls back.
    pub fn commit(mut self) -> Result<()> {
        if self.owned {
            self.store.commit()?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.owned && !self.finished {
            if let Err(e) = self.store.rollback() {
                tracing::warn!("rollback failed: {}", e);
            }
        }
    }
}

/// Column values for one slot; exactly one is `Some` unless the slot is empty
struct SlotColumns<'s> {
    string: Option<&'s str>,
    long: Option<i64>,
    double: Option<f64>,
    boolean: Option<bool>,
    datetime: Option<DateTime<Utc>>,
    guid: Option<Uuid>,
    bytes: Option<&'s [u8]>,
    hash: Option<&'s str>,
}

impl<'s> From<&'s Slot> for SlotColumns<'s> {
    fn from(slot: &'s Slot) -> Self {
        let mut c = SlotColumns {
            string: None,
            long: None,
            double: None,
            boolean: None,
            datetime: None,
            guid: None,
            bytes: None,
            hash: None,
        };
        match slot {
            Slot::Empty => {}
            Slot::String(s) => c.string = Some(s),
            Slot::Long(v) => c.long = Some(*v),
            Slot::Double(v) => c.double = Some(*v),
            Slot::Boolean(v) => c.boolean = Some(*v),
            Slot::DateTime(v) => c.datetime = Some(*v),
            Slot::Guid(v) => c.guid = Some(*v),
            Slot::Bytes(v) => c.bytes = Some(v),
            Slot::Hash(h) => c.hash = Some(h),
        }
        c
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub schemes: usize,
    pub structures: usize,
    pub objects: usize,
    pub values: usize,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  Schemes: {}", self.schemes)?;
        writeln!(f, "  Structures: {}", self.structures)?;
        writeln!(f, "  Objects: {}", self.objects)?;
        writeln!(f, "  Values: {}", self.values)
    }
}
