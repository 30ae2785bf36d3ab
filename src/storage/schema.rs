//! Database schema definitions
//!
//! Foreign keys are enforced and deferred: inside a transaction they are
//! checked at COMMIT, so rows may be written in any order.

/// SQL to create the schemes table
pub const CREATE_SCHEMES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schemes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
)
"#;

/// SQL to create the structures table
/// One row per field definition; `parent_id` forms the per-scheme forest
pub const CREATE_STRUCTURES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS structures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scheme_id INTEGER NOT NULL REFERENCES schemes(id) DEFERRABLE INITIALLY DEFERRED,
    parent_id INTEGER REFERENCES structures(id) DEFERRABLE INITIALLY DEFERRED,
    name TEXT NOT NULL,
    storage_type TEXT NOT NULL,
    is_array INTEGER NOT NULL DEFAULT 0,
    store_null INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the objects table
pub const CREATE_OBJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER REFERENCES objects(id) DEFERRABLE INITIALLY DEFERRED,
    scheme_id INTEGER NOT NULL REFERENCES schemes(id) DEFERRABLE INITIALLY DEFERRED,
    owner_id INTEGER,
    modifier_id INTEGER,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    code_int INTEGER,
    code_string TEXT,
    code_guid BLOB,
    flag INTEGER NOT NULL DEFAULT 0,
    note TEXT,
    hash TEXT
)
"#;

/// SQL to create the attribute-value table
/// Exactly one of the value columns (or `hash`) is set per row
pub const CREATE_VALUES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS object_values (
    id INTEGER PRIMARY KEY,
    object_id INTEGER NOT NULL REFERENCES objects(id) DEFERRABLE INITIALLY DEFERRED,
    structure_id INTEGER NOT NULL REFERENCES structures(id) DEFERRABLE INITIALLY DEFERRED,
    array_parent_id INTEGER REFERENCES object_values(id) DEFERRABLE INITIALLY DEFERRED,
    array_index INTEGER,
    value_string TEXT,
    value_long INTEGER,
    value_double REAL,
    value_bool INTEGER,
    value_datetime TEXT,
    value_guid BLOB,
    value_bytes BLOB,
    hash TEXT
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_structures_name ON structures(scheme_id, IFNULL(parent_id, 0), name)",
    "CREATE INDEX IF NOT EXISTS idx_structures_parent ON structures(scheme_id, parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_objects_scheme ON objects(scheme_id)",
    "CREATE INDEX IF NOT EXISTS idx_values_object ON object_values(object_id, structure_id)",
    "CREATE INDEX IF NOT EXISTS idx_values_parent ON object_values(array_parent_id, array_index)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_SCHEMES_TABLE,
        CREATE_STRUCTURES_TABLE,
        CREATE_OBJECTS_TABLE,
        CREATE_VALUES_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
