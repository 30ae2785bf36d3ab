//! Structure catalog - SQLite-backed structure trees with an explicit cache
//!
//! `StructureCache` is meant to be shared process-wide: it is keyed by
//! scheme identity, safe for concurrent readers, and only invalidated
//! explicitly when a scheme's structures change.
//!
//! Only durable rows are cached. Schemes and structures a catalog writes
//! inside a transaction it does not own may still be rolled back, so they
//! bypass the cache until the connection is back in autocommit mode.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use crate::{Error, Result};
use crate::structure::{FieldDescriptor, SchemaRegistry, SchemeRef, StructureNode, StructureProvider};
use super::sqlite::SqliteStore;

type ChildKey = (i64, Option<i64>);

/// Cached structure children and scheme lookups
#[derive(Debug, Default)]
pub struct StructureCache {
    children: RwLock<HashMap<ChildKey, Vec<StructureNode>>>,
    schemes: RwLock<HashMap<String, SchemeRef>>,
}

impl StructureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn children(&self, scheme_id: i64, parent: Option<i64>) -> Option<Vec<StructureNode>> {
        let map = self.children.read().unwrap_or_else(|e| e.into_inner());
        map.get(&(scheme_id, parent)).cloned()
    }

    pub fn store_children(&self, scheme_id: i64, parent: Option<i64>, nodes: Vec<StructureNode>) {
        let mut map = self.children.write().unwrap_or_else(|e| e.into_inner());
        map.insert((scheme_id, parent), nodes);
    }

    pub fn scheme(&self, name: &str) -> Option<SchemeRef> {
        let map = self.schemes.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    pub fn store_scheme(&self, scheme: SchemeRef) {
        let mut map = self.schemes.write().unwrap_or_else(|e| e.into_inner());
        map.insert(scheme.name.clone(), scheme);
    }

    /// Drop every cached level of one scheme
    pub fn invalidate(&self, scheme_id: i64) {
        let mut map = self.children.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|(scheme, _), _| *scheme != scheme_id);
    }

    pub fn clear(&self) {
        self.children.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.schemes.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of cached structure levels
    pub fn len(&self) -> usize {
        self.children.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Structure provider over the `schemes` and `structures` tables.
///
/// Structures are derived from the type descriptors in `registry`.
pub struct StructureCatalog<'a> {
    store: &'a SqliteStore,
    cache: &'a StructureCache,
    registry: &'a SchemaRegistry,
    uncommitted: RefCell<Uncommitted>,
}

/// Schemes written inside a caller's transaction
#[derive(Debug, Default)]
struct Uncommitted {
    names: HashSet<String>,
    ids: HashSet<i64>,
}

impl<'a> StructureCatalog<'a> {
    pub fn new(store: &'a SqliteStore, cache: &'a StructureCache, registry: &'a SchemaRegistry) -> Self {
        Self {
            store,
            cache,
            registry,
            uncommitted: RefCell::new(Uncommitted::default()),
        }
    }

    /// Remember a scheme whose rows are not durable yet
    fn mark_uncommitted(&self, scheme: &SchemeRef) {
        tracing::debug!(scheme = %scheme.name, "structures written inside an open transaction, bypassing cache");
        let mut uncommitted = self.uncommitted.borrow_mut();
        uncommitted.names.insert(scheme.name.clone());
        uncommitted.ids.insert(scheme.id);
        self.cache.invalidate(scheme.id);
    }

    /// Once the enclosing transaction has ended, committed or not, drop
    /// whatever the cache may hold for the schemes written inside it.
    fn settle(&self) {
        if self.store.in_transaction() {
            return;
        }
        let mut uncommitted = self.uncommitted.borrow_mut();
        for id in uncommitted.ids.drain() {
            self.cache.invalidate(id);
        }
        uncommitted.names.clear();
    }

    fn is_uncommitted_name(&self, name: &str) -> bool {
        self.uncommitted.borrow().names.contains(name)
    }

    fn is_uncommitted_id(&self, scheme_id: i64) -> bool {
        self.uncommitted.borrow().ids.contains(&scheme_id)
    }

    /// Create or update the nodes for `fields` below `parent`
    fn upsert_fields(&self, scheme_id: i64, parent: Option<i64>, fields: &[FieldDescriptor]) -> Result<usize> {
        let mut written = 0;
        for (position, field) in fields.iter().enumerate() {
            let wanted = StructureNode {
                id: 0,
                scheme_id,
                parent_id: parent,
                name: field.name.clone(),
                storage_type: field.storage_type,
                is_array: field.array,
                store_null: field.store_null,
            };

            let id = match self.store.find_structure(scheme_id, parent, &field.name)? {
                Some(existing) => {
                    let updated = StructureNode { id: existing.id, ..wanted };
                    self.store.update_structure(&updated, position as i64)?;
                    if updated != existing {
                        written += 1;
                    }
                    existing.id
                }
                None => {
                    written += 1;
                    self.store.insert_structure(&wanted, position as i64)?
                }
            };

            written += self.upsert_fields(scheme_id, Some(id), &field.fields)?;
        }
        Ok(written)
    }
}

impl StructureProvider for StructureCatalog<'_> {
    fn ensure_scheme(&self, name: &str) -> Result<SchemeRef> {
        self.settle();
        if self.is_uncommitted_name(name) {
            return self
                .store
                .find_scheme(name)?
                .map_or_else(|| self.store.insert_scheme(name), Ok);
        }
        if let Some(scheme) = self.cache.scheme(name) {
            return Ok(scheme);
        }
        let scheme = match self.store.find_scheme(name)? {
            Some(scheme) => scheme,
            None => {
                tracing::debug!(scheme = name, "creating scheme");
                let scheme = self.store.insert_scheme(name)?;
                if self.store.in_transaction() {
                    self.mark_uncommitted(&scheme);
                    return Ok(scheme);
                }
                scheme
            }
        };
        self.cache.store_scheme(scheme.clone());
        Ok(scheme)
    }

    fn children(&self, scheme_id: i64, parent: Option<i64>) -> Result<Vec<StructureNode>> {
        self.settle();
        if self.is_uncommitted_id(scheme_id) {
            return self.store.structure_children(scheme_id, parent);
        }
        if let Some(nodes) = self.cache.children(scheme_id, parent) {
            return Ok(nodes);
        }
        let nodes = self.store.structure_children(scheme_id, parent)?;
        self.cache.store_children(scheme_id, parent, nodes.clone());
        Ok(nodes)
    }

    fn sync_structures(&self, scheme: &SchemeRef) -> Result<Vec<StructureNode>> {
        let descriptor = self.registry.get(&scheme.name).ok_or_else(|| Error::Schema {
            scheme: scheme.name.clone(),
            reason: "no type descriptor registered".to_string(),
        })?;
        descriptor.validate()?;

        let scope = self.store.scope()?;
        let joined = !scope.is_owner();
        let written = self.upsert_fields(scheme.id, None, &descriptor.fields)?;
        scope.commit()?;

        self.cache.invalidate(scheme.id);
        if joined && written > 0 {
            self.mark_uncommitted(scheme);
        }
        tracing::info!(scheme = %scheme.name, written, "synchronized structures");
        self.children(scheme.id, None)
    }

    fn node(&self, scheme_id: i64, id: i64) -> Result<Option<StructureNode>> {
        Ok(self.store.get_structure(id)?.filter(|n| n.scheme_id == scheme_id))
    }
}
