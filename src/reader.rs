//! Reassembly of stored value records into business fields
//!
//! The inverse of the materializer for one object: walks the structure
//! forest and the stored records level by level. Arrays come back ordered
//! by index, composites as nested `Fields`, references as `Value::Ref`.

use std::collections::HashMap;
use crate::Result;
use crate::record::{Slot, ValueRecord};
use crate::structure::{ElementKind, StructureKind, StructureNode, StructureProvider};
use crate::value::{Fields, Value};

/// Rebuilds `Fields` from value records.
pub struct Assembler<'a> {
    structures: &'a dyn StructureProvider,
}

/// Records of one object indexed by anchor
struct Stored<'r> {
    by_anchor: HashMap<Option<i64>, Vec<&'r ValueRecord>>,
}

impl<'r> Stored<'r> {
    fn new(records: &'r [ValueRecord]) -> Self {
        let mut by_anchor: HashMap<Option<i64>, Vec<&ValueRecord>> = HashMap::new();
        for record in records {
            by_anchor.entry(record.array_parent_id).or_default().push(record);
        }
        Self { by_anchor }
    }

    /// Regular record for `structure_id` below `anchor`
    fn field(&self, anchor: Option<i64>, structure_id: i64) -> Option<&'r ValueRecord> {
        self.by_anchor
            .get(&anchor)?
            .iter()
            .find(|r| r.structure_id == structure_id && !r.is_element())
            .copied()
    }

    /// Elements below an array base, in index order
    fn elements(&self, base: i64) -> Vec<&'r ValueRecord> {
        let mut items: Vec<_> = self
            .by_anchor
            .get(&Some(base))
            .map(|c| c.iter().filter(|r| r.is_element()).copied().collect())
            .unwrap_or_default();
        items.sort_by_key(|r| r.array_index);
        items
    }
}

impl<'a> Assembler<'a> {
    pub fn new(structures: &'a dyn StructureProvider) -> Self {
        Self { structures }
    }

    /// Rebuild the fields of one object from its stored records
    pub fn assemble(&self, scheme_id: i64, records: &[ValueRecord]) -> Result<Fields> {
        let stored = Stored::new(records);
        self.level(&stored, scheme_id, None, None)
    }

    fn level(&self, stored: &Stored<'_>, scheme_id: i64, parent: Option<i64>, anchor: Option<i64>) -> Result<Fields> {
        let mut fields = Fields::new();
        for node in self.structures.children(scheme_id, parent)? {
            if let Some(record) = stored.field(anchor, node.id) {
                let value = self.field_value(stored, &node, record)?;
                fields.insert(node.name.clone(), value);
            }
        }
        Ok(fields)
    }

    fn field_value(&self, stored: &Stored<'_>, node: &StructureNode, record: &ValueRecord) -> Result<Value> {
        if record.slot.is_empty() {
            return Ok(Value::Null);
        }
        match node.kind() {
            StructureKind::Array(kind) => {
                let mut items = Vec::new();
                for element in stored.elements(record.id) {
                    items.push(self.element_value(stored, node, kind, element)?);
                }
                Ok(Value::Array(items))
            }
            StructureKind::Composite => {
                let fields = self.level(stored, node.scheme_id, Some(node.id), Some(record.id))?;
                Ok(Value::Class(fields))
            }
            StructureKind::Reference => Ok(reference(&record.slot)),
            StructureKind::Scalar => Ok(record.slot.to_value()),
        }
    }

    fn element_value(
        &self,
        stored: &Stored<'_>,
        node: &StructureNode,
        kind: ElementKind,
        element: &ValueRecord,
    ) -> Result<Value> {
        if element.slot.is_empty() {
            return Ok(Value::Null);
        }
        Ok(match kind {
            ElementKind::Scalar => element.slot.to_value(),
            ElementKind::Reference => reference(&element.slot),
            ElementKind::Composite => {
                Value::Class(self.level(stored, node.scheme_id, Some(node.id), Some(element.id))?)
            }
        })
    }
}

fn reference(slot: &Slot) -> Value {
    match slot {
        Slot::Long(id) => Value::Ref(*id),
        other => other.to_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Blake3Hasher, ContentHasher};
    use crate::ident::SequenceIds;
    use crate::materializer::Materializer;
    use crate::object::ObjectRecord;
    use crate::storage::{SqliteStore, StructureCache, StructureCatalog};
    use crate::structure::{FieldDescriptor, SchemaRegistry, TypeDescriptor};
    use crate::value::StorageType;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(TypeDescriptor::new(
                "Person",
                vec![
                    FieldDescriptor::new("Name", StorageType::String),
                    FieldDescriptor::new("Tags", StorageType::String).array(),
                    FieldDescriptor::class("Address", vec![FieldDescriptor::new("City", StorageType::String)]),
                    FieldDescriptor::class("Visits", vec![FieldDescriptor::new("Place", StorageType::String)]).array(),
                    FieldDescriptor::new("Friend", StorageType::Object),
                    FieldDescriptor::new("Nickname", StorageType::String).store_null(),
                ],
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_materialize_then_assemble() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cache = StructureCache::new();
        let registry = registry();
        let catalog = StructureCatalog::new(&store, &cache, &registry);
        let scheme = catalog.ensure_scheme("Person").unwrap();
        let roots = catalog.sync_structures(&scheme).unwrap();

        let fields = Fields::new()
            .with("Name", "A")
            .with("Tags", Value::array(["x", "y"]))
            .with("Address", Fields::new().with("City", "Oslo"))
            .with(
                "Visits",
                Value::Array(vec![Value::Class(Fields::new().with("Place", "Rome")), Value::Null]),
            )
            .with("Friend", Value::Ref(77))
            .with("Nickname", Value::Null);

        let mut record = ObjectRecord::new();
        record.id = 1;
        record.scheme_id = scheme.id;
        let hasher = Blake3Hasher::new();
        let ids = SequenceIds::starting_after(10);
        let records = Materializer::new(&catalog, &hasher, &ids, 8)
            .materialize(&record, &fields, &roots)
            .unwrap();

        let rebuilt = Assembler::new(&catalog).assemble(scheme.id, &records).unwrap();
        assert_eq!(rebuilt, fields);
        assert_eq!(
            hasher.hash_value(&Value::Class(rebuilt)),
            hasher.hash_value(&Value::Class(fields))
        );
    }

    #[test]
    fn test_no_records_gives_empty_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cache = StructureCache::new();
        let registry = registry();
        let catalog = StructureCatalog::new(&store, &cache, &registry);
        let scheme = catalog.ensure_scheme("Person").unwrap();
        catalog.sync_structures(&scheme).unwrap();

        let rebuilt = Assembler::new(&catalog).assemble(scheme.id, &[]).unwrap();
        assert!(rebuilt.is_empty());
    }
}
