//! Structure-Tree Value Materializer
//!
//! Walks a scheme's structure forest in lock-step with an object's fields
//! and emits the attribute-value records that mirror the tree:
//! - scalar field: one typed record
//! - array field: one base record (array hash) + one record per element
//! - composite field: one record (content hash) + the child subtree
//! - reference field: one record holding the referenced object's id
//!
//! Records are emitted parents-first, so inserting them in order never
//! references an anchor that does not exist yet.
//!
//! Only array element records carry an array index. The children of a
//! composite element hang off the element record through `array_parent_id`
//! and have no index of their own; their position is the element's.

use crate::{Error, Result};
use crate::hash::ContentHasher;
use crate::ident::IdGenerator;
use crate::object::ObjectRecord;
use crate::record::{Slot, ValueRecord};
use crate::structure::{ElementKind, StructureKind, StructureNode, StructureProvider};
use crate::value::{Fields, Value};

/// Turns one object's fields into value records.
pub struct Materializer<'a> {
    structures: &'a dyn StructureProvider,
    hasher: &'a dyn ContentHasher,
    ids: &'a dyn IdGenerator,
    max_depth: usize,
}

/// Output buffer for one object
struct Emitter {
    object_id: i64,
    records: Vec<ValueRecord>,
}

impl Emitter {
    fn emit(&mut self, id: i64, node: &StructureNode, anchor: Option<i64>, index: Option<i64>, slot: Slot) -> i64 {
        self.records.push(ValueRecord::new(id, self.object_id, node.id, anchor, index, slot));
        id
    }
}

impl<'a> Materializer<'a> {
    pub fn new(
        structures: &'a dyn StructureProvider,
        hasher: &'a dyn ContentHasher,
        ids: &'a dyn IdGenerator,
        max_depth: usize,
    ) -> Self {
        Self {
            structures,
            hasher,
            ids,
            max_depth,
        }
    }

    /// Materialize `fields` of `object` against the scheme's root structures.
    ///
    /// Root nodes without a matching field are skipped, so the structure may
    /// describe more fields than the live object carries.
    pub fn materialize(
        &self,
        object: &ObjectRecord,
        fields: &Fields,
        roots: &[StructureNode],
    ) -> Result<Vec<ValueRecord>> {
        let mut out = Emitter {
            object_id: object.id,
            records: Vec::new(),
        };
        for node in roots {
            self.node(&mut out, node, fields.get(&node.name), None, 0)?;
        }
        tracing::debug!(object = object.id, records = out.records.len(), "materialized object");
        Ok(out.records)
    }

    fn node(
        &self,
        out: &mut Emitter,
        node: &StructureNode,
        value: Option<&Value>,
        anchor: Option<i64>,
        depth: usize,
    ) -> Result<()> {
        let Some(value) = value else {
            return Ok(());
        };

        if value.is_null() {
            if node.store_null {
                out.emit(self.ids.next_id(), node, anchor, None, Slot::Empty);
            }
            return Ok(());
        }

        match node.kind() {
            StructureKind::Array(element) => {
                let items = value.as_array().ok_or_else(|| {
                    Error::conversion(
                        &node.name,
                        node.storage_type,
                        format!("expected an array, got {}", value.type_name()),
                    )
                })?;
                let base = out.emit(
                    self.ids.next_id(),
                    node,
                    anchor,
                    None,
                    Slot::Hash(self.hasher.hash_value(value)),
                );
                for (position, item) in items.iter().enumerate() {
                    self.element(out, node, element, item, base, position as i64, depth)?;
                }
            }
            StructureKind::Composite => {
                self.composite(out, node, value, anchor, None, depth)?;
            }
            StructureKind::Reference => {
                let target = self.reference(node, value)?;
                out.emit(self.ids.next_id(), node, anchor, None, Slot::Long(target));
            }
            StructureKind::Scalar => {
                let slot = Slot::convert(&node.name, value, node.storage_type)?;
                out.emit(self.ids.next_id(), node, anchor, None, slot);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn element(
        &self,
        out: &mut Emitter,
        node: &StructureNode,
        kind: ElementKind,
        item: &Value,
        base: i64,
        index: i64,
        depth: usize,
    ) -> Result<()> {
        // null elements keep their position so indices stay contiguous
        if item.is_null() {
            out.emit(self.ids.next_id(), node, Some(base), Some(index), Slot::Empty);
            return Ok(());
        }

        match kind {
            ElementKind::Scalar => {
                let slot = Slot::convert(&node.name, item, node.storage_type)?;
                out.emit(self.ids.next_id(), node, Some(base), Some(index), slot);
            }
            ElementKind::Reference => {
                let target = self.reference(node, item)?;
                out.emit(self.ids.next_id(), node, Some(base), Some(index), Slot::Long(target));
            }
            ElementKind::Composite => {
                self.composite(out, node, item, Some(base), Some(index), depth)?;
            }
        }
        Ok(())
    }

    fn composite(
        &self,
        out: &mut Emitter,
        node: &StructureNode,
        value: &Value,
        anchor: Option<i64>,
        index: Option<i64>,
        depth: usize,
    ) -> Result<()> {
        let fields = value.as_class().ok_or_else(|| {
            Error::conversion(
                &node.name,
                node.storage_type,
                format!("expected a nested record, got {}", value.type_name()),
            )
        })?;

        let id = out.emit(
            self.ids.next_id(),
            node,
            anchor,
            index,
            Slot::Hash(self.hasher.hash_value(value)),
        );

        if depth + 1 > self.max_depth {
            return Err(Error::NestingTooDeep(self.max_depth));
        }
        for child in self.structures.children(node.scheme_id, Some(node.id))? {
            self.node(out, &child, fields.get(&child.name), Some(id), depth + 1)?;
        }
        Ok(())
    }

    fn reference(&self, node: &StructureNode, value: &Value) -> Result<i64> {
        match value.referenced_id() {
            Some(id) if id > 0 => Ok(id),
            Some(_) => Err(Error::UnresolvedReference(node.name.clone())),
            None => Err(Error::conversion(
                &node.name,
                node.storage_type,
                format!("expected an object reference, got {}", value.type_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3Hasher;
    use crate::ident::SequenceIds;
    use crate::object::BusinessObject;
    use crate::structure::SchemeRef;
    use crate::value::StorageType;

    /// Fixed structure forest for one scheme
    struct FixedStructures {
        nodes: Vec<StructureNode>,
    }

    impl FixedStructures {
        fn person() -> Self {
            let mut nodes = Vec::new();
            let mut add = |id, parent, name: &str, ty, is_array, store_null| {
                nodes.push(StructureNode {
                    id,
                    scheme_id: 1,
                    parent_id: parent,
                    name: name.to_string(),
                    storage_type: ty,
                    is_array,
                    store_null,
                });
            };
            add(1, None, "Name", StorageType::String, false, false);
            add(2, None, "Tags", StorageType::String, true, false);
            add(3, None, "Address", StorageType::Class, false, false);
            add(4, Some(3), "City", StorageType::String, false, false);
            add(5, Some(3), "Zip", StorageType::Long, false, true);
            add(6, None, "Friend", StorageType::Object, false, false);
            add(7, None, "Visits", StorageType::Class, true, false);
            add(8, Some(7), "Place", StorageType::String, false, false);
            add(9, None, "Nickname", StorageType::String, false, true);
            add(10, None, "Age", StorageType::Long, false, false);
            add(11, None, "Unused", StorageType::Double, false, true);
            Self { nodes }
        }
    }

    impl StructureProvider for FixedStructures {
        fn ensure_scheme(&self, name: &str) -> Result<SchemeRef> {
            Ok(SchemeRef { id: 1, name: name.to_string() })
        }

        fn children(&self, scheme_id: i64, parent: Option<i64>) -> Result<Vec<StructureNode>> {
            Ok(self
                .nodes
                .iter()
                .filter(|n| n.scheme_id == scheme_id && n.parent_id == parent)
                .cloned()
                .collect())
        }

        fn sync_structures(&self, _scheme: &SchemeRef) -> Result<Vec<StructureNode>> {
            self.children(1, None)
        }

        fn node(&self, _scheme_id: i64, id: i64) -> Result<Option<StructureNode>> {
            Ok(self.nodes.iter().find(|n| n.id == id).cloned())
        }
    }

    fn run(fields: Fields) -> Result<Vec<ValueRecord>> {
        let structures = FixedStructures::person();
        let hasher = Blake3Hasher::new();
        let ids = SequenceIds::starting_after(100);
        let mut object = BusinessObject::new("Person", fields.clone());
        object.record.id = 1;
        let roots = structures.children(1, None)?;
        Materializer::new(&structures, &hasher, &ids, 16).materialize(&object.record, &fields, &roots)
    }

    #[test]
    fn test_scalar_and_array_layout() {
        let records = run(Fields::new().with("Name", "A").with("Tags", Value::array(["x", "y"]))).unwrap();
        assert_eq!(records.len(), 4);

        let name = &records[0];
        assert_eq!(name.structure_id, 1);
        assert_eq!(name.slot, Slot::String("A".into()));

        let base = &records[1];
        assert_eq!(base.structure_id, 2);
        assert!(matches!(base.slot, Slot::Hash(_)));
        assert_eq!(base.array_index, None);

        let elements: Vec<_> = records[2..].iter().collect();
        assert!(elements.iter().all(|e| e.array_parent_id == Some(base.id)));
        assert_eq!(elements[0].array_index, Some(0));
        assert_eq!(elements[1].array_index, Some(1));
        assert_eq!(elements[1].slot, Slot::String("y".into()));
    }

    #[test]
    fn test_composite_children_anchor_on_hash_record() {
        let records = run(Fields::new().with(
            "Address",
            Fields::new().with("City", "Oslo").with("Zip", Value::Null),
        ))
        .unwrap();
        assert_eq!(records.len(), 3);
        let address = &records[0];
        assert!(matches!(address.slot, Slot::Hash(_)));
        assert!(records[1..].iter().all(|r| r.array_parent_id == Some(address.id)));
        // Zip stores null explicitly
        assert_eq!(records[2].slot, Slot::Empty);
    }

    #[test]
    fn test_null_semantics_follow_store_null_flag() {
        let without = run(Fields::new().with("Age", Value::Null)).unwrap();
        assert!(without.is_empty());

        let with = run(Fields::new().with("Nickname", Value::Null)).unwrap();
        assert_eq!(with.len(), 1);
        assert_eq!(with[0].slot, Slot::Empty);
    }

    #[test]
    fn test_missing_fields_are_skipped_even_with_store_null() {
        // "Unused" stores null but the object has no such field
        let records = run(Fields::new().with("Name", "A")).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reference_holds_target_id() {
        let friend = BusinessObject::new("Person", Fields::new()).with_id(55).into_ref();
        let records = run(Fields::new().with("Friend", friend)).unwrap();
        assert_eq!(records[0].slot, Slot::Long(55));

        let records = run(Fields::new().with("Friend", Value::Ref(56))).unwrap();
        assert_eq!(records[0].slot, Slot::Long(56));
    }

    #[test]
    fn test_unassigned_reference_is_an_error() {
        let friend = BusinessObject::new("Person", Fields::new()).into_ref();
        let err = run(Fields::new().with("Friend", friend)).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference(_)));
    }

    #[test]
    fn test_array_of_composites() {
        let visits = Value::Array(vec![
            Value::Class(Fields::new().with("Place", "Rome")),
            Value::Null,
            Value::Class(Fields::new().with("Place", "Oslo")),
        ]);
        let records = run(Fields::new().with("Visits", visits)).unwrap();
        // base + 3 elements + 2 children
        assert_eq!(records.len(), 6);
        let base = records[0].id;
        let first = &records[1];
        assert_eq!(first.array_parent_id, Some(base));
        assert_eq!(first.array_index, Some(0));
        let place = &records[2];
        assert_eq!(place.array_parent_id, Some(first.id));
        assert_eq!(place.array_index, None);
        assert_eq!(records[3].slot, Slot::Empty);
        assert_eq!(records[3].array_index, Some(1));
        assert_eq!(records[4].array_index, Some(2));
    }

    #[test]
    fn test_numeric_widening_and_type_errors() {
        let records = run(Fields::new().with("Age", 42u8)).unwrap();
        assert_eq!(records[0].slot, Slot::Long(42));

        let err = run(Fields::new().with("Age", "forty")).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));

        let err = run(Fields::new().with("Tags", "not-an-array")).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }
}
