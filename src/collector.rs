//! Object Graph Collector
//!
//! Flattens the objects passed by a caller, plus every business object
//! reachable through embedded references (directly, inside arrays, or
//! inside nested records), into one ordered list: roots first, then nested
//! objects in discovery order.
//!
//! Each object instance is collected once. Reaching an object that is on
//! the current path back to its root is a cycle and fails fast.

use std::collections::HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use chrono::{DateTime, Utc};
use crate::{Error, Result};
use crate::ident::IdGenerator;
use crate::object::{BusinessObject, ObjectRef};
use crate::value::{Fields, Value};

type InstanceKey = *const RefCell<BusinessObject>;

/// One entry of a collected graph
#[derive(Debug, Clone)]
pub struct CollectedObject {
    pub handle: ObjectRef,
    /// The object had no id when collected
    pub was_new: bool,
    /// Passed by the caller rather than discovered
    pub is_root: bool,
    /// Position of the object that embeds this one
    pub structural_parent: Option<usize>,
}

/// Audit values applied during identity assignment
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    pub user_id: Option<i64>,
    pub now: DateTime<Utc>,
}

impl AuditPolicy {
    pub fn new(user_id: Option<i64>) -> Self {
        Self {
            user_id,
            now: Utc::now(),
        }
    }
}

/// Flat, order-preserving list of the objects touched by one save call.
#[derive(Debug, Default)]
pub struct ObjectGraph {
    objects: Vec<CollectedObject>,
}

impl ObjectGraph {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CollectedObject> {
        self.objects.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectedObject> {
        self.objects.iter()
    }

    /// Roots in the order the caller passed them
    pub fn roots(&self) -> impl Iterator<Item = &CollectedObject> {
        self.objects.iter().filter(|o| o.is_root)
    }

    /// Assign ids to new objects, stamp audit fields, then link embedded
    /// objects to their structural parent.
    ///
    /// Parent linking runs after every id is resolved, since a parent may
    /// itself have been new.
    pub fn assign_identities(&self, ids: &dyn IdGenerator, policy: &AuditPolicy) {
        for entry in &self.objects {
            let mut object = entry.handle.borrow_mut();
            let record = &mut object.record;
            if record.id == 0 {
                record.id = ids.next_id();
                record.owner_id = policy.user_id;
                record.created_at = policy.now;
                if record.valid_from.is_none() {
                    record.valid_from = Some(policy.now);
                }
            }
            record.modifier_id = policy.user_id;
            record.modified_at = policy.now;
        }

        for entry in &self.objects {
            if let Some(parent) = entry.structural_parent {
                let parent_id = self.objects[parent].handle.borrow().record.id;
                entry.handle.borrow_mut().record.parent_id = Some(parent_id);
            }
        }
    }
}

/// Walks business objects and builds an `ObjectGraph`
#[derive(Debug, Clone, Copy)]
pub struct Collector {
    max_depth: usize,
}

impl Collector {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Collect `roots` and everything they embed.
    pub fn collect(&self, roots: &[ObjectRef]) -> Result<ObjectGraph> {
        let mut walk = Walk {
            max_depth: self.max_depth,
            graph: ObjectGraph::default(),
            seen: HashMap::new(),
            path: Vec::new(),
        };

        for root in roots {
            if walk.seen.contains_key(&Rc::as_ptr(root)) {
                continue;
            }
            walk.push(root, true, None)?;
        }

        let root_count = walk.graph.objects.len();
        for position in 0..root_count {
            let handle = walk.graph.objects[position].handle.clone();
            walk.path.push(Rc::as_ptr(&handle));
            walk.object(position, &handle, 0)?;
            walk.path.pop();
        }

        tracing::debug!(roots = root_count, total = walk.graph.len(), "collected object graph");
        Ok(walk.graph)
    }
}

struct Walk {
    max_depth: usize,
    graph: ObjectGraph,
    seen: HashMap<InstanceKey, usize>,
    path: Vec<InstanceKey>,
}

impl Walk {
    fn push(&mut self, handle: &ObjectRef, is_root: bool, parent: Option<usize>) -> Result<usize> {
        let (was_new, has_properties, scheme) = {
            let object = handle.borrow();
            (object.record.is_new(), object.properties.is_some(), object.scheme.clone())
        };
        if !has_properties {
            return Err(Error::Validation(format!(
                "object of scheme '{}' has no properties",
                scheme
            )));
        }

        let position = self.graph.objects.len();
        self.graph.objects.push(CollectedObject {
            handle: handle.clone(),
            was_new,
            is_root,
            structural_parent: parent,
        });
        self.seen.insert(Rc::as_ptr(handle), position);
        Ok(position)
    }

    fn object(&mut self, position: usize, handle: &ObjectRef, depth: usize) -> Result<()> {
        let object = handle.borrow();
        if let Some(fields) = &object.properties {
            self.fields(position, fields, depth)?;
        }
        Ok(())
    }

    fn fields(&mut self, owner: usize, fields: &Fields, depth: usize) -> Result<()> {
        for value in fields.values() {
            self.value(owner, value, depth)?;
        }
        Ok(())
    }

    fn value(&mut self, owner: usize, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::Object(child) => self.child(owner, child, depth + 1),
            Value::Array(items) => {
                for item in items {
                    self.value(owner, item, depth)?;
                }
                Ok(())
            }
            Value::Class(fields) => {
                if depth + 1 > self.max_depth {
                    return Err(Error::NestingTooDeep(self.max_depth));
                }
                self.fields(owner, fields, depth + 1)
            }
            _ => Ok(()),
        }
    }

    fn child(&mut self, owner: usize, child: &ObjectRef, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::NestingTooDeep(self.max_depth));
        }

        let key = Rc::as_ptr(child);
        if self.path.contains(&key) {
            return Err(Error::CycleDetected(child.borrow().scheme.clone()));
        }
        if self.seen.contains_key(&key) {
            return Ok(());
        }

        let position = self.push(child, false, Some(owner))?;
        self.path.push(key);
        let result = self.object(position, child, depth);
        self.path.pop();
        result
    }
}
