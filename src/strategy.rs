//! Persistence Strategy Engine
//!
//! Decides which value rows to write for a save:
//! - `DeleteInsert`: purge every value of the previously existing objects,
//!   insert the freshly materialized records unconditionally
//! - `ChangeTracking`: diff the fresh records against the stored ones and
//!   emit a minimal insert/update/delete set, keeping ids of unchanged rows
//!
//! The diff runs level by level below each matched anchor. Regular fields
//! match by structure id, array elements by position, never by content.
//! A fresh record matched to a stored one takes over the stored id, so its
//! fresh children are re-pointed onto the stored anchor.

use std::collections::HashMap;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};
use crate::record::ValueRecord;

/// Value write strategy for a save call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistStrategy {
    /// Replace every value row of the touched objects
    DeleteInsert,
    /// Write only what changed
    #[default]
    ChangeTracking,
}

impl PersistStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistStrategy::DeleteInsert => "delete-insert",
            PersistStrategy::ChangeTracking => "change-tracking",
        }
    }
}

impl FromStr for PersistStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "delete-insert" | "replace" | "full" => Ok(PersistStrategy::DeleteInsert),
            "change-tracking" | "diff" | "incremental" => Ok(PersistStrategy::ChangeTracking),
            _ => Err(Error::Configuration(format!("Unknown persistence strategy: {}", s))),
        }
    }
}

impl std::fmt::Display for PersistStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value rows to write for one save call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Objects whose stored values are all deleted first
    pub purge: Vec<i64>,
    /// New rows, parents before children
    pub inserts: Vec<ValueRecord>,
    /// Stored rows with a changed slot, keeping their id
    pub updates: Vec<ValueRecord>,
    /// Stored row ids to delete, children before parents
    pub deletes: Vec<i64>,
}

impl ChangeSet {
    /// Delete-insert plan: purge `existing_objects`, insert everything fresh
    pub fn replace(existing_objects: Vec<i64>, fresh: Vec<ValueRecord>) -> Self {
        Self {
            purge: existing_objects,
            inserts: fresh,
            ..Self::default()
        }
    }

    /// Merge another change set into this one
    pub fn extend(&mut self, other: ChangeSet) {
        self.purge.extend(other.purge);
        self.inserts.extend(other.inserts);
        self.updates.extend(other.updates);
        self.deletes.extend(other.deletes);
    }

    /// No row would be written
    pub fn is_empty(&self) -> bool {
        self.purge.is_empty() && self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
            deleted: self.deletes.len(),
            purged_objects: self.purge.len(),
        }
    }
}

/// Summary of a change set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub purged_objects: usize,
}

impl ChangeCounts {
    pub fn add(&mut self, other: ChangeCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.purged_objects += other.purged_objects;
    }
}

/// Records of one object arranged by anchor
struct Forest {
    records: Vec<ValueRecord>,
    children: HashMap<Option<i64>, Vec<usize>>,
}

impl Forest {
    fn new(records: Vec<ValueRecord>) -> Self {
        let mut children: HashMap<Option<i64>, Vec<usize>> = HashMap::new();
        for (position, record) in records.iter().enumerate() {
            children.entry(record.array_parent_id).or_default().push(position);
        }
        Self { records, children }
    }

    /// Children of `anchor`, split into regular fields and array elements
    fn level(&self, anchor: Option<i64>) -> (Vec<usize>, Vec<usize>) {
        let (mut elements, regular): (Vec<usize>, Vec<usize>) = self
            .children
            .get(&anchor)
            .map(|c| c.iter().copied().partition(|&i| self.records[i].is_element()))
            .unwrap_or_default();
        elements.sort_by_key(|&i| (self.records[i].structure_id, self.records[i].array_index));
        (regular, elements)
    }

    /// Ids of `root` and every record below it, children before parents
    fn subtree_post_order(&self, root: usize, out: &mut Vec<i64>) {
        let id = self.records[root].id;
        if let Some(children) = self.children.get(&Some(id)) {
            for &child in children {
                self.subtree_post_order(child, out);
            }
        }
        out.push(id);
    }

    /// `root` and every record below it, parents before children
    fn subtree_pre_order(&self, root: usize, out: &mut Vec<ValueRecord>) {
        let record = &self.records[root];
        out.push(record.clone());
        if let Some(children) = self.children.get(&Some(record.id)) {
            for &child in children {
                self.subtree_pre_order(child, out);
            }
        }
    }
}

/// Diff the fresh records of one object against its stored records.
pub fn diff_object(existing: Vec<ValueRecord>, fresh: Vec<ValueRecord>) -> ChangeSet {
    let old = Forest::new(existing);
    let new = Forest::new(fresh);
    let mut changes = ChangeSet::default();
    diff_level(&old, &new, None, None, &mut changes);
    changes
}

fn diff_level(old: &Forest, new: &Forest, old_anchor: Option<i64>, new_anchor: Option<i64>, changes: &mut ChangeSet) {
    let (old_regular, old_elements) = old.level(old_anchor);
    let (new_regular, new_elements) = new.level(new_anchor);

    // Regular fields: one record per structure below an anchor
    let mut by_structure: HashMap<i64, usize> = HashMap::new();
    let mut duplicates = Vec::new();
    for &i in &old_regular {
        let structure = old.records[i].structure_id;
        if by_structure.contains_key(&structure) {
            duplicates.push(i);
        } else {
            by_structure.insert(structure, i);
        }
    }

    let mut pairs = Vec::new();
    let mut added = Vec::new();
    for &n in &new_regular {
        match by_structure.remove(&new.records[n].structure_id) {
            Some(o) => pairs.push((o, n)),
            None => added.push(n),
        }
    }
    let mut removed: Vec<usize> = by_structure.into_values().chain(duplicates).collect();

    // Array elements: positional within each array structure
    let mut old_by_position: HashMap<(i64, i64), usize> = old_elements
        .iter()
        .map(|&i| ((old.records[i].structure_id, old.records[i].array_index.unwrap_or(0)), i))
        .collect();
    for &n in &new_elements {
        let key = (new.records[n].structure_id, new.records[n].array_index.unwrap_or(0));
        match old_by_position.remove(&key) {
            Some(o) => pairs.push((o, n)),
            None => added.push(n),
        }
    }
    removed.extend(old_by_position.into_values());
    removed.sort_by_key(|&i| (old.records[i].structure_id, old.records[i].array_index));

    for (o, n) in pairs {
        let stored = &old.records[o];
        let fresh = &new.records[n];
        if !stored.slot.same_as(&fresh.slot) {
            changes.updates.push(ValueRecord {
                slot: fresh.slot.clone(),
                ..stored.clone()
            });
        }
        diff_level(old, new, Some(stored.id), Some(fresh.id), changes);
    }

    for n in added {
        let start = changes.inserts.len();
        new.subtree_pre_order(n, &mut changes.inserts);
        // the subtree root hangs off the stored anchor
        changes.inserts[start].array_parent_id = old_anchor;
    }

    for o in removed {
        old.subtree_post_order(o, &mut changes.deletes);
    }
}

/// Diff many objects at once. Records are grouped by owning object.
pub fn diff_objects(existing: Vec<ValueRecord>, fresh: Vec<ValueRecord>) -> ChangeSet {
    let mut old_by_object: HashMap<i64, Vec<ValueRecord>> = HashMap::new();
    for record in existing {
        old_by_object.entry(record.object_id).or_default().push(record);
    }

    let mut order = Vec::new();
    let mut new_by_object: HashMap<i64, Vec<ValueRecord>> = HashMap::new();
    for record in fresh {
        if !new_by_object.contains_key(&record.object_id) {
            order.push(record.object_id);
        }
        new_by_object.entry(record.object_id).or_default().push(record);
    }

    let mut changes = ChangeSet::default();
    for object_id in order {
        let fresh = new_by_object.remove(&object_id).unwrap_or_default();
        let stored = old_by_object.remove(&object_id).unwrap_or_default();
        changes.extend(diff_object(stored, fresh));
    }
    // objects whose every value disappeared
    let mut leftover: Vec<_> = old_by_object.into_iter().collect();
    leftover.sort_by_key(|(id, _)| *id);
    for (_, stored) in leftover {
        changes.extend(diff_object(stored, Vec::new()));
    }
    changes
}
