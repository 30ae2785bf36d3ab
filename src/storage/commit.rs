//! Commit Sink - writes object rows and value change sets
//!
//! Two modes:
//! - tracked: per-object existence check, insert-or-update of the object
//!   row, then value rows flushed in two passes (destructive and in-place
//!   changes first, new rows second)
//! - bulk: rows with pre-assigned ids written in one ordered pass per table
//!
//! Neither mode opens a transaction; the caller's `TxScope` is the boundary.

use serde::Serialize;
use crate::Result;
use crate::object::ObjectRecord;
use crate::record::ValueRecord;
use crate::strategy::{ChangeCounts, ChangeSet};
use super::sqlite::SqliteStore;

/// An object row to write in tracked mode
#[derive(Debug, Clone)]
pub struct ObjectWrite {
    pub record: ObjectRecord,
    /// Some value row of this object is inserted, patched or removed
    pub values_changed: bool,
}

/// What happened to one object row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Result of a tracked commit
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    /// Object id and outcome, in write order
    pub objects: Vec<(i64, RowOutcome)>,
    pub values: ChangeCounts,
}

impl SqliteStore {
    /// Apply object rows and a value change set through the tracked path.
    pub fn commit_tracked(&self, objects: &[ObjectWrite], changes: &ChangeSet) -> Result<CommitSummary> {
        let mut summary = CommitSummary {
            objects: Vec::with_capacity(objects.len()),
            values: changes.counts(),
        };

        for write in objects {
            let outcome = self.write_object(write)?;
            summary.objects.push((write.record.id, outcome));
        }

        // Pass 1: removals and in-place patches
        for object_id in &changes.purge {
            let removed = self.delete_values_for_object(*object_id)?;
            tracing::debug!(object = object_id, removed, "purged values");
        }
        for record in &changes.updates {
            self.update_value(record)?;
        }
        for id in &changes.deletes {
            self.delete_value(*id)?;
        }

        // Pass 2: new rows, anchors before the rows that point at them
        for record in &changes.inserts {
            self.insert_value(record)?;
        }

        Ok(summary)
    }

    fn write_object(&self, write: &ObjectWrite) -> Result<RowOutcome> {
        let record = &write.record;
        match self.get_object(record.id)? {
            None => {
                self.insert_object(record)?;
                Ok(RowOutcome::Inserted)
            }
            Some(stored) if !write.values_changed && stored.same_content(record) => Ok(RowOutcome::Unchanged),
            Some(_) => {
                self.update_object(record)?;
                Ok(RowOutcome::Updated)
            }
        }
    }

    /// Insert rows with pre-assigned ids: every object row, then every value row.
    pub fn commit_bulk(&self, objects: &[ObjectRecord], values: &[ValueRecord]) -> Result<()> {
        for record in objects {
            self.insert_object(record)?;
        }
        for record in values {
            self.insert_value(record)?;
        }
        tracing::debug!(objects = objects.len(), values = values.len(), "bulk insert written");
        Ok(())
    }
}
