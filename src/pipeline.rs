//! Persistence pipeline - the save and batch-create entry points
//!
//! A save runs, in order:
//! 1. collect the object graph (validation, cycle and depth checks)
//! 2. look up stored rows and apply the NotFound policy to save-by-id objects
//! 3. assign ids and audit fields
//! 4. resolve each scheme's structures, synchronizing on demand
//! 5. check permissions
//! 6. materialize, diff or replace, and commit inside one transaction scope
//!
//! Everything up to step 5 happens before the first object or value write.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};
use crate::collector::{AuditPolicy, Collector, ObjectGraph};
use crate::hash::{Blake3Hasher, ContentHasher};
use crate::ident::IdGenerator;
use crate::materializer::Materializer;
use crate::object::{ObjectRecord, ObjectRef};
use crate::permission::{Action, AllowAll, PermissionChecker, PermissionTarget};
use crate::record::ValueRecord;
use crate::storage::{ObjectWrite, RowOutcome, SqliteStore};
use crate::strategy::{diff_object, ChangeCounts, ChangeSet, PersistStrategy};
use crate::structure::{SchemeRef, StructureNode, StructureProvider};

/// What to do when a save-by-id targets a row that does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    /// Insert the object under the given id
    #[default]
    Insert,
    /// Leave the object out of the save
    Skip,
    /// Fail the whole save with `Error::NotFound`
    Fail,
}

impl NotFoundPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotFoundPolicy::Insert => "insert",
            NotFoundPolicy::Skip => "skip",
            NotFoundPolicy::Fail => "fail",
        }
    }
}

impl FromStr for NotFoundPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "insert" | "upsert" => Ok(NotFoundPolicy::Insert),
            "skip" | "ignore" => Ok(NotFoundPolicy::Skip),
            "fail" | "error" => Ok(NotFoundPolicy::Fail),
            _ => Err(Error::Configuration(format!("Unknown not-found policy: {}", s))),
        }
    }
}

impl std::fmt::Display for NotFoundPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct PersistConfig {
    pub strategy: PersistStrategy,
    pub not_found: NotFoundPolicy,
    /// Busy timeout applied to the store before a bulk write
    pub bulk_timeout: Duration,
    pub max_depth: usize,
    pub permission_ttl: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            strategy: PersistStrategy::default(),
            not_found: NotFoundPolicy::default(),
            bulk_timeout: Duration::from_secs(30),
            max_depth: 32,
            permission_ttl: Duration::from_secs(5),
        }
    }
}

/// An object left out of a save because its structures could not be resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaFailure {
    pub object_id: i64,
    pub scheme: String,
    pub reason: String,
}

/// Outcome of one save call
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveReport {
    /// Ids of the objects passed in, in input order
    pub root_ids: Vec<i64>,
    pub inserted: Vec<i64>,
    pub updated: Vec<i64>,
    pub unchanged: Vec<i64>,
    /// Save-by-id objects left out by the `Skip` policy
    pub skipped: Vec<i64>,
    pub values: ChangeCounts,
    pub schema_failures: Vec<SchemaFailure>,
}

impl SaveReport {
    /// Object and value rows written
    pub fn writes(&self) -> usize {
        self.inserted.len()
            + self.updated.len()
            + self.values.inserted
            + self.values.updated
            + self.values.deleted
            + self.values.purged_objects
    }
}

/// Stored-row lookup result for one collected object
enum Lookup {
    New,
    Existing(ObjectRecord),
    Missing,
    Skipped,
}

/// One object that will be written
struct Pending {
    handle: ObjectRef,
    existed: bool,
    structures: Vec<StructureNode>,
}

/// Objects left out of a save that have no stored row, with their parent.
///
/// Embedded objects pointing at one of them are re-parented to the nearest
/// ancestor that will exist, or become roots.
#[derive(Debug, Default)]
struct Unwritten {
    parents: HashMap<i64, Option<i64>>,
}

impl Unwritten {
    fn add(&mut self, record: &ObjectRecord) {
        self.parents.insert(record.id, record.parent_id);
    }

    fn written_ancestor(&self, mut parent: Option<i64>) -> Option<i64> {
        // parent links are acyclic; the bound only guards the loop
        for _ in 0..=self.parents.len() {
            match parent {
                Some(id) => match self.parents.get(&id) {
                    Some(next) => parent = *next,
                    None => return Some(id),
                },
                None => return None,
            }
        }
        None
    }

    fn relink(&self, plan: &[Pending]) {
        if self.parents.is_empty() {
            return;
        }
        for pending in plan {
            let mut object = pending.handle.borrow_mut();
            let Some(parent) = object.record.parent_id else {
                continue;
            };
            if self.parents.contains_key(&parent) {
                let relinked = self.written_ancestor(Some(parent));
                tracing::debug!(object = object.record.id, parent, ?relinked, "parent left out of the save");
                object.record.parent_id = relinked;
            }
        }
    }
}

/// Saves object graphs into a `SqliteStore`.
pub struct Persister<'a> {
    store: &'a SqliteStore,
    structures: &'a dyn StructureProvider,
    ids: &'a dyn IdGenerator,
    hasher: &'a dyn ContentHasher,
    permissions: &'a dyn PermissionChecker,
    config: PersistConfig,
}

impl<'a> Persister<'a> {
    pub fn new(store: &'a SqliteStore, structures: &'a dyn StructureProvider, ids: &'a dyn IdGenerator) -> Self {
        Self {
            store,
            structures,
            ids,
            hasher: &Blake3Hasher,
            permissions: &AllowAll,
            config: PersistConfig::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: &'a dyn ContentHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_permissions(mut self, permissions: &'a dyn PermissionChecker) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Save `roots` and every object they embed.
    ///
    /// Joins the caller's transaction when one is open on the store.
    pub fn save(&self, roots: &[ObjectRef], user: Option<i64>) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        if roots.is_empty() {
            return Ok(report);
        }

        let graph = Collector::new(self.config.max_depth).collect(roots)?;
        let policy = AuditPolicy::new(user);
        let mut unwritten = Unwritten::default();
        let plan = self.plan(&graph, &policy, &mut report.skipped, &mut unwritten)?;
        let plan = self.resolve_structures(plan, &mut report.schema_failures, &mut unwritten)?;
        unwritten.relink(&plan);
        self.authorize(&plan, user)?;

        let scope = self.store.scope()?;
        let mut stored = match self.config.strategy {
            PersistStrategy::ChangeTracking => self.stored_values(&plan)?,
            PersistStrategy::DeleteInsert => HashMap::new(),
        };

        let materializer = self.materializer();
        let mut writes = Vec::with_capacity(plan.len());
        let mut changes = ChangeSet::default();
        for pending in &plan {
            let object = pending.handle.borrow();
            let id = object.record.id;
            let fields = object.properties.as_ref().ok_or_else(|| missing_properties(&object.scheme))?;
            let fresh = materializer.materialize(&object.record, fields, &pending.structures)?;

            let object_changes = match self.config.strategy {
                PersistStrategy::DeleteInsert => {
                    let purge = if pending.existed { vec![id] } else { Vec::new() };
                    ChangeSet::replace(purge, fresh)
                }
                PersistStrategy::ChangeTracking => diff_object(stored.remove(&id).unwrap_or_default(), fresh),
            };
            tracing::debug!(
                object = id,
                inserts = object_changes.inserts.len(),
                updates = object_changes.updates.len(),
                deletes = object_changes.deletes.len(),
                "planned value changes"
            );

            writes.push(ObjectWrite {
                record: object.record.clone(),
                values_changed: !object_changes.is_empty(),
            });
            changes.extend(object_changes);
        }

        let summary = self.store.commit_tracked(&writes, &changes)?;
        scope.commit()?;

        report.root_ids = roots.iter().map(|r| r.borrow().record.id).collect();
        for (id, outcome) in summary.objects {
            match outcome {
                RowOutcome::Inserted => report.inserted.push(id),
                RowOutcome::Updated => report.updated.push(id),
                RowOutcome::Unchanged => report.unchanged.push(id),
            }
        }
        report.values = summary.values;

        tracing::info!(
            strategy = %self.config.strategy,
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            values_inserted = report.values.inserted,
            values_updated = report.values.updated,
            values_deleted = report.values.deleted,
            "save committed"
        );
        Ok(report)
    }

    /// Insert many new objects through the bulk path, returning their ids
    /// in input order.
    ///
    /// Objects whose rows already exist are not rewritten.
    pub fn batch_create(&self, objects: &[ObjectRef], user: Option<i64>) -> Result<Vec<i64>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let graph = Collector::new(self.config.max_depth).collect(objects)?;
        let policy = AuditPolicy::new(user);
        let mut skipped = Vec::new();
        let mut unwritten = Unwritten::default();
        let plan: Vec<Pending> = self
            .plan(&graph, &policy, &mut skipped, &mut unwritten)?
            .into_iter()
            .filter(|p| !p.existed)
            .collect();

        let mut failures = Vec::new();
        let plan = self.resolve_structures(plan, &mut failures, &mut unwritten)?;
        if let Some(failure) = failures.into_iter().next() {
            return Err(Error::Schema {
                scheme: failure.scheme,
                reason: failure.reason,
            });
        }
        unwritten.relink(&plan);
        self.authorize(&plan, user)?;

        self.store.set_busy_timeout(self.config.bulk_timeout)?;
        let scope = self.store.scope()?;

        let materializer = self.materializer();
        let mut rows = Vec::with_capacity(plan.len());
        let mut values = Vec::new();
        for pending in &plan {
            let object = pending.handle.borrow();
            let fields = object.properties.as_ref().ok_or_else(|| missing_properties(&object.scheme))?;
            values.extend(materializer.materialize(&object.record, fields, &pending.structures)?);
            rows.push(object.record.clone());
        }

        self.store.commit_bulk(&rows, &values)?;
        scope.commit()?;

        tracing::info!(objects = rows.len(), values = values.len(), "batch create committed");
        Ok(objects.iter().map(|o| o.borrow().record.id).collect())
    }

    fn materializer(&self) -> Materializer<'_> {
        Materializer::new(self.structures, self.hasher, self.ids, self.config.max_depth)
    }

    /// Resolve stored rows, apply the NotFound policy and assign identities
    fn plan(
        &self,
        graph: &ObjectGraph,
        policy: &AuditPolicy,
        skipped: &mut Vec<i64>,
        unwritten: &mut Unwritten,
    ) -> Result<Vec<Pending>> {
        let mut lookups = Vec::with_capacity(graph.len());
        for entry in graph.iter() {
            if entry.was_new {
                lookups.push(Lookup::New);
                continue;
            }
            let id = entry.handle.borrow().record.id;
            let lookup = match self.store.get_object(id)? {
                Some(row) => Lookup::Existing(row),
                None => match self.config.not_found {
                    NotFoundPolicy::Insert => {
                        tracing::debug!(object = id, "no stored row, inserting under the given id");
                        Lookup::Missing
                    }
                    NotFoundPolicy::Skip => {
                        tracing::warn!(object = id, "no stored row, skipping object");
                        skipped.push(id);
                        Lookup::Skipped
                    }
                    NotFoundPolicy::Fail => return Err(Error::NotFound(id)),
                },
            };
            lookups.push(lookup);
        }

        graph.assign_identities(self.ids, policy);

        let mut plan = Vec::with_capacity(graph.len());
        for (entry, lookup) in graph.iter().zip(lookups) {
            let existed = {
                let mut object = entry.handle.borrow_mut();
                let record = &mut object.record;
                match lookup {
                    Lookup::Skipped => {
                        unwritten.add(record);
                        continue;
                    }
                    Lookup::New => false,
                    Lookup::Existing(row) => {
                        record.owner_id = row.owner_id;
                        record.created_at = row.created_at;
                        // fields the caller left unset keep their stored value
                        if record.valid_from.is_none() {
                            record.valid_from = row.valid_from;
                        }
                        if record.parent_id.is_none() {
                            record.parent_id = row.parent_id;
                        }
                        true
                    }
                    Lookup::Missing => {
                        record.owner_id = policy.user_id;
                        record.created_at = policy.now;
                        if record.valid_from.is_none() {
                            record.valid_from = Some(policy.now);
                        }
                        false
                    }
                }
            };
            plan.push(Pending {
                handle: entry.handle.clone(),
                existed,
                structures: Vec::new(),
            });
        }
        Ok(plan)
    }

    /// Attach scheme ids, object hashes and root structures.
    ///
    /// Objects whose scheme cannot be synchronized are dropped from the plan
    /// and reported in `failures`.
    fn resolve_structures(
        &self,
        plan: Vec<Pending>,
        failures: &mut Vec<SchemaFailure>,
        unwritten: &mut Unwritten,
    ) -> Result<Vec<Pending>> {
        let mut resolved: HashMap<String, std::result::Result<(SchemeRef, Vec<StructureNode>), String>> =
            HashMap::new();
        let mut kept = Vec::with_capacity(plan.len());

        for mut pending in plan {
            let name = pending.handle.borrow().scheme.clone();
            if !resolved.contains_key(&name) {
                let outcome = match self.structures_for(&name) {
                    Ok(found) => Ok(found),
                    Err(Error::Schema { reason, .. }) => Err(reason),
                    Err(e) => return Err(e),
                };
                resolved.insert(name.clone(), outcome);
            }

            match resolved.get(&name) {
                Some(Ok((scheme, roots))) => {
                    {
                        let mut object = pending.handle.borrow_mut();
                        object.record.scheme_id = scheme.id;
                        let hash = self.hasher.hash_object(&object);
                        object.record.hash = Some(hash);
                    }
                    pending.structures = roots.clone();
                    kept.push(pending);
                }
                Some(Err(reason)) => {
                    let object_id = pending.handle.borrow().record.id;
                    if !pending.existed {
                        unwritten.add(&pending.handle.borrow().record);
                    }
                    tracing::warn!(object = object_id, scheme = %name, %reason, "skipping object, structures unavailable");
                    failures.push(SchemaFailure {
                        object_id,
                        scheme: name,
                        reason: reason.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(kept)
    }

    /// Scheme and root structures for a type, synchronizing when none exist
    fn structures_for(&self, name: &str) -> Result<(SchemeRef, Vec<StructureNode>)> {
        let scheme = self.structures.ensure_scheme(name)?;
        let mut roots = self.structures.children(scheme.id, None)?;
        if roots.is_empty() {
            tracing::debug!(scheme = name, "no structures defined, synchronizing");
            roots = self.structures.sync_structures(&scheme)?;
        }
        Ok((scheme, roots))
    }

    fn authorize(&self, plan: &[Pending], user: Option<i64>) -> Result<()> {
        for pending in plan {
            let object = pending.handle.borrow();
            let (target, action) = if pending.existed {
                (PermissionTarget::Object(object.record.id), Action::Update)
            } else {
                (PermissionTarget::Scheme(object.record.scheme_id), Action::Insert)
            };
            if !self.permissions.check(target, user, action)? {
                let who = user.map_or_else(|| "anonymous".to_string(), |u| format!("user {}", u));
                return Err(Error::Authorization(format!(
                    "{} may not {} {} object {}",
                    who, action, object.scheme, object.record.id
                )));
            }
        }
        Ok(())
    }

    /// Stored value rows of the objects that existed, grouped by object
    fn stored_values(&self, plan: &[Pending]) -> Result<HashMap<i64, Vec<ValueRecord>>> {
        let ids: Vec<i64> = plan
            .iter()
            .filter(|p| p.existed)
            .map(|p| p.handle.borrow().record.id)
            .collect();
        let mut by_object: HashMap<i64, Vec<ValueRecord>> = HashMap::new();
        for record in self.store.load_values(&ids)? {
            by_object.entry(record.object_id).or_default().push(record);
        }
        Ok(by_object)
    }
}

fn missing_properties(scheme: &str) -> Error {
    Error::Validation(format!("object of scheme '{}' has no properties", scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::SequenceIds;
    use crate::object::BusinessObject;
    use crate::reader::Assembler;
    use crate::record::Slot;
    use crate::storage::{StructureCache, StructureCatalog};
    use crate::structure::{FieldDescriptor, SchemaRegistry, TypeDescriptor};
    use crate::value::{Fields, StorageType, Value};

    struct Fixture {
        store: SqliteStore,
        cache: StructureCache,
        registry: SchemaRegistry,
        ids: SequenceIds,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = SchemaRegistry::new();
            registry
                .register(TypeDescriptor::new(
                    "Person",
                    vec![
                        FieldDescriptor::new("Name", StorageType::String),
                        FieldDescriptor::new("Age", StorageType::Long),
                        FieldDescriptor::new("Tags", StorageType::String).array(),
                        FieldDescriptor::class(
                            "Address",
                            vec![
                                FieldDescriptor::new("City", StorageType::String),
                                FieldDescriptor::new("Zip", StorageType::Long).store_null(),
                            ],
                        ),
                        FieldDescriptor::class("Visits", vec![FieldDescriptor::new("Place", StorageType::String)])
                            .array(),
                        FieldDescriptor::new("Friend", StorageType::Object),
                        FieldDescriptor::new("Pets", StorageType::Object).array(),
                        FieldDescriptor::new("Nickname", StorageType::String).store_null(),
                    ],
                ))
                .unwrap();
            registry
                .register(TypeDescriptor::new("Pet", vec![FieldDescriptor::new("Name", StorageType::String)]))
                .unwrap();

            let store = SqliteStore::open_in_memory().unwrap();
            let ids = SequenceIds::starting_after(store.max_assigned_id().unwrap());
            Self {
                store,
                cache: StructureCache::new(),
                registry,
                ids,
            }
        }

        fn catalog(&self) -> StructureCatalog<'_> {
            StructureCatalog::new(&self.store, &self.cache, &self.registry)
        }
    }

    fn config(strategy: PersistStrategy) -> PersistConfig {
        PersistConfig {
            strategy,
            ..PersistConfig::default()
        }
    }

    fn person(fields: Fields) -> ObjectRef {
        BusinessObject::new("Person", fields).into_ref()
    }

    fn set(object: &ObjectRef, name: &str, value: impl Into<Value>) {
        object.borrow_mut().properties.as_mut().unwrap().insert(name, value);
    }

    /// (object, path of (structure, index) from the root record, value) for every stored row
    fn attribute_state(records: &[ValueRecord]) -> Vec<(i64, Vec<(i64, Option<i64>)>, String)> {
        let by_id: HashMap<i64, &ValueRecord> = records.iter().map(|r| (r.id, r)).collect();
        let mut state: Vec<_> = records
            .iter()
            .map(|r| {
                let mut path = vec![(r.structure_id, r.array_index)];
                let mut anchor = r.array_parent_id;
                while let Some(id) = anchor {
                    let parent = by_id[&id];
                    path.push((parent.structure_id, parent.array_index));
                    anchor = parent.array_parent_id;
                }
                path.reverse();
                (r.object_id, path, r.slot.describe())
            })
            .collect();
        state.sort();
        state
    }

    fn tags_of(store: &SqliteStore, object_id: i64, catalog: &StructureCatalog<'_>) -> Vec<(i64, Option<i64>, Slot)> {
        let scheme = catalog.ensure_scheme("Person").unwrap();
        let tags = store.find_structure(scheme.id, None, "Tags").unwrap().unwrap();
        let mut out: Vec<_> = store
            .load_values(&[object_id])
            .unwrap()
            .into_iter()
            .filter(|r| r.structure_id == tags.id && r.is_element())
            .map(|r| (r.id, r.array_index, r.slot))
            .collect();
        out.sort_by_key(|(_, index, _)| *index);
        out
    }

    #[test]
    fn test_tags_scenario() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let a = person(Fields::new().with("Name", "A").with("Tags", Value::array(["x", "y"])));
        let report = persister.save(&[a.clone()], Some(1)).unwrap();
        let id = a.borrow().id();
        assert!(id > 0);
        assert_eq!(report.root_ids, vec![id]);
        assert_eq!(report.inserted, vec![id]);
        // Name + Tags base + 2 elements
        assert_eq!(report.values.inserted, 4);
        let indices: Vec<_> = tags_of(&f.store, id, &catalog).iter().map(|t| t.1).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);

        set(&a, "Tags", Value::array(["x", "y", "z"]));
        let report = persister.save(&[a.clone()], Some(1)).unwrap();
        assert_eq!(report.updated, vec![id]);
        assert_eq!(report.values.updated, 1);
        assert_eq!(report.values.inserted, 1);
        assert_eq!(report.values.deleted, 0);

        let tags = tags_of(&f.store, id, &catalog);
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[2].1, Some(2));
        assert_eq!(tags[2].2, Slot::String("z".into()));
    }

    #[test]
    fn test_array_removal_is_positional() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let a = person(Fields::new().with("Tags", Value::array(["a", "b", "c"])));
        persister.save(&[a.clone()], None).unwrap();
        let id = a.borrow().id();
        let before = tags_of(&f.store, id, &catalog);

        set(&a, "Tags", Value::array(["a", "c"]));
        let report = persister.save(&[a.clone()], None).unwrap();
        assert_eq!(report.values.deleted, 1);
        assert_eq!(report.values.inserted, 0);

        let after = tags_of(&f.store, id, &catalog);
        assert_eq!(after.len(), 2);
        // index 0 untouched, same row
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1].0, before[1].0);
        assert_eq!(after[1].2, Slot::String("c".into()));
        let indices: Vec<_> = after.iter().map(|t| t.1).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_unchanged_save_writes_nothing() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let friend = person(Fields::new().with("Name", "B"));
        let a = person(
            Fields::new()
                .with("Name", "A")
                .with("Tags", Value::array(["x"]))
                .with("Address", Fields::new().with("City", "Oslo"))
                .with("Friend", friend.clone()),
        );
        let first = persister.save(&[a.clone()], Some(3)).unwrap();
        assert_eq!(first.inserted.len(), 2);

        let second = persister.save(&[a.clone()], Some(3)).unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged.len(), 2);
        assert_eq!(second.values, ChangeCounts::default());
    }

    #[test]
    fn test_embedded_objects_are_linked() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let friend = person(Fields::new().with("Name", "B"));
        let pet = BusinessObject::new("Pet", Fields::new().with("Name", "Rex")).into_ref();
        let a = person(
            Fields::new()
                .with("Friend", friend.clone())
                .with("Pets", Value::Array(vec![Value::Object(pet.clone())])),
        );
        persister.save(&[a.clone()], Some(1)).unwrap();

        let root_id = a.borrow().id();
        let friend_row = f.store.get_object(friend.borrow().id()).unwrap().unwrap();
        assert_eq!(friend_row.parent_id, Some(root_id));
        assert_eq!(friend_row.owner_id, Some(1));
        let pet_row = f.store.get_object(pet.borrow().id()).unwrap().unwrap();
        assert_eq!(pet_row.parent_id, Some(root_id));
        assert_ne!(pet_row.scheme_id, friend_row.scheme_id);

        let values = f.store.load_values(&[root_id]).unwrap();
        assert!(values.iter().any(|v| v.slot == Slot::Long(friend.borrow().id())));
        assert!(values.iter().any(|v| v.slot == Slot::Long(pet.borrow().id()) && v.array_index == Some(0)));
    }

    fn run_edits(strategy: PersistStrategy) -> Vec<(i64, Vec<(i64, Option<i64>)>, String)> {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids).with_config(config(strategy));

        let friend = person(Fields::new().with("Name", "B"));
        let a = person(
            Fields::new()
                .with("Name", "A")
                .with("Age", 30)
                .with("Tags", Value::array(["x", "y", "z"]))
                .with("Address", Fields::new().with("City", "Oslo"))
                .with(
                    "Visits",
                    Value::Array(vec![
                        Value::Class(Fields::new().with("Place", "Rome")),
                        Value::Class(Fields::new().with("Place", "Nice")),
                    ]),
                )
                .with("Friend", friend.clone()),
        );
        persister.save(&[a.clone()], None).unwrap();

        set(&a, "Tags", Value::array(["x", "w"]));
        set(&a, "Address", Fields::new().with("City", "Bergen").with("Zip", Value::Null));
        set(&a, "Visits", Value::Array(vec![Value::Class(Fields::new().with("Place", "Lima"))]));
        set(&a, "Nickname", Value::Null);
        set(&friend, "Name", "B2");
        persister.save(&[a.clone()], None).unwrap();

        set(&a, "Tags", Value::array(["x", "w", "v", "u"]));
        a.borrow_mut().properties.as_mut().unwrap().remove("Age");
        persister.save(&[a.clone()], None).unwrap();

        let ids = [a.borrow().id(), friend.borrow().id()];
        attribute_state(&f.store.load_values(&ids).unwrap())
    }

    #[test]
    fn test_strategies_converge() {
        let replaced = run_edits(PersistStrategy::DeleteInsert);
        let tracked = run_edits(PersistStrategy::ChangeTracking);
        assert!(!replaced.is_empty());
        assert_eq!(replaced, tracked);
    }

    #[test]
    fn test_round_trip_reproduces_records() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids).with_config(config(PersistStrategy::DeleteInsert));

        let a = person(
            Fields::new()
                .with("Name", "A")
                .with("Tags", Value::Array(vec![Value::from("x"), Value::Null]))
                .with("Address", Fields::new().with("City", "Oslo").with("Zip", Value::Null))
                .with("Visits", Value::Array(vec![Value::Class(Fields::new().with("Place", "Rome"))]))
                .with("Friend", Value::Ref(9_000)),
        );
        persister.save(&[a.clone()], None).unwrap();

        let id = a.borrow().id();
        let stored = f.store.load_values(&[id]).unwrap();
        let record = f.store.get_object(id).unwrap().unwrap();
        let fields = Assembler::new(&catalog).assemble(record.scheme_id, &stored).unwrap();

        let roots = catalog.children(record.scheme_id, None).unwrap();
        let ids = SequenceIds::starting_after(50_000);
        let again = Materializer::new(&catalog, &Blake3Hasher, &ids, 32)
            .materialize(&record, &fields, &roots)
            .unwrap();
        assert_eq!(attribute_state(&again), attribute_state(&stored));
    }

    #[test]
    fn test_null_fields_follow_store_null() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let a = person(Fields::new().with("Name", Value::Null).with("Nickname", Value::Null));
        let report = persister.save(&[a.clone()], None).unwrap();
        assert_eq!(report.values.inserted, 1);
        let values = f.store.load_values(&[a.borrow().id()]).unwrap();
        assert_eq!(values[0].slot, Slot::Empty);
    }

    #[test]
    fn test_not_found_policies() {
        let f = Fixture::new();
        let catalog = f.catalog();

        let insert = Persister::new(&f.store, &catalog, &f.ids);
        let ghost = BusinessObject::new("Person", Fields::new().with("Name", "G")).with_id(900).into_ref();
        let report = insert.save(&[ghost], None).unwrap();
        assert_eq!(report.inserted, vec![900]);
        assert!(f.store.object_exists(900).unwrap());

        let skip = Persister::new(&f.store, &catalog, &f.ids).with_config(PersistConfig {
            not_found: NotFoundPolicy::Skip,
            ..PersistConfig::default()
        });
        let ghost = BusinessObject::new("Person", Fields::new()).with_id(901).into_ref();
        let report = skip.save(&[ghost], None).unwrap();
        assert_eq!(report.skipped, vec![901]);
        assert!(report.inserted.is_empty());
        assert!(!f.store.object_exists(901).unwrap());

        let fail = Persister::new(&f.store, &catalog, &f.ids).with_config(PersistConfig {
            not_found: NotFoundPolicy::Fail,
            ..PersistConfig::default()
        });
        let fresh = person(Fields::new().with("Name", "N"));
        let ghost = BusinessObject::new("Person", Fields::new()).with_id(902).into_ref();
        let err = fail.save(&[fresh, ghost], None).unwrap_err();
        assert!(matches!(err, Error::NotFound(902)));
        assert_eq!(f.store.count_objects().unwrap(), 1);
    }

    struct DenyInserts;

    impl PermissionChecker for DenyInserts {
        fn check(&self, _target: PermissionTarget, _user: Option<i64>, action: Action) -> Result<bool> {
            Ok(action != Action::Insert)
        }
    }

    #[test]
    fn test_denied_permission_writes_nothing() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids).with_permissions(&DenyInserts);

        let a = person(Fields::new().with("Name", "A"));
        let err = persister.save(&[a], Some(5)).unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        assert_eq!(f.store.count_objects().unwrap(), 0);
        assert_eq!(f.store.count_values().unwrap(), 0);
    }

    #[test]
    fn test_schema_failure_skips_only_that_object() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let good = person(Fields::new().with("Name", "A"));
        let unknown = BusinessObject::new("Unknown", Fields::new().with("X", 1)).into_ref();
        let report = persister.save(&[good.clone(), unknown.clone()], None).unwrap();

        assert_eq!(report.inserted, vec![good.borrow().id()]);
        assert_eq!(report.schema_failures.len(), 1);
        assert_eq!(report.schema_failures[0].scheme, "Unknown");
        assert_eq!(report.schema_failures[0].object_id, unknown.borrow().id());
        assert!(!f.store.object_exists(unknown.borrow().id()).unwrap());
    }

    #[test]
    fn test_object_embedded_in_a_failed_scheme_becomes_a_root() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let good = person(Fields::new().with("Name", "A"));
        let kid = person(Fields::new().with("Name", "K"));
        let unknown = BusinessObject::new("Unknown", Fields::new().with("Kid", kid.clone())).into_ref();
        let report = persister.save(&[good.clone(), unknown.clone()], None).unwrap();

        assert_eq!(report.inserted, vec![good.borrow().id(), kid.borrow().id()]);
        assert_eq!(report.schema_failures.len(), 1);
        assert_eq!(report.schema_failures[0].object_id, unknown.borrow().id());
        assert!(!f.store.object_exists(unknown.borrow().id()).unwrap());
        let kid_row = f.store.get_object(kid.borrow().id()).unwrap().unwrap();
        assert_eq!(kid_row.parent_id, None);
    }

    #[test]
    fn test_object_embedded_in_a_skipped_object_moves_up() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids).with_config(PersistConfig {
            not_found: NotFoundPolicy::Skip,
            ..PersistConfig::default()
        });

        let pet = BusinessObject::new("Pet", Fields::new().with("Name", "Rex")).into_ref();
        let ghost = BusinessObject::new("Person", Fields::new().with("Pets", Value::Array(vec![Value::Object(pet.clone())])))
            .with_id(700)
            .into_ref();
        let owner = person(Fields::new().with("Friend", ghost.clone()));
        let report = persister.save(&[owner.clone()], None).unwrap();

        assert_eq!(report.skipped, vec![700]);
        assert_eq!(report.inserted, vec![owner.borrow().id(), pet.borrow().id()]);
        let pet_row = f.store.get_object(pet.borrow().id()).unwrap().unwrap();
        assert_eq!(pet_row.parent_id, Some(owner.borrow().id()));
    }

    #[test]
    fn test_save_after_rolled_back_outer_transaction() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        // the first save of the type creates its scheme and structures
        f.store.begin_transaction().unwrap();
        persister.save(&[person(Fields::new().with("Name", "A"))], None).unwrap();
        f.store.rollback().unwrap();
        assert_eq!(f.store.stats().unwrap().structures, 0);

        let b = person(Fields::new().with("Name", "B").with("Tags", Value::array(["t"])));
        let report = persister.save(&[b.clone()], None).unwrap();
        assert_eq!(report.inserted, vec![b.borrow().id()]);
        assert_eq!(f.store.count_objects().unwrap(), 1);
        assert_eq!(f.store.count_values().unwrap(), 3);
    }

    #[test]
    fn test_resave_by_id_keeps_stored_audit_fields() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let friend = person(Fields::new().with("Name", "B"));
        let a = person(Fields::new().with("Name", "A").with("Friend", friend.clone()));
        persister.save(&[a.clone()], Some(4)).unwrap();
        let (id, friend_id) = (a.borrow().id(), friend.borrow().id());
        let stored = f.store.get_object(friend_id).unwrap().unwrap();
        assert!(stored.valid_from.is_some());

        // a fresh copy of the friend, as a document with an id would build it
        let copy = BusinessObject::new("Person", Fields::new().with("Name", "B"))
            .with_id(friend_id)
            .into_ref();
        let report = persister.save(&[copy], Some(5)).unwrap();
        assert_eq!(report.unchanged, vec![friend_id]);
        assert_eq!(report.writes(), 0);

        let after = f.store.get_object(friend_id).unwrap().unwrap();
        assert_eq!(after.valid_from, stored.valid_from);
        assert_eq!(after.parent_id, Some(id));
        assert_eq!(after.owner_id, Some(4));
    }

    #[test]
    fn test_nan_field_is_rejected() {
        let f = Fixture::new();
        let mut registry = SchemaRegistry::new();
        registry
            .register(TypeDescriptor::new("Reading", vec![FieldDescriptor::new("Score", StorageType::Double)]))
            .unwrap();
        let catalog = StructureCatalog::new(&f.store, &f.cache, &registry);
        let readings = Persister::new(&f.store, &catalog, &f.ids);

        let ok = BusinessObject::new("Reading", Fields::new().with("Score", 0.5)).into_ref();
        readings.save(&[ok.clone()], None).unwrap();
        assert_eq!(readings.save(&[ok], None).unwrap().writes(), 0);

        let nan = BusinessObject::new("Reading", Fields::new().with("Score", f64::NAN)).into_ref();
        assert!(matches!(readings.save(&[nan], None), Err(Error::Conversion { .. })));
        assert_eq!(f.store.count_objects().unwrap(), 1);
    }

    #[test]
    fn test_cycle_is_rejected_before_writes() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let a = person(Fields::new());
        let b = person(Fields::new().with("Friend", a.clone()));
        set(&a, "Friend", b.clone());

        let err = persister.save(&[a.clone()], None).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
        assert_eq!(f.store.count_objects().unwrap(), 0);
        a.borrow_mut().properties.as_mut().unwrap().remove("Friend");
    }

    #[test]
    fn test_conversion_error_rolls_back() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let good = person(Fields::new().with("Name", "A"));
        let bad = person(Fields::new().with("Age", "old"));
        let err = persister.save(&[good, bad], None).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
        assert_eq!(f.store.count_objects().unwrap(), 0);
        assert!(!f.store.in_transaction());
    }

    #[test]
    fn test_save_joins_outer_transaction() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);
        persister.save(&[person(Fields::new().with("Name", "Seed"))], None).unwrap();

        f.store.begin_transaction().unwrap();
        persister.save(&[person(Fields::new().with("Name", "A"))], None).unwrap();
        assert!(f.store.in_transaction());
        f.store.rollback().unwrap();
        assert_eq!(f.store.count_objects().unwrap(), 1);
    }

    #[test]
    fn test_batch_create() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);

        let existing = person(Fields::new().with("Name", "Old"));
        persister.save(&[existing.clone()], None).unwrap();
        let values_before = f.store.count_values().unwrap();

        let batch: Vec<ObjectRef> = (0..3)
            .map(|i| person(Fields::new().with("Name", format!("P{}", i)).with("Tags", Value::array(["t"]))))
            .collect();
        let mut input = batch.clone();
        input.push(existing.clone());

        let ids = persister.batch_create(&input, Some(2)).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[3], existing.borrow().id());
        assert_eq!(f.store.count_objects().unwrap(), 4);
        // Name + Tags base + one element per new object
        assert_eq!(f.store.count_values().unwrap(), values_before + 9);
        for id in &ids[..3] {
            assert_eq!(f.store.get_object(*id).unwrap().unwrap().owner_id, Some(2));
        }
    }

    #[test]
    fn test_batch_create_inside_outer_transaction() {
        let f = Fixture::new();
        let catalog = f.catalog();
        let persister = Persister::new(&f.store, &catalog, &f.ids);
        persister.save(&[person(Fields::new())], None).unwrap();

        f.store.begin_transaction().unwrap();
        persister.batch_create(&[person(Fields::new().with("Name", "A"))], None).unwrap();
        assert!(f.store.in_transaction());
        f.store.commit().unwrap();
        assert_eq!(f.store.count_objects().unwrap(), 2);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("SKIP".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Skip);
        assert!(matches!("maybe".parse::<NotFoundPolicy>(), Err(Error::Configuration(_))));
    }
}
