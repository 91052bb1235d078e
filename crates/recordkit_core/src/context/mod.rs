//! Units of work over a store.
//!
//! # Responsibility
//! - Keep an identity map of entities fetched or created in one context.
//! - Merge pending (unsaved or dirty) entities into fetch and count results.
//! - Save pending changes atomically and broadcast them to other contexts.
//! - Merge change sets saved elsewhere according to the merge policy.
//!
//! # Invariants
//! - One identity maps to at most one `Entity` instance per context.
//! - Clean entities are registered only while a caller holds a handle.
//! - Operations on one context are serialized by its state mutex.
//! - Lock order is context state, then store connection, then subscribers.
//!
//! # See also
//! - `registry` for main/current context resolution.

use crate::model::entity::{Entity, EntityId, EntityState};
use crate::model::schema::{EntitySchema, SchemaError};
use crate::model::value::Value;
use crate::query::fetch::FetchRequest;
use crate::query::predicate::Predicate;
use crate::store::{sql, Store, StoreError, StoreResult};
use log::{debug, error, info};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Debug, Display, Formatter};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod registry;

pub use registry::{ContextGuard, ContextRegistry};

/// Process-unique context identifier (unique per store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Which execution unit a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    /// Bound to the primary thread; merges saves from other contexts.
    Main,
    /// Short-lived context for one background unit of work.
    Background,
}

/// Conflict resolution when merging saved changes into a context that has
/// unsaved edits of the same attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Unsaved in-memory values win per attribute.
    #[default]
    InMemoryWins,
    /// Incoming store values win per attribute.
    StoreWins,
}

/// Attribute values written for one entity by a save.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedEntity {
    pub id: EntityId,
    pub values: BTreeMap<String, Value>,
}

/// Identities affected by one save or batch delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserted: Vec<EntityId>,
    pub updated: Vec<UpdatedEntity>,
    pub deleted: Vec<EntityId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

struct ContextState {
    registered: HashMap<EntityId, Entity>,
    /// Unsaved entities in insertion order.
    inserted: Vec<EntityId>,
    merge_policy: MergePolicy,
}

impl ContextState {
    /// Registered entities of `kind` whose in-memory state differs from the
    /// store: unsaved inserts first (in insertion order), then dirty saved
    /// entities ordered by id.
    fn pending_for(&self, kind: &str) -> Vec<Entity> {
        let mut pending: Vec<Entity> = self
            .inserted
            .iter()
            .filter_map(|id| self.registered.get(id))
            .filter(|entity| entity.kind() == kind)
            .cloned()
            .collect();

        let mut changed: Vec<(EntityId, Entity)> = self
            .registered
            .values()
            .filter(|entity| entity.kind() == kind)
            .filter_map(|entity| {
                let record = entity.lock();
                if record.state == EntityState::Saved && record.is_dirty() {
                    Some((record.id, entity.clone()))
                } else {
                    None
                }
            })
            .collect();
        changed.sort_by_key(|(id, _)| *id);
        pending.extend(changed.into_iter().map(|(_, entity)| entity));
        pending
    }

    /// Drops clean entities that no handle outside the identity map refers
    /// to. Unsaved and dirty entities stay registered until saved.
    fn evict_unreferenced(&mut self) {
        self.registered
            .retain(|_, entity| entity.is_shared() || entity.has_changes());
    }

    fn apply(&mut self, changes: &ChangeSet) {
        let keep_local = self.merge_policy == MergePolicy::InMemoryWins;
        for update in &changes.updated {
            if let Some(entity) = self.registered.get(&update.id) {
                entity.lock().merge_committed(&update.values, keep_local);
            }
        }
        for id in &changes.deleted {
            if let Some(entity) = self.registered.remove(id) {
                entity.lock().mark_deleted();
            }
        }
        if !changes.deleted.is_empty() {
            self.inserted.retain(|id| !changes.deleted.contains(id));
        }
    }
}

struct ContextInner {
    id: ContextId,
    role: ContextRole,
    store: Arc<Store>,
    state: Mutex<ContextState>,
    incoming: Option<Mutex<Receiver<ChangeSet>>>,
}

/// Shared handle to one unit of work.
///
/// Clones refer to the same context. A context is meant to be used by one
/// execution unit at a time; background units create their own.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a context over `store`.
    ///
    /// `Main` contexts subscribe to changes saved by other contexts and merge
    /// them before each operation.
    pub fn new(store: &Arc<Store>, role: ContextRole) -> Self {
        let id = store.next_context_id();
        let incoming = match role {
            ContextRole::Main => Some(Mutex::new(store.subscribe(id))),
            ContextRole::Background => None,
        };
        debug!(
            "event=context_create module=context status=ok context={} role={:?}",
            id, role
        );
        Self {
            inner: Arc::new(ContextInner {
                id,
                role,
                store: Arc::clone(store),
                state: Mutex::new(ContextState {
                    registered: HashMap::new(),
                    inserted: Vec::new(),
                    merge_policy: MergePolicy::default(),
                }),
                incoming,
            }),
        }
    }

    pub fn background(store: &Arc<Store>) -> Self {
        Self::new(store, ContextRole::Background)
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn role(&self) -> ContextRole {
        self.inner.role
    }

    pub fn is_main(&self) -> bool {
        self.inner.role == ContextRole::Main
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Whether both handles refer to the same context.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.lock_state().merge_policy
    }

    pub fn set_merge_policy(&self, policy: MergePolicy) {
        self.lock_state().merge_policy = policy;
    }

    /// Whether any registered entity has unsaved inserts or changes.
    pub fn has_changes(&self) -> bool {
        let state = self.lock_state();
        !state.inserted.is_empty() || state.registered.values().any(Entity::has_changes)
    }

    /// Number of entities in the identity map.
    pub fn registered_count(&self) -> usize {
        self.lock_state().registered.len()
    }

    /// Returns the registered instance for `id` without touching the store.
    pub fn registered(&self, id: EntityId) -> Option<Entity> {
        self.lock_state().registered.get(&id).cloned()
    }

    /// Allocates a new unsaved entity of `schema`'s kind.
    pub fn insert(&self, schema: &EntitySchema) -> StoreResult<Entity> {
        let schema = self.bind_schema(schema)?;
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);

        let entity = Entity::inserted(schema, self.id());
        let id = entity.id();
        state.registered.insert(id, entity.clone());
        state.inserted.push(id);
        Ok(entity)
    }

    /// Fetches entities matching `request`, including pending in-memory
    /// entities of this context.
    pub fn fetch(&self, schema: &EntitySchema, request: &FetchRequest) -> StoreResult<Vec<Entity>> {
        let schema = self.bind_schema(schema)?;
        let request = request.resolve(&schema)?;
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);
        self.fetch_locked(&mut state, &schema, &request)
    }

    pub fn count(&self, schema: &EntitySchema, predicate: &Predicate) -> StoreResult<usize> {
        let schema = self.bind_schema(schema)?;
        let predicate = predicate.resolve(&schema)?;
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);

        if state.pending_for(&schema.kind).is_empty() {
            let conn = self.inner.store.connection();
            return sql::count_rows(&conn, &schema, &predicate);
        }
        let request = FetchRequest::matching(predicate);
        Ok(self.fetch_locked(&mut state, &schema, &request)?.len())
    }

    /// Writes pending inserts and changes in one transaction.
    ///
    /// On failure nothing is written and pending state is kept.
    pub fn save(&self) -> StoreResult<()> {
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);

        let inserted: Vec<Entity> = state
            .inserted
            .iter()
            .filter_map(|id| state.registered.get(id))
            .cloned()
            .collect();
        let mut updated: Vec<Entity> = state
            .registered
            .values()
            .filter(|entity| {
                let record = entity.lock();
                record.state == EntityState::Saved && record.is_dirty()
            })
            .cloned()
            .collect();
        updated.sort_by_key(Entity::id);

        if inserted.is_empty() && updated.is_empty() {
            return Ok(());
        }

        let changes = match self.write_changes(&inserted, &updated) {
            Ok(changes) => changes,
            Err(err) => {
                error!(
                    "event=context_save module=context status=error context={} error={}",
                    self.id(),
                    err
                );
                return Err(err);
            }
        };

        for entity in inserted.iter().chain(updated.iter()) {
            entity.lock().mark_saved();
        }
        state.inserted.clear();
        drop(state);

        info!(
            "event=context_save module=context status=ok context={} inserted={} updated={}",
            self.id(),
            changes.inserted.len(),
            changes.updated.len()
        );
        self.inner.store.broadcast(self.id(), &changes);
        Ok(())
    }

    fn write_changes(&self, inserted: &[Entity], updated: &[Entity]) -> StoreResult<ChangeSet> {
        let mut changes = ChangeSet::default();
        let mut conn = self.inner.store.connection();
        let tx = conn.transaction()?;

        for entity in inserted {
            let record = entity.lock();
            entity.schema().check_required(&record.values)?;
            sql::insert_row(&tx, entity.schema(), record.id, &record.values)?;
            changes.inserted.push(record.id);
        }

        for entity in updated {
            let record = entity.lock();
            entity.schema().check_required(&record.values)?;
            let values: BTreeMap<String, Value> = record
                .changed
                .iter()
                .map(|name| {
                    let value = record.values.get(name).cloned().unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect();
            if sql::update_row(&tx, entity.schema(), record.id, &values)? == 0 {
                return Err(StoreError::ObjectNotFound(record.id));
            }
            changes.updated.push(UpdatedEntity {
                id: record.id,
                values,
            });
        }

        tx.commit()?;
        Ok(changes)
    }

    /// Deletes every stored entity matching `predicate` without loading it,
    /// then merges the deleted identities into this context and broadcasts
    /// them to merging contexts.
    ///
    /// Unsaved inserts of this context are not affected.
    pub fn batch_delete(
        &self,
        schema: &EntitySchema,
        predicate: &Predicate,
    ) -> StoreResult<Vec<EntityId>> {
        let schema = self.bind_schema(schema)?;
        let predicate = predicate.resolve(&schema)?;
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);

        let deleted = {
            let mut conn = self.inner.store.connection();
            sql::delete_matching(&mut conn, &schema, &predicate)?
        };
        let changes = ChangeSet {
            deleted: deleted.clone(),
            ..ChangeSet::default()
        };
        state.apply(&changes);
        drop(state);

        info!(
            "event=context_batch_delete module=context status=ok context={} kind={} deleted={}",
            self.id(),
            schema.kind,
            deleted.len()
        );
        self.inner.store.broadcast(self.id(), &changes);
        Ok(deleted)
    }

    /// Merges a change set saved elsewhere into this context.
    pub fn merge_changes(&self, changes: &ChangeSet) {
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);
        state.apply(changes);
    }

    /// Applies change sets received from other contexts' saves.
    ///
    /// Runs implicitly at the start of every operation; call it directly to
    /// refresh entity handles without issuing a query.
    pub fn process_pending_changes(&self) {
        let mut state = self.lock_state();
        self.drain_incoming(&mut state);
    }

    fn drain_incoming(&self, state: &mut ContextState) {
        let Some(incoming) = &self.inner.incoming else {
            return;
        };
        let receiver = incoming.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(changes) = receiver.try_recv() {
            state.apply(&changes);
        }
    }

    fn fetch_locked(
        &self,
        state: &mut ContextState,
        schema: &Arc<EntitySchema>,
        request: &FetchRequest,
    ) -> StoreResult<Vec<Entity>> {
        let pending = state.pending_for(&schema.kind);
        let rows = {
            let conn = self.inner.store.connection();
            sql::select_rows(&conn, schema, request, pending.is_empty())?
        };

        let mut results = Vec::with_capacity(rows.len());
        let mut seen = HashSet::new();
        for (id, values) in rows {
            if let Some(existing) = state.registered.get(&id) {
                {
                    let mut record = existing.lock();
                    if record.is_dirty() {
                        // Re-evaluated against in-memory values below.
                        continue;
                    }
                    record.refresh(values);
                }
                results.push(existing.clone());
            } else {
                let entity = Entity::fetched(Arc::clone(schema), self.id(), id, values);
                state.registered.insert(id, entity.clone());
                results.push(entity);
            }
            seen.insert(id);
        }

        if pending.is_empty() {
            return Ok(results);
        }

        for entity in pending {
            let matches = {
                let record = entity.lock();
                !seen.contains(&record.id) && request.predicate.matches(record.id, &record.values)
            };
            if matches {
                results.push(entity);
            }
        }

        if !request.sort.is_empty() {
            let mut keyed: Vec<(EntityId, BTreeMap<String, Value>, Entity)> = results
                .into_iter()
                .map(|entity| {
                    let (id, values) = {
                        let record = entity.lock();
                        (record.id, record.values.clone())
                    };
                    (id, values, entity)
                })
                .collect();
            keyed.sort_by(|a, b| request.compare((a.0, &a.1), (b.0, &b.1)));
            results = keyed.into_iter().map(|(_, _, entity)| entity).collect();
        }

        if let Some(limit) = request.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Returns this store's descriptor for `schema.kind`, rejecting
    /// descriptors that do not belong to the store's model.
    fn bind_schema(&self, schema: &EntitySchema) -> StoreResult<Arc<EntitySchema>> {
        let bound = self.inner.store.schema(&schema.kind)?;
        if *bound != *schema {
            return Err(StoreError::Schema(SchemaError::UnknownEntity(
                schema.kind.clone(),
            )));
        }
        Ok(bound)
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.evict_unreferenced();
        state
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}
