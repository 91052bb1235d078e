//! Entity handles.
//!
//! # Responsibility
//! - Represent one persisted (or pending) record registered in a context.
//! - Track per-attribute changes since the last save or merge.
//!
//! # Invariants
//! - Handles are shared: clones point at the same in-memory instance.
//! - A handle belongs to exactly one context for its whole lifetime.
//! - `Deleted` is terminal; a deleted identity is never revived.

use crate::context::ContextId;
use crate::model::schema::{EntitySchema, SchemaResult};
use crate::model::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Stable identity of one entity.
pub type EntityId = Uuid;

/// Lifecycle of an entity as seen by its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created in a context, not yet durable.
    Unsaved,
    /// Durable in the store.
    Saved,
    /// Identity removed from the store.
    Deleted,
}

pub(crate) struct EntityRecord {
    pub(crate) id: EntityId,
    pub(crate) state: EntityState,
    pub(crate) values: BTreeMap<String, Value>,
    /// Last values known to be in the store.
    pub(crate) committed: BTreeMap<String, Value>,
    pub(crate) changed: BTreeSet<String>,
}

impl EntityRecord {
    pub(crate) fn is_dirty(&self) -> bool {
        self.state == EntityState::Unsaved || !self.changed.is_empty()
    }

    pub(crate) fn mark_saved(&mut self) {
        self.state = EntityState::Saved;
        self.committed = self.values.clone();
        self.changed.clear();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = EntityState::Deleted;
        self.changed.clear();
    }

    /// Replaces clean values with a fresh store snapshot.
    pub(crate) fn refresh(&mut self, values: BTreeMap<String, Value>) {
        if self.is_dirty() {
            return;
        }
        self.committed = values.clone();
        self.values = values;
    }

    /// Applies values committed by another context.
    ///
    /// With `keep_local` set, attributes changed in memory keep their local
    /// value; otherwise the incoming value replaces them.
    pub(crate) fn merge_committed(&mut self, incoming: &BTreeMap<String, Value>, keep_local: bool) {
        for (name, value) in incoming {
            self.committed.insert(name.clone(), value.clone());
            if keep_local && self.changed.contains(name) {
                continue;
            }
            self.values.insert(name.clone(), value.clone());
            self.changed.remove(name);
        }
    }
}

/// Shared handle to one entity instance.
#[derive(Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    context_id: ContextId,
    record: Arc<Mutex<EntityRecord>>,
}

impl Entity {
    pub(crate) fn inserted(schema: Arc<EntitySchema>, context_id: ContextId) -> Self {
        let values: BTreeMap<String, Value> = schema
            .attributes
            .iter()
            .map(|attr| (attr.name.clone(), Value::Null))
            .collect();
        Self::with_record(
            schema,
            context_id,
            EntityRecord {
                id: Uuid::new_v4(),
                state: EntityState::Unsaved,
                values,
                committed: BTreeMap::new(),
                changed: BTreeSet::new(),
            },
        )
    }

    pub(crate) fn fetched(
        schema: Arc<EntitySchema>,
        context_id: ContextId,
        id: EntityId,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self::with_record(
            schema,
            context_id,
            EntityRecord {
                id,
                state: EntityState::Saved,
                committed: values.clone(),
                values,
                changed: BTreeSet::new(),
            },
        )
    }

    fn with_record(schema: Arc<EntitySchema>, context_id: ContextId, record: EntityRecord) -> Self {
        Self {
            schema,
            context_id,
            record: Arc::new(Mutex::new(record)),
        }
    }

    /// Whether another handle to this instance exists.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.record) > 1
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntityRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> EntityId {
        self.lock().id
    }

    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// Context this handle is registered in.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn state(&self) -> EntityState {
        self.lock().state
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == EntityState::Deleted
    }

    /// Whether the entity has unsaved inserts or attribute changes.
    pub fn has_changes(&self) -> bool {
        self.lock().is_dirty()
    }

    /// Returns the in-memory value, `None` for unknown attributes.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.schema.attribute(name)?;
        Some(self.lock().values.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Sets one attribute after type validation.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> SchemaResult<()> {
        let value = self.schema.check_value(name, value.into())?;
        let mut record = self.lock();
        if record.values.get(name) == Some(&value) {
            return Ok(());
        }
        record.values.insert(name.to_string(), value);
        if record.state == EntityState::Saved {
            record.changed.insert(name.to_string());
        }
        Ok(())
    }

    /// Snapshot of all attribute values.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        let record = self.lock();
        self.schema
            .attributes
            .iter()
            .map(|attr| {
                let value = record.values.get(&attr.name).cloned().unwrap_or(Value::Null);
                (attr.name.clone(), value)
            })
            .collect()
    }

    /// Whether both handles refer to the same in-memory instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let record = self.lock();
        f.debug_struct("Entity")
            .field("kind", &self.schema.kind)
            .field("id", &record.id)
            .field("state", &record.state)
            .field("context", &self.context_id)
            .field("values", &record.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Entity, EntityState};
    use crate::context::ContextId;
    use crate::model::schema::{AttributeDescriptor, AttributeType, EntitySchema};
    use crate::model::value::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn schema() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::new("Item")
                .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                .with_attribute(AttributeDescriptor::new("score", AttributeType::Integer)),
        )
    }

    #[test]
    fn inserted_entity_starts_unsaved_with_null_attributes() {
        let entity = Entity::inserted(schema(), ContextId(1));
        assert_eq!(entity.state(), EntityState::Unsaved);
        assert!(entity.has_changes());
        assert_eq!(entity.get("name"), Some(Value::Null));
        assert_eq!(entity.get("missing"), None);
    }

    #[test]
    fn setting_saved_entity_tracks_changed_attributes() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), Value::from("a"));
        values.insert("score".to_string(), Value::Integer(1));
        let entity = Entity::fetched(schema(), ContextId(1), Uuid::new_v4(), values);
        assert!(!entity.has_changes());

        entity.set("name", "a").unwrap();
        assert!(!entity.has_changes());

        entity.set("score", 2).unwrap();
        assert!(entity.has_changes());
        assert!(entity.lock().changed.contains("score"));
    }

    #[test]
    fn merge_keeps_local_changes_when_requested() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), Value::from("a"));
        values.insert("score".to_string(), Value::Integer(1));
        let entity = Entity::fetched(schema(), ContextId(1), Uuid::new_v4(), values);
        entity.set("name", "local").unwrap();

        let mut incoming = BTreeMap::new();
        incoming.insert("name".to_string(), Value::from("remote"));
        incoming.insert("score".to_string(), Value::Integer(9));
        entity.lock().merge_committed(&incoming, true);

        assert_eq!(entity.get("name"), Some(Value::from("local")));
        assert_eq!(entity.get("score"), Some(Value::Integer(9)));
        assert!(entity.has_changes());
    }

    #[test]
    fn clones_share_one_instance() {
        let entity = Entity::inserted(schema(), ContextId(1));
        let other = entity.clone();
        other.set("name", "shared").unwrap();
        assert!(entity.ptr_eq(&other));
        assert_eq!(entity.get("name"), Some(Value::from("shared")));
    }
}
