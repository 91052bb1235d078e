//! Generic entity repository.
//!
//! # Responsibility
//! - Provide find/count/create/delete operations for one entity kind.
//! - Run every operation against an explicitly supplied context.
//!
//! # Invariants
//! - Every operation distinguishes "empty"/"absent" from failure.
//! - Failures are logged before they are returned.
//! - `delete_all` reconciles the acting context and the main context.
//!
//! # See also
//! - `context::Context` for pending-change semantics.

use crate::context::{Context, ContextId};
use crate::model::entity::{Entity, EntityId};
use crate::model::schema::{EntitySchema, SchemaError};
use crate::model::value::Value;
use crate::query::fetch::FetchRequest;
use crate::query::predicate::Predicate;
use crate::store::{StoreError, StoreManager};
use log::{debug, error};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository-level failure.
#[derive(Debug)]
pub enum RepoError {
    Store(StoreError),
    Schema(SchemaError),
    /// No context could be resolved because the store is not open.
    NoContext,
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::NoContext => write!(f, "no context available; store is not open"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Schema(err) => Some(err),
            Self::NoContext => None,
        }
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Schema(err) => Self::Schema(err),
            other => Self::Store(other),
        }
    }
}

impl From<SchemaError> for RepoError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

/// Resolves the current context of the calling thread.
///
/// Fails with `NoContext` instead of opening the store.
pub fn current_context(manager: &StoreManager) -> RepoResult<Context> {
    manager.current_context().ok_or_else(|| {
        error!("event=repo_resolve_context module=repo status=error error_code=no_context");
        RepoError::NoContext
    })
}

/// Operations over one entity kind.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    schema: Arc<EntitySchema>,
}

impl EntityRepository {
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    /// Number of entities matching `predicate`, pending changes included.
    pub fn count(&self, predicate: &Predicate, ctx: &Context) -> RepoResult<usize> {
        self.logged("repo_count", ctx, || {
            Ok(ctx.count(&self.schema, predicate)?)
        })
    }

    pub fn find_first(&self, predicate: &Predicate, ctx: &Context) -> RepoResult<Option<Entity>> {
        let request = FetchRequest::matching(predicate.clone()).limit(1);
        self.logged("repo_find_first", ctx, || {
            Ok(ctx.fetch(&self.schema, &request)?.into_iter().next())
        })
    }

    /// First entity whose `attribute` equals `value`; `Value::Null` matches
    /// unset attributes.
    pub fn find_first_by(
        &self,
        attribute: &str,
        value: impl Into<Value>,
        ctx: &Context,
    ) -> RepoResult<Option<Entity>> {
        self.find_first(&equal_to(attribute, value.into()), ctx)
    }

    /// Looks up the entity with `id` in `ctx`; use it to carry an entity
    /// over from another context.
    pub fn find_by_id(&self, id: EntityId, ctx: &Context) -> RepoResult<Option<Entity>> {
        self.find_first(&Predicate::id_eq(id), ctx)
    }

    /// Returns the first entity with `attribute == value`, or a new unsaved
    /// entity with that attribute set.
    ///
    /// Pending inserts of `ctx` are visible to the lookup, so repeated calls
    /// before a save return the same instance. Calls on different contexts
    /// may both create an entity.
    pub fn find_first_or_create(
        &self,
        attribute: &str,
        value: impl Into<Value>,
        ctx: &Context,
    ) -> RepoResult<Entity> {
        let value = value.into();
        if let Some(found) = self.find_first_by(attribute, value.clone(), ctx)? {
            return Ok(found);
        }
        self.logged("repo_find_first_or_create", ctx, || {
            let entity = ctx.insert(&self.schema)?;
            entity.set(attribute, value)?;
            debug!(
                "event=repo_find_first_or_create module=repo status=created kind={} context={} id={}",
                self.kind(),
                ctx.id(),
                entity.id()
            );
            Ok(entity)
        })
    }

    pub fn find_all(&self, predicate: &Predicate, ctx: &Context) -> RepoResult<Vec<Entity>> {
        self.fetch(&FetchRequest::matching(predicate.clone()), ctx)
    }

    pub fn find_all_by(
        &self,
        attribute: &str,
        value: impl Into<Value>,
        ctx: &Context,
    ) -> RepoResult<Vec<Entity>> {
        self.find_all(&equal_to(attribute, value.into()), ctx)
    }

    /// All entities ordered by one attribute key (ties broken by id).
    pub fn find_all_sorted(
        &self,
        key: &str,
        ascending: bool,
        ctx: &Context,
    ) -> RepoResult<Vec<Entity>> {
        let request = FetchRequest::new().sorted_by(key, ascending);
        self.fetch(&request, ctx)
    }

    pub fn fetch(&self, request: &FetchRequest, ctx: &Context) -> RepoResult<Vec<Entity>> {
        self.logged("repo_fetch", ctx, || Ok(ctx.fetch(&self.schema, request)?))
    }

    /// Allocates a new unsaved entity in `ctx`.
    pub fn create(&self, ctx: &Context) -> RepoResult<Entity> {
        self.logged("repo_create", ctx, || Ok(ctx.insert(&self.schema)?))
    }

    /// Deletes every stored entity matching `predicate` without loading it.
    ///
    /// Loaded copies in `ctx` and in the main context are marked deleted.
    /// Returns the number of deleted rows.
    pub fn delete_all(&self, predicate: &Predicate, ctx: &Context) -> RepoResult<usize> {
        self.logged("repo_delete_all", ctx, || {
            Ok(ctx.batch_delete(&self.schema, predicate)?.len())
        })
    }

    fn logged<T>(
        &self,
        event: &str,
        ctx: &Context,
        op: impl FnOnce() -> RepoResult<T>,
    ) -> RepoResult<T> {
        let started_at = Instant::now();
        let result = op();
        if let Err(err) = &result {
            log_failure(event, self.kind(), ctx.id(), started_at, err);
        }
        result
    }
}

/// Equality lookup where NULL matches NULL, unlike SQL `=`.
fn equal_to(attribute: &str, value: Value) -> Predicate {
    if value.is_null() {
        Predicate::is_null(attribute)
    } else {
        Predicate::eq(attribute, value)
    }
}

fn log_failure(event: &str, kind: &str, context: ContextId, started_at: Instant, err: &RepoError) {
    error!(
        "event={} module=repo status=error kind={} context={} duration_ms={} error={}",
        event,
        kind,
        context,
        started_at.elapsed().as_millis(),
        err
    );
}

#[cfg(test)]
mod tests {
    use super::{current_context, EntityRepository, RepoError};
    use crate::context::ContextRegistry;
    use crate::model::schema::{AttributeDescriptor, AttributeType, EntitySchema, Model, SchemaError};
    use crate::query::predicate::Predicate;
    use crate::store::{Store, StoreManager};

    fn registry() -> ContextRegistry {
        let model = Model::new("Model").with_entity(
            EntitySchema::new("Item")
                .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                .with_attribute(AttributeDescriptor::new("rank", AttributeType::Integer)),
        );
        ContextRegistry::new(Store::open_in_memory(model).unwrap())
    }

    fn items(registry: &ContextRegistry) -> EntityRepository {
        registry.store().repository("Item").unwrap()
    }

    #[test]
    fn find_first_or_create_reuses_pending_insert() {
        let registry = registry();
        let repo = items(&registry);
        let ctx = registry.main_context();

        let first = repo.find_first_or_create("name", "x", &ctx).unwrap();
        let second = repo.find_first_or_create("name", "x", &ctx).unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(repo.count(&Predicate::True, &ctx).unwrap(), 1);
    }

    #[test]
    fn unknown_attribute_is_reported_as_schema_error() {
        let registry = registry();
        let repo = items(&registry);
        let ctx = registry.main_context();

        let err = repo
            .find_first(&Predicate::eq("missing", 1), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Schema(SchemaError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn type_mismatch_on_create_lookup_is_an_error_not_absent() {
        let registry = registry();
        let repo = items(&registry);
        let ctx = registry.main_context();

        let err = repo
            .find_first_or_create("rank", "not a number", &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Schema(SchemaError::TypeMismatch { .. })
        ));
        assert!(!ctx.has_changes());
    }

    #[test]
    fn current_context_requires_open_store() {
        let manager = StoreManager::new();
        assert!(matches!(
            current_context(&manager),
            Err(RepoError::NoContext)
        ));
    }
}
