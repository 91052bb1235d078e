//! Schema-driven entity persistence over SQLite.
//! Stores, contexts and generic repositories; no global state.

pub mod context;
pub mod logging;
pub mod model;
pub mod query;
pub mod repo;
pub mod store;

pub use context::{
    ChangeSet, Context, ContextGuard, ContextId, ContextRegistry, ContextRole, MergePolicy,
    UpdatedEntity,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Entity, EntityId, EntityState};
pub use model::schema::{
    AttributeDescriptor, AttributeType, EntitySchema, Model, SchemaError, SchemaResult,
};
pub use model::value::Value;
pub use query::fetch::{FetchRequest, SortDescriptor};
pub use query::predicate::{CompareOp, Predicate};
pub use repo::entity_repo::{current_context, EntityRepository, RepoError, RepoResult};
pub use store::{
    load_model_bundle, Store, StoreConfig, StoreError, StoreManager, StoreResult,
    MODEL_BUNDLE_EXTENSION,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
