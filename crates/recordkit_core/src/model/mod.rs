//! Schema-backed entity model.
//!
//! # Responsibility
//! - Define schema descriptors, attribute values and entity handles.
//! - Keep type coercion rules in one place for entities, predicates and SQL.
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId`.
//! - Every attribute value stored on an entity has passed schema coercion.

pub mod entity;
pub mod schema;
pub mod value;
