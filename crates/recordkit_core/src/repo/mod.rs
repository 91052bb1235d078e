//! Repository layer.
//!
//! # Responsibility
//! - Expose generic, schema-parameterized entity operations.
//! - Convert lower-level failures into `RepoError` and log them.

pub mod entity_repo;
