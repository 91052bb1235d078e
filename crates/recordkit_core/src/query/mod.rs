//! Query building blocks shared by contexts and repositories.
//!
//! # Responsibility
//! - Describe which entities an operation targets (`Predicate`).
//! - Describe ordering and limits of a fetch (`FetchRequest`).
//!
//! # Invariants
//! - Queries are resolved against the entity schema before they reach SQL.

pub mod fetch;
pub mod predicate;
