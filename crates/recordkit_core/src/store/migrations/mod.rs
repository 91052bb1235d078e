//! Bookkeeping tables owned by the store itself.
//!
//! # Responsibility
//! - Create and upgrade `rk_metadata` and `rk_entity_kinds`.
//!
//! # Invariants
//! - Steps are listed in ascending version order.
//! - `PRAGMA user_version` equals the last applied step.
//! - Entity tables belong to `schema_sync`, never to a step here.

use crate::store::{StoreError, StoreResult};
use log::info;
use rusqlite::Connection;

/// One upgrade of the bookkeeping schema.
struct Step {
    version: u32,
    label: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[Step {
    version: 1,
    label: "bookkeeping_tables",
    sql: include_str!("0001_init.sql"),
}];

/// Bookkeeping version this build writes.
pub fn latest_version() -> u32 {
    STEPS.iter().map(|step| step.version).max().unwrap_or(0)
}

/// Brings the bookkeeping tables up to [`latest_version`].
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file was written by a newer build.
pub fn apply_migrations(conn: &mut Connection) -> StoreResult<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let latest = latest_version();
    if found > latest {
        return Err(StoreError::UnsupportedSchemaVersion {
            db_version: found,
            latest_supported: latest,
        });
    }

    let pending: Vec<&Step> = STEPS.iter().filter(|step| step.version > found).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
    }
    tx.commit()?;

    for step in pending {
        info!(
            "event=store_migrate module=store status=ok version={} step={}",
            step.version, step.label
        );
    }
    Ok(())
}
