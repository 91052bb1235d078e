//! Connection bootstrap utilities for the store.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure connection pragmas required by core behavior.
//! - Run internal migrations and entity-table migration before returning.
//!
//! # Invariants
//! - Returned connections have migrations fully applied.
//! - Returned connections have every model entity table in place.

use super::migrations::apply_migrations;
use super::schema_sync::sync_entity_tables;
use super::StoreResult;
use crate::model::schema::Model;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens the store file at `path`, creating it when absent.
///
/// # Side effects
/// - Creates the parent directory when missing.
/// - Emits `store_open` logging events with duration and status.
pub(crate) fn open_store_file(path: &Path, model: &Model) -> StoreResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=store_open module=store status=start mode=file model={}",
        model.name
    );

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!(
                "event=store_open module=store status=error mode=file duration_ms={} error_code=store_dir_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    }

    let conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=store_open module=store status=error mode=file duration_ms={} error_code=store_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_open(conn, model, "file", started_at)
}

/// Opens a private in-memory store.
///
/// # Side effects
/// - Emits `store_open` logging events with duration and status.
pub(crate) fn open_store_in_memory(model: &Model) -> StoreResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=store_open module=store status=start mode=memory model={}",
        model.name
    );

    let conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=store_open module=store status=error mode=memory duration_ms={} error_code=store_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_open(conn, model, "memory", started_at)
}

fn finish_open(
    mut conn: Connection,
    model: &Model,
    mode: &str,
    started_at: Instant,
) -> StoreResult<Connection> {
    match bootstrap_connection(&mut conn, model) {
        Ok(()) => {
            info!(
                "event=store_open module=store status=ok mode={} model={} entities={} duration_ms={}",
                mode,
                model.name,
                model.entities.len(),
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=store_open module=store status=error mode={} duration_ms={} error_code=store_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection, model: &Model) -> StoreResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)?;
    sync_entity_tables(conn, model)?;
    Ok(())
}
