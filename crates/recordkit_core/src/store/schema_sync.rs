//! Lightweight migration of entity tables.
//!
//! # Responsibility
//! - Create missing entity tables and add missing attribute columns.
//! - Maintain unique indexes for `unique` attributes.
//! - Bind the store file to one model name.
//!
//! # Invariants
//! - Columns are never dropped or retyped; a declared type that differs from
//!   the model is an error.
//! - Added columns are nullable; required attributes are enforced on save.
//! - Unique indexes exist exactly for attributes currently marked `unique`.
//! - Tables of kinds dropped from the model are kept, never deleted.

use crate::model::schema::{EntitySchema, Model, ID_COLUMN};
use crate::store::sql::quote_ident;
use crate::store::{StoreError, StoreResult};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};

const UNIQUE_INDEX_PREFIX: &str = "rk_unique_";

pub(crate) fn sync_entity_tables(conn: &mut Connection, model: &Model) -> StoreResult<()> {
    let tx = conn.transaction()?;
    check_model_name(&tx, model)?;
    for entity in &model.entities {
        sync_entity(&tx, entity)?;
    }
    report_stale_kinds(&tx, model)?;
    tx.execute(
        "INSERT INTO rk_metadata (key, value) VALUES ('model_name', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        [model.name.as_str()],
    )?;
    tx.commit()?;
    Ok(())
}

fn sync_entity(tx: &Transaction<'_>, entity: &EntitySchema) -> StoreResult<()> {
    let existing = table_columns(tx, &entity.kind)?;
    let table = quote_ident(&entity.kind);

    if existing.is_empty() {
        let mut columns = vec![format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(ID_COLUMN))];
        columns.extend(entity.attributes.iter().map(|attr| {
            format!("{} {}", quote_ident(&attr.name), attr.kind.sql_type())
        }));
        tx.execute_batch(&format!("CREATE TABLE {table} ({});", columns.join(", ")))?;
        info!(
            "event=store_migrate module=store status=ok kind={} action=create_table columns={}",
            entity.kind,
            entity.attributes.len()
        );
    } else {
        for attribute in &entity.attributes {
            match existing.get(&attribute.name.to_ascii_lowercase()) {
                Some(declared) if !declared.eq_ignore_ascii_case(attribute.kind.sql_type()) => {
                    return Err(StoreError::IncompatibleColumn {
                        kind: entity.kind.clone(),
                        column: attribute.name.clone(),
                        declared: declared.clone(),
                        expected: attribute.kind.sql_type(),
                    });
                }
                Some(_) => {}
                None => {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {table} ADD COLUMN {} {};",
                        quote_ident(&attribute.name),
                        attribute.kind.sql_type()
                    ))?;
                    info!(
                        "event=store_migrate module=store status=ok kind={} action=add_column column={}",
                        entity.kind, attribute.name
                    );
                }
            }
        }
    }

    sync_unique_indexes(tx, entity)?;

    tx.execute(
        "INSERT INTO rk_entity_kinds (kind, attribute_count) VALUES (?1, ?2)
         ON CONFLICT(kind) DO UPDATE SET
            attribute_count = excluded.attribute_count,
            updated_at = (strftime('%s', 'now') * 1000);",
        params![entity.kind, entity.attributes.len() as i64],
    )?;
    Ok(())
}

/// Rejects a store file written for a different model.
fn check_model_name(tx: &Transaction<'_>, model: &Model) -> StoreResult<()> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT value FROM rk_metadata WHERE key = 'model_name';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        Some(found) if found != model.name => Err(StoreError::ModelMismatch {
            expected: model.name.clone(),
            found,
        }),
        _ => Ok(()),
    }
}

/// Logs kinds recorded by an earlier open that the model no longer declares.
fn report_stale_kinds(tx: &Transaction<'_>, model: &Model) -> StoreResult<()> {
    let mut stmt = tx.prepare("SELECT kind FROM rk_entity_kinds ORDER BY kind;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let kind: String = row.get(0)?;
        if model.entity(&kind).is_none() {
            warn!(
                "event=store_migrate module=store status=stale kind={} action=keep_table",
                kind
            );
        }
    }
    Ok(())
}

fn unique_index_name(kind: &str, attribute: &str) -> String {
    format!("{UNIQUE_INDEX_PREFIX}{kind}_{attribute}")
}

/// Creates indexes for `unique` attributes and drops ours that no longer
/// correspond to one.
fn sync_unique_indexes(tx: &Transaction<'_>, entity: &EntitySchema) -> StoreResult<()> {
    let table = quote_ident(&entity.kind);
    let wanted: BTreeSet<String> = entity
        .attributes
        .iter()
        .filter(|attr| attr.unique)
        .map(|attr| unique_index_name(&entity.kind, &attr.name))
        .collect();

    let own_prefix = format!("{UNIQUE_INDEX_PREFIX}{}_", entity.kind);
    let existing: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1;",
        )?;
        let names = stmt.query_map([entity.kind.as_str()], |row| row.get::<_, String>(0))?;
        names
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|name| name.starts_with(&own_prefix))
            .collect()
    };

    for stale in existing.iter().filter(|name| !wanted.contains(*name)) {
        tx.execute_batch(&format!("DROP INDEX IF EXISTS {};", quote_ident(stale)))?;
        info!(
            "event=store_migrate module=store status=ok kind={} action=drop_index index={}",
            entity.kind, stale
        );
    }

    for attribute in entity.attributes.iter().filter(|attr| attr.unique) {
        let index = unique_index_name(&entity.kind, &attribute.name);
        if existing.contains(&index) {
            continue;
        }
        tx.execute_batch(&format!(
            "CREATE UNIQUE INDEX {} ON {table} ({});",
            quote_ident(&index),
            quote_ident(&attribute.name)
        ))?;
        info!(
            "event=store_migrate module=store status=ok kind={} action=create_index index={}",
            entity.kind, index
        );
    }
    Ok(())
}

/// Column name (lowercased) to declared type; empty when the table is absent.
fn table_columns(tx: &Transaction<'_>, table: &str) -> StoreResult<BTreeMap<String, String>> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({});", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    let mut columns = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        let declared: String = row.get("type")?;
        columns.insert(name.to_ascii_lowercase(), declared);
    }
    Ok(columns)
}
