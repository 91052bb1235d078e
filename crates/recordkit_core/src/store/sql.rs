//! SQL rendering and execution for entity tables.
//!
//! # Responsibility
//! - Compile resolved predicates and fetch requests into parameterized SQL.
//! - Map rows to attribute values and back.
//!
//! # Invariants
//! - Identifiers are validated by the schema before reaching this module and
//!   are always double-quoted.
//! - Literal values are always bound, never interpolated.

use crate::model::entity::EntityId;
use crate::model::schema::{AttributeType, EntitySchema, ID_COLUMN};
use crate::model::value::Value;
use crate::query::fetch::FetchRequest;
use crate::query::predicate::Predicate;
use crate::store::{StoreError, StoreResult};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attribute values of one stored row, keyed by attribute name.
pub(crate) type RowValues = BTreeMap<String, Value>;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => SqlValue::Null,
            Value::Integer(value) => SqlValue::Integer(*value),
            Value::Real(value) => SqlValue::Real(*value),
            Value::Text(value) => SqlValue::Text(value.clone()),
            Value::Bool(value) => SqlValue::Integer(i64::from(*value)),
            Value::Blob(value) => SqlValue::Blob(value.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Renders `predicate` as a SQL boolean expression, appending bind values.
pub(crate) fn compile_predicate(predicate: &Predicate, params: &mut Vec<Value>) -> String {
    match predicate {
        Predicate::True => "1".to_string(),
        Predicate::False => "0".to_string(),
        Predicate::IdEquals(id) => {
            params.push(Value::Text(id.to_string()));
            format!("{} = ?", quote_ident(ID_COLUMN))
        }
        Predicate::Compare {
            attribute,
            op,
            value,
        } => {
            params.push(value.clone());
            format!("{} {} ?", quote_ident(attribute), op.sql())
        }
        Predicate::Contains { attribute, needle } => {
            params.push(Value::Text(needle.clone()));
            format!("instr({}, ?) > 0", quote_ident(attribute))
        }
        Predicate::In { attribute, values } => {
            if values.is_empty() {
                return "0".to_string();
            }
            params.extend(values.iter().cloned());
            let placeholders = vec!["?"; values.len()].join(", ");
            format!("{} IN ({placeholders})", quote_ident(attribute))
        }
        Predicate::IsNull(attribute) => format!("{} IS NULL", quote_ident(attribute)),
        Predicate::And(parts) => join_parts(parts, " AND ", "1", params),
        Predicate::Or(parts) => join_parts(parts, " OR ", "0", params),
        Predicate::Not(inner) => format!("NOT ({})", compile_predicate(inner, params)),
    }
}

fn join_parts(
    parts: &[Predicate],
    separator: &str,
    empty: &str,
    params: &mut Vec<Value>,
) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts
        .iter()
        .map(|part| format!("({})", compile_predicate(part, params)))
        .collect();
    rendered.join(separator)
}

fn select_columns(schema: &EntitySchema) -> String {
    std::iter::once(ID_COLUMN)
        .chain(schema.attributes.iter().map(|attr| attr.name.as_str()))
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Selects rows matching a resolved request.
///
/// `apply_limit` is off when the caller merges pending in-memory entities
/// and applies the limit itself.
pub(crate) fn select_rows(
    conn: &Connection,
    schema: &EntitySchema,
    request: &FetchRequest,
    apply_limit: bool,
) -> StoreResult<Vec<(EntityId, RowValues)>> {
    let mut params = Vec::new();
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_columns(schema),
        quote_ident(&schema.kind),
        compile_predicate(&request.predicate, &mut params)
    );

    if !request.sort.is_empty() {
        let keys: Vec<String> = request
            .sort
            .iter()
            .map(|descriptor| {
                let direction = if descriptor.ascending { "ASC" } else { "DESC" };
                format!("{} {direction}", quote_ident(&descriptor.key))
            })
            .collect();
        sql.push_str(&format!(
            " ORDER BY {}, {} ASC",
            keys.join(", "),
            quote_ident(ID_COLUMN)
        ));
    }

    if apply_limit {
        if let Some(limit) = request.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(parse_row(row, schema)?);
    }
    Ok(result)
}

pub(crate) fn count_rows(
    conn: &Connection,
    schema: &EntitySchema,
    predicate: &Predicate,
) -> StoreResult<usize> {
    let mut params = Vec::new();
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        quote_ident(&schema.kind),
        compile_predicate(predicate, &mut params)
    );
    let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
    usize::try_from(count).map_err(|_| StoreError::InvalidData(format!("negative count {count}")))
}

pub(crate) fn insert_row(
    conn: &Connection,
    schema: &EntitySchema,
    id: EntityId,
    values: &RowValues,
) -> StoreResult<()> {
    let mut params = vec![Value::Text(id.to_string())];
    for attribute in &schema.attributes {
        params.push(values.get(&attribute.name).cloned().unwrap_or(Value::Null));
    }
    let placeholders = vec!["?"; params.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote_ident(&schema.kind),
        select_columns(schema)
    );
    conn.execute(&sql, params_from_iter(params.iter()))?;
    Ok(())
}

/// Updates the given attributes of one row; returns affected row count.
pub(crate) fn update_row(
    conn: &Connection,
    schema: &EntitySchema,
    id: EntityId,
    values: &RowValues,
) -> StoreResult<usize> {
    if values.is_empty() {
        return Ok(1);
    }
    let assignments: Vec<String> = values
        .keys()
        .map(|name| format!("{} = ?", quote_ident(name)))
        .collect();
    let mut params: Vec<Value> = values.values().cloned().collect();
    params.push(Value::Text(id.to_string()));
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(&schema.kind),
        assignments.join(", "),
        quote_ident(ID_COLUMN)
    );
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

/// Deletes every row matching `predicate` in one transaction and returns
/// the deleted identities.
pub(crate) fn delete_matching(
    conn: &mut Connection,
    schema: &EntitySchema,
    predicate: &Predicate,
) -> StoreResult<Vec<EntityId>> {
    let mut params = Vec::new();
    let condition = compile_predicate(predicate, &mut params);
    let table = quote_ident(&schema.kind);

    let tx = conn.transaction()?;
    let ids = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM {table} WHERE {condition}",
            quote_ident(ID_COLUMN)
        ))?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(parse_id(row)?);
        }
        ids
    };
    tx.execute(
        &format!("DELETE FROM {table} WHERE {condition}"),
        params_from_iter(params.iter()),
    )?;
    tx.commit()?;
    Ok(ids)
}

fn parse_id(row: &Row<'_>) -> StoreResult<EntityId> {
    let text: String = row.get(0)?;
    Uuid::parse_str(&text)
        .map_err(|_| StoreError::InvalidData(format!("invalid entity id `{text}`")))
}

fn parse_row(row: &Row<'_>, schema: &EntitySchema) -> StoreResult<(EntityId, RowValues)> {
    let id = parse_id(row)?;
    let mut values = RowValues::new();
    for (index, attribute) in schema.attributes.iter().enumerate() {
        let value = read_value(row, index + 1, attribute.kind).map_err(|err| match err {
            StoreError::InvalidData(message) => StoreError::InvalidData(format!(
                "{}.{}: {message}",
                schema.kind, attribute.name
            )),
            other => other,
        })?;
        values.insert(attribute.name.clone(), value);
    }
    Ok((id, values))
}

fn read_value(row: &Row<'_>, index: usize, kind: AttributeType) -> StoreResult<Value> {
    let raw: SqlValue = row.get(index)?;
    let value = match (kind, raw) {
        (_, SqlValue::Null) => Value::Null,
        (AttributeType::Integer, SqlValue::Integer(v)) => Value::Integer(v),
        (AttributeType::Real, SqlValue::Real(v)) => Value::Real(v),
        (AttributeType::Real, SqlValue::Integer(v)) => Value::Real(v as f64),
        (AttributeType::Text, SqlValue::Text(v)) => Value::Text(v),
        (AttributeType::Bool, SqlValue::Integer(0)) => Value::Bool(false),
        (AttributeType::Bool, SqlValue::Integer(1)) => Value::Bool(true),
        (AttributeType::Blob, SqlValue::Blob(v)) => Value::Blob(v),
        (kind, other) => {
            return Err(StoreError::InvalidData(format!(
                "expected {kind}, found {:?}",
                other.data_type()
            )));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::compile_predicate;
    use crate::model::value::Value;
    use crate::query::predicate::Predicate;

    #[test]
    fn compile_binds_values_in_order() {
        let predicate = Predicate::eq("name", "a")
            .and(Predicate::is_in("rank", [1, 2]))
            .or(!Predicate::is_null("score"));
        let mut params = Vec::new();
        let sql = compile_predicate(&predicate, &mut params);

        assert_eq!(
            sql,
            "((\"name\" = ?) AND (\"rank\" IN (?, ?))) OR (NOT (\"score\" IS NULL))"
        );
        assert_eq!(
            params,
            vec![Value::from("a"), Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn compile_renders_empty_groups_as_constants() {
        let mut params = Vec::new();
        assert_eq!(compile_predicate(&Predicate::And(vec![]), &mut params), "1");
        assert_eq!(compile_predicate(&Predicate::Or(vec![]), &mut params), "0");
        assert_eq!(
            compile_predicate(&Predicate::is_in("rank", Vec::<Value>::new()), &mut params),
            "0"
        );
        assert!(params.is_empty());
    }
}
