//! Fetch request options.

use crate::model::entity::EntityId;
use crate::model::schema::{EntitySchema, SchemaResult, ID_COLUMN};
use crate::model::value::Value;
use crate::query::predicate::Predicate;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Single-attribute sort key. `id` sorts by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn new(key: impl Into<String>, ascending: bool) -> Self {
        Self {
            key: key.into(),
            ascending,
        }
    }
}

/// Predicate, ordering and limit for one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub predicate: Predicate,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(predicate: Predicate) -> Self {
        Self {
            predicate,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, key: impl Into<String>, ascending: bool) -> Self {
        self.sort.push(SortDescriptor::new(key, ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resolves the predicate and checks sort keys against `schema`.
    pub fn resolve(&self, schema: &EntitySchema) -> SchemaResult<FetchRequest> {
        for descriptor in &self.sort {
            if descriptor.key != ID_COLUMN {
                schema.require_attribute(&descriptor.key)?;
            }
        }
        Ok(Self {
            predicate: self.predicate.resolve(schema)?,
            sort: self.sort.clone(),
            limit: self.limit,
        })
    }

    /// In-memory ordering equivalent to the SQL `ORDER BY` clause, with the
    /// identity as the final tie breaker.
    pub(crate) fn compare(
        &self,
        left: (EntityId, &BTreeMap<String, Value>),
        right: (EntityId, &BTreeMap<String, Value>),
    ) -> Ordering {
        for descriptor in &self.sort {
            let ordering = if descriptor.key == ID_COLUMN {
                left.0.cmp(&right.0)
            } else {
                let null = Value::Null;
                let a = left.1.get(&descriptor.key).unwrap_or(&null);
                let b = right.1.get(&descriptor.key).unwrap_or(&null);
                a.sql_cmp(b)
            };
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.0.cmp(&right.0)
    }
}

#[cfg(test)]
mod tests {
    use super::FetchRequest;
    use crate::model::schema::{AttributeDescriptor, AttributeType, EntitySchema, SchemaError};
    use crate::model::value::Value;
    use std::cmp::Ordering;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn resolve_rejects_unknown_sort_key_but_accepts_id() {
        let schema = EntitySchema::new("Item")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text));

        assert!(FetchRequest::new().sorted_by("id", true).resolve(&schema).is_ok());
        let err = FetchRequest::new()
            .sorted_by("missing", true)
            .resolve(&schema)
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownAttribute { .. }));
    }

    #[test]
    fn compare_applies_direction_and_nulls_first() {
        let request = FetchRequest::new().sorted_by("rank", false);
        let mut high = BTreeMap::new();
        high.insert("rank".to_string(), Value::Integer(5));
        let mut low = BTreeMap::new();
        low.insert("rank".to_string(), Value::Null);

        let ordering = request.compare((Uuid::new_v4(), &high), (Uuid::new_v4(), &low));
        assert_eq!(ordering, Ordering::Less);
    }
}
