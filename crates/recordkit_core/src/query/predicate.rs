//! Declarative filter predicates.
//!
//! # Responsibility
//! - Express composable conditions over entity attributes.
//! - Resolve predicates against a schema before execution.
//! - Evaluate predicates in memory for pending (unsaved or dirty) entities.
//!
//! # Invariants
//! - In-memory evaluation follows SQL three-valued logic, so an entity
//!   matches in memory exactly when its stored row would match in SQL.
//! - Resolved predicates only carry values coerced to the attribute type.

use crate::model::entity::EntityId;
use crate::model::schema::{AttributeType, EntitySchema, SchemaError, SchemaResult};
use crate::model::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Not;

/// Binary comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// Filter condition used uniformly by fetch, count and batch delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Predicate {
    #[default]
    True,
    False,
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    /// Case-sensitive substring match on a text attribute.
    Contains {
        attribute: String,
        needle: String,
    },
    In {
        attribute: String,
        values: Vec<Value>,
    },
    IsNull(String),
    IdEquals(EntityId),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(attribute: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ne, value)
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Lt, value)
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Le, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Gt, value)
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ge, value)
    }

    pub fn contains(attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            attribute: attribute.into(),
            needle: needle.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Self::IsNull(attribute.into())
    }

    pub fn id_eq(id: EntityId) -> Self {
        Self::IdEquals(id)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            this => Self::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            this => Self::Or(vec![this, other]),
        }
    }

    /// Validates attribute names against `schema` and coerces literal values.
    pub fn resolve(&self, schema: &EntitySchema) -> SchemaResult<Predicate> {
        let resolved = match self {
            Self::True => Self::True,
            Self::False => Self::False,
            Self::IdEquals(id) => Self::IdEquals(*id),
            Self::Compare {
                attribute,
                op,
                value,
            } => Self::Compare {
                attribute: attribute.clone(),
                op: *op,
                value: schema.check_value(attribute, value.clone())?,
            },
            Self::Contains { attribute, needle } => {
                let descriptor = schema.require_attribute(attribute)?;
                if descriptor.kind != AttributeType::Text {
                    return Err(SchemaError::TypeMismatch {
                        kind: schema.kind.clone(),
                        attribute: attribute.clone(),
                        expected: descriptor.kind,
                        found: "text",
                    });
                }
                Self::Contains {
                    attribute: attribute.clone(),
                    needle: needle.clone(),
                }
            }
            Self::In { attribute, values } => Self::In {
                attribute: attribute.clone(),
                values: values
                    .iter()
                    .map(|value| schema.check_value(attribute, value.clone()))
                    .collect::<SchemaResult<Vec<_>>>()?,
            },
            Self::IsNull(attribute) => {
                schema.require_attribute(attribute)?;
                Self::IsNull(attribute.clone())
            }
            Self::And(parts) => Self::And(resolve_all(parts, schema)?),
            Self::Or(parts) => Self::Or(resolve_all(parts, schema)?),
            Self::Not(inner) => Self::Not(Box::new(inner.resolve(schema)?)),
        };
        Ok(resolved)
    }

    /// Three-valued evaluation: `None` is SQL UNKNOWN.
    pub(crate) fn evaluate(&self, id: EntityId, values: &BTreeMap<String, Value>) -> Option<bool> {
        let value_of = |name: &str| values.get(name).cloned().unwrap_or(Value::Null);
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::IdEquals(expected) => Some(*expected == id),
            Self::Compare {
                attribute,
                op,
                value,
            } => value_of(attribute)
                .compare(value)
                .map(|ordering| op.holds(ordering)),
            Self::Contains { attribute, needle } => match value_of(attribute) {
                Value::Text(text) => Some(text.contains(needle.as_str())),
                _ => None,
            },
            Self::In { attribute, values } => {
                if values.is_empty() {
                    return Some(false);
                }
                let current = value_of(attribute);
                let mut unknown = false;
                for candidate in values {
                    match current.compare(candidate) {
                        Some(Ordering::Equal) => return Some(true),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Self::IsNull(attribute) => Some(value_of(attribute).is_null()),
            Self::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match part.evaluate(id, values) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Self::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match part.evaluate(id, values) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Self::Not(inner) => inner.evaluate(id, values).map(|value| !value),
        }
    }

    pub(crate) fn matches(&self, id: EntityId, values: &BTreeMap<String, Value>) -> bool {
        self.evaluate(id, values) == Some(true)
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

fn resolve_all(parts: &[Predicate], schema: &EntitySchema) -> SchemaResult<Vec<Predicate>> {
    parts.iter().map(|part| part.resolve(schema)).collect()
}
