//! Entity schema descriptors.
//!
//! # Responsibility
//! - Describe entity kinds and their typed attributes.
//! - Validate identifiers and coerce values against attribute types.
//!
//! # Invariants
//! - Kind and attribute names match `^[A-Za-z_][A-Za-z0-9_]*$`.
//! - `id` is reserved for the identity column.
//! - Kind names are unique per model, attribute names unique per kind.

use crate::model::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Column name of the identity attribute in every entity table.
pub const ID_COLUMN: &str = "id";

/// Table name prefixes owned by the store itself.
const RESERVED_KIND_PREFIXES: &[&str] = &["rk_", "sqlite_"];

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Schema declaration and value validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    InvalidIdentifier(String),
    ReservedAttribute {
        kind: String,
        attribute: String,
    },
    DuplicateEntity(String),
    DuplicateAttribute {
        kind: String,
        attribute: String,
    },
    UnknownEntity(String),
    UnknownAttribute {
        kind: String,
        attribute: String,
    },
    TypeMismatch {
        kind: String,
        attribute: String,
        expected: AttributeType,
        found: &'static str,
    },
    MissingRequired {
        kind: String,
        attribute: String,
    },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier(name) => write!(f, "invalid identifier `{name}`"),
            Self::ReservedAttribute { kind, attribute } => {
                write!(f, "attribute `{attribute}` on `{kind}` uses a reserved name")
            }
            Self::DuplicateEntity(kind) => write!(f, "entity kind `{kind}` declared twice"),
            Self::DuplicateAttribute { kind, attribute } => {
                write!(f, "attribute `{attribute}` declared twice on `{kind}`")
            }
            Self::UnknownEntity(kind) => write!(f, "unknown entity kind `{kind}`"),
            Self::UnknownAttribute { kind, attribute } => {
                write!(f, "unknown attribute `{attribute}` on `{kind}`")
            }
            Self::TypeMismatch {
                kind,
                attribute,
                expected,
                found,
            } => write!(
                f,
                "attribute `{kind}.{attribute}` expects {expected}, got {found}"
            ),
            Self::MissingRequired { kind, attribute } => {
                write!(f, "required attribute `{kind}.{attribute}` is not set")
            }
        }
    }
}

impl Error for SchemaError {}

/// Storage type of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Integer,
    Real,
    Text,
    Bool,
    Blob,
}

impl AttributeType {
    /// Declared SQLite column type.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Bool => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }

    /// Converts `value` into this type's canonical form.
    ///
    /// Returns `None` when the value cannot be stored in this attribute.
    /// NULL is always accepted here; optionality is checked on save.
    /// Non-finite reals are rejected since SQLite stores NaN as NULL.
    pub fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Null) => Some(Value::Null),
            (Self::Integer, Value::Integer(v)) => Some(Value::Integer(v)),
            (Self::Real, Value::Real(v)) if v.is_finite() => Some(Value::Real(v)),
            (Self::Real, Value::Integer(v)) => Some(Value::Real(v as f64)),
            (Self::Text, Value::Text(v)) => Some(Value::Text(v)),
            (Self::Bool, Value::Bool(v)) => Some(Value::Bool(v)),
            (Self::Bool, Value::Integer(0)) => Some(Value::Bool(false)),
            (Self::Bool, Value::Integer(1)) => Some(Value::Bool(true)),
            (Self::Blob, Value::Blob(v)) => Some(Value::Blob(v)),
            _ => None,
        }
    }
}

impl Display for AttributeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Blob => "blob",
        };
        f.write_str(name)
    }
}

fn default_optional() -> bool {
    true
}

/// One typed attribute of an entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    /// NULL allowed. Defaults to `true`.
    #[serde(default = "default_optional")]
    pub optional: bool,
    /// Backed by a unique index in the store.
    #[serde(default)]
    pub unique: bool,
}

impl AttributeDescriptor {
    /// Creates an optional, non-unique attribute.
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
            unique: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Schema descriptor for one entity kind.
///
/// Repositories are bound to one descriptor instead of deriving the kind
/// name from a Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
}

impl EntitySchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    /// Returns the attribute descriptor or `UnknownAttribute`.
    pub fn require_attribute(&self, name: &str) -> SchemaResult<&AttributeDescriptor> {
        self.attribute(name)
            .ok_or_else(|| SchemaError::UnknownAttribute {
                kind: self.kind.clone(),
                attribute: name.to_string(),
            })
    }

    /// Coerces `value` for attribute `name`, rejecting unknown names and
    /// incompatible types.
    pub fn check_value(&self, name: &str, value: Value) -> SchemaResult<Value> {
        let attribute = self.require_attribute(name)?;
        let found = value.type_name();
        attribute
            .kind
            .coerce(value)
            .ok_or_else(|| SchemaError::TypeMismatch {
                kind: self.kind.clone(),
                attribute: name.to_string(),
                expected: attribute.kind,
                found,
            })
    }

    /// Rejects values that leave a non-optional attribute NULL.
    pub fn check_required(&self, values: &BTreeMap<String, Value>) -> SchemaResult<()> {
        for attribute in self.attributes.iter().filter(|attr| !attr.optional) {
            let missing = values.get(&attribute.name).map_or(true, Value::is_null);
            if missing {
                return Err(SchemaError::MissingRequired {
                    kind: self.kind.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> SchemaResult<()> {
        let lowered = self.kind.to_ascii_lowercase();
        if !is_valid_identifier(&self.kind)
            || RESERVED_KIND_PREFIXES
                .iter()
                .any(|prefix| lowered.starts_with(prefix))
        {
            return Err(SchemaError::InvalidIdentifier(self.kind.clone()));
        }

        let mut seen = BTreeSet::new();
        for attribute in &self.attributes {
            if !is_valid_identifier(&attribute.name) {
                return Err(SchemaError::InvalidIdentifier(attribute.name.clone()));
            }
            if attribute.name.eq_ignore_ascii_case(ID_COLUMN) {
                return Err(SchemaError::ReservedAttribute {
                    kind: self.kind.clone(),
                    attribute: attribute.name.clone(),
                });
            }
            if !seen.insert(attribute.name.to_ascii_lowercase()) {
                return Err(SchemaError::DuplicateAttribute {
                    kind: self.kind.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Named set of entity schemas backing one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntitySchema>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity(&self, kind: &str) -> Option<&EntitySchema> {
        self.entities.iter().find(|entity| entity.kind == kind)
    }

    /// Validates every entity and rejects duplicate kinds.
    ///
    /// Kind names are compared case-insensitively since SQLite table names
    /// are.
    pub fn validate(&self) -> SchemaResult<()> {
        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !seen.insert(entity.kind.to_ascii_lowercase()) {
                return Err(SchemaError::DuplicateEntity(entity.kind.clone()));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}
