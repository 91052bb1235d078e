//! Persistent store: SQLite bootstrap, migrations and shared access.
//!
//! # Responsibility
//! - Own the single SQLite connection backing one model.
//! - Apply internal migrations and lightweight entity-table migration.
//! - Fan out saved change sets to contexts that merge automatically.
//!
//! # Invariants
//! - Internal migration version is tracked via `PRAGMA user_version`.
//! - Entity tables match the model before any context can use the store.
//! - All SQL runs under the connection mutex; the store is `Send + Sync`.

use crate::context::{ChangeSet, ContextId};
use crate::model::entity::EntityId;
use crate::model::schema::{EntitySchema, Model, SchemaError};
use crate::repo::entity_repo::EntityRepository;
use log::debug;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod manager;
pub mod migrations;
mod open;
mod schema_sync;
pub(crate) mod sql;

pub use manager::{load_model_bundle, StoreConfig, StoreManager, MODEL_BUNDLE_EXTENSION};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Schema(SchemaError),
    /// `store()` was called before `configure()`.
    NotConfigured,
    DataDirectoryUnavailable,
    ModelNotFound(PathBuf),
    InvalidModel {
        path: PathBuf,
        message: String,
    },
    ModelMismatch {
        expected: String,
        found: String,
    },
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// Existing column type cannot be mapped without a heavyweight migration.
    IncompatibleColumn {
        kind: String,
        column: String,
        declared: String,
        expected: &'static str,
    },
    /// Unique or other SQLite constraint rejected a write.
    Constraint(String),
    /// Update target no longer exists in the store.
    ObjectNotFound(EntityId),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::NotConfigured => write!(f, "store is not configured"),
            Self::DataDirectoryUnavailable => write!(f, "data directory cannot be resolved"),
            Self::ModelNotFound(path) => write!(f, "model bundle not found: {}", path.display()),
            Self::InvalidModel { path, message } => {
                write!(f, "invalid model bundle {}: {message}", path.display())
            }
            Self::ModelMismatch { expected, found } => {
                write!(f, "expected model `{expected}`, found `{found}`")
            }
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "store schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::IncompatibleColumn {
                kind,
                column,
                declared,
                expected,
            } => write!(
                f,
                "column `{kind}.{column}` is declared {declared}, model expects {expected}"
            ),
            Self::Constraint(message) => write!(f, "constraint violation: {message}"),
            Self::ObjectNotFound(id) => write!(f, "entity not found in store: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Schema(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &value {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return Self::Constraint(message.clone().unwrap_or_else(|| failure.to_string()));
            }
        }
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SchemaError> for StoreError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

struct Subscriber {
    context_id: ContextId,
    sender: Sender<ChangeSet>,
}

/// Shared handle to one opened store.
pub struct Store {
    model: Model,
    schemas: BTreeMap<String, Arc<EntitySchema>>,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    next_context_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Store {
    /// Opens (creating if absent) the store file at `path` for `model`.
    pub fn open(path: impl AsRef<Path>, model: Model) -> StoreResult<Arc<Self>> {
        model.validate()?;
        let path = path.as_ref().to_path_buf();
        let conn = open::open_store_file(&path, &model)?;
        Ok(Arc::new(Self::new(model, Some(path), conn)))
    }

    /// Opens a private in-memory store for `model`.
    pub fn open_in_memory(model: Model) -> StoreResult<Arc<Self>> {
        model.validate()?;
        let conn = open::open_store_in_memory(&model)?;
        Ok(Arc::new(Self::new(model, None, conn)))
    }

    fn new(model: Model, path: Option<PathBuf>, conn: Connection) -> Self {
        let schemas = model
            .entities
            .iter()
            .map(|entity| (entity.kind.clone(), Arc::new(entity.clone())))
            .collect();
        Self {
            model,
            schemas,
            path,
            conn: Mutex::new(conn),
            next_context_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema(&self, kind: &str) -> StoreResult<Arc<EntitySchema>> {
        self.schemas
            .get(kind)
            .cloned()
            .ok_or_else(|| StoreError::Schema(SchemaError::UnknownEntity(kind.to_string())))
    }

    /// Returns a repository bound to the `kind` descriptor of this model.
    pub fn repository(&self, kind: &str) -> StoreResult<EntityRepository> {
        Ok(EntityRepository::new(self.schema(kind)?))
    }

    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `context_id` for change sets saved by other contexts.
    pub(crate) fn subscribe(&self, context_id: ContextId) -> Receiver<ChangeSet> {
        let (sender, receiver) = mpsc::channel();
        self.lock_subscribers().push(Subscriber { context_id, sender });
        receiver
    }

    /// Sends `changes` to every subscriber except `origin`.
    ///
    /// Subscribers whose context was dropped are pruned.
    pub(crate) fn broadcast(&self, origin: ContextId, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|subscriber| {
            subscriber.context_id == origin || subscriber.sender.send(changes.clone()).is_ok()
        });
        debug!(
            "event=store_broadcast module=store status=ok origin={} subscribers={} inserted={} updated={} deleted={}",
            origin,
            subscribers.len(),
            changes.inserted.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("model", &self.model.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
