//! Configure-once store bootstrap.
//!
//! # Responsibility
//! - Hold the store configuration (model name, store file name, locations).
//! - Open the store lazily on first access, exactly once.
//! - Expose main/current context resolution without opening the store.
//! - Destroy the backing store file on request.
//!
//! # Invariants
//! - `configure` after the store is open has no effect on the open store.
//! - Context lookups never trigger store construction.
//! - Open failures are returned to the caller; nothing here aborts.

use crate::context::{Context, ContextRegistry, MergePolicy};
use crate::model::schema::Model;
use crate::store::{Store, StoreError, StoreResult};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// File extension of a model bundle: `<model_name>.model.json`.
pub const MODEL_BUNDLE_EXTENSION: &str = "model.json";

const DEFAULT_RESOURCE_DIR_NAME: &str = "resources";
const STORE_FILE_SUFFIXES: &[&str] = &["", "-wal", "-shm", "-journal"];

/// Store bootstrap parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub model_name: String,
    pub store_file_name: String,
    /// Overrides the platform documents directory.
    pub data_dir: Option<PathBuf>,
    /// Overrides `<executable dir>/resources` as model bundle location.
    pub resource_dir: Option<PathBuf>,
    /// Inline model used instead of loading a bundle.
    pub model: Option<Model>,
    /// Merge policy of the main context.
    pub merge_policy: MergePolicy,
}

impl StoreConfig {
    pub fn new(model_name: impl Into<String>, store_file_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            store_file_name: store_file_name.into(),
            data_dir: None,
            resource_dir: None,
            model: None,
            merge_policy: MergePolicy::default(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_resource_dir(mut self, resource_dir: impl Into<PathBuf>) -> Self {
        self.resource_dir = Some(resource_dir.into());
        self
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    /// `<data_dir>/<store_file_name>`.
    pub fn store_path(&self) -> StoreResult<PathBuf> {
        let data_dir = self
            .data_dir
            .clone()
            .or_else(dirs::document_dir)
            .ok_or(StoreError::DataDirectoryUnavailable)?;
        Ok(data_dir.join(&self.store_file_name))
    }

    /// `<resource_dir>/<model_name>.model.json`.
    pub fn model_bundle_path(&self) -> StoreResult<PathBuf> {
        let resource_dir = match &self.resource_dir {
            Some(dir) => dir.clone(),
            None => {
                let exe = std::env::current_exe()?;
                exe.parent()
                    .map(|dir| dir.join(DEFAULT_RESOURCE_DIR_NAME))
                    .ok_or(StoreError::DataDirectoryUnavailable)?
            }
        };
        Ok(resource_dir.join(format!("{}.{MODEL_BUNDLE_EXTENSION}", self.model_name)))
    }

    fn resolve_model(&self) -> StoreResult<Model> {
        let model = match &self.model {
            Some(model) => model.clone(),
            None => load_model_bundle(&self.model_bundle_path()?)?,
        };
        if model.name != self.model_name {
            return Err(StoreError::ModelMismatch {
                expected: self.model_name.clone(),
                found: model.name,
            });
        }
        Ok(model)
    }
}

/// Reads and validates a JSON model bundle.
pub fn load_model_bundle(path: &Path) -> StoreResult<Model> {
    if !path.is_file() {
        return Err(StoreError::ModelNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let model: Model = serde_json::from_str(&text).map_err(|err| StoreError::InvalidModel {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    model.validate()?;
    Ok(model)
}

struct Configuration {
    config: StoreConfig,
    primary_thread: ThreadId,
}

/// Lazily opened store plus its context registry.
///
/// Construct one per application at startup and pass it (or the store and
/// registry it yields) to the code that needs persistence.
#[derive(Default)]
pub struct StoreManager {
    configuration: Mutex<Option<Configuration>>,
    opened: OnceCell<ContextRegistry>,
}

impl StoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store configuration and records the calling thread as the
    /// primary thread.
    ///
    /// Ignored (with a warning) once the store is open.
    pub fn configure(&self, config: StoreConfig) {
        if self.opened.get().is_some() {
            warn!(
                "event=store_configure module=store status=ignored reason=already_open model={}",
                config.model_name
            );
            return;
        }
        info!(
            "event=store_configure module=store status=ok model={} store_file={}",
            config.model_name, config.store_file_name
        );
        *self.lock_configuration() = Some(Configuration {
            config,
            primary_thread: thread::current().id(),
        });
    }

    pub fn is_open(&self) -> bool {
        self.opened.get().is_some()
    }

    /// Returns the store, opening it on first call.
    pub fn store(&self) -> StoreResult<Arc<Store>> {
        Ok(Arc::clone(self.open_registry()?.store()))
    }

    /// Returns the registry, opening the store on first call.
    pub fn open_registry(&self) -> StoreResult<&ContextRegistry> {
        self.opened.get_or_try_init(|| self.open_now())
    }

    /// Registry of an already opened store.
    pub fn registry(&self) -> Option<&ContextRegistry> {
        self.opened.get()
    }

    /// Main context, `None` until the store is opened.
    pub fn main_context(&self) -> Option<Context> {
        self.registry().map(ContextRegistry::main_context)
    }

    /// Current context for the calling thread, `None` until the store is
    /// opened.
    pub fn current_context(&self) -> Option<Context> {
        self.registry().map(ContextRegistry::current_context)
    }

    /// Deletes the backing store file and its SQLite side files.
    ///
    /// Best-effort: failures are logged, never returned. An already open
    /// store handle is left in place and must not be used afterwards.
    pub fn destroy(&self) {
        let path = {
            let configuration = self.lock_configuration();
            let Some(configuration) = configuration.as_ref() else {
                warn!("event=store_destroy module=store status=skipped reason=not_configured");
                return;
            };
            match configuration.config.store_path() {
                Ok(path) => path,
                Err(err) => {
                    warn!(
                        "event=store_destroy module=store status=skipped reason=no_path error={}",
                        err
                    );
                    return;
                }
            }
        };

        for suffix in STORE_FILE_SUFFIXES {
            let mut target = path.clone().into_os_string();
            target.push(suffix);
            let target = PathBuf::from(target);
            match std::fs::remove_file(&target) {
                Ok(()) => info!(
                    "event=store_destroy module=store status=ok path={}",
                    target.display()
                ),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "event=store_destroy module=store status=error path={} error={}",
                    target.display(),
                    err
                ),
            }
        }
    }

    fn open_now(&self) -> StoreResult<ContextRegistry> {
        let (config, primary_thread) = {
            let configuration = self.lock_configuration();
            match configuration.as_ref() {
                Some(configuration) => (configuration.config.clone(), configuration.primary_thread),
                None => {
                    error!("event=store_bootstrap module=store status=error error_code=not_configured");
                    return Err(StoreError::NotConfigured);
                }
            }
        };

        let opened = config
            .store_path()
            .and_then(|path| Ok((path, config.resolve_model()?)))
            .and_then(|(path, model)| Store::open(&path, model));
        let store = match opened {
            Ok(store) => store,
            Err(err) => {
                error!(
                    "event=store_bootstrap module=store status=error model={} error={}",
                    config.model_name, err
                );
                return Err(err);
            }
        };

        let registry = ContextRegistry::with_primary_thread(store, primary_thread);
        registry.main_context().set_merge_policy(config.merge_policy);
        info!(
            "event=store_bootstrap module=store status=ok model={} merge_policy={:?}",
            config.model_name, config.merge_policy
        );
        Ok(registry)
    }

    fn lock_configuration(&self) -> MutexGuard<'_, Option<Configuration>> {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
