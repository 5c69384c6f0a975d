// Runtime Plugin Loader
//
// Per-process registry of currently loadable plugins. Every action
// re-runs the manifest validator against the on-disk state - the
// registry never trusts stale validation. Operations on the same
// installed-plugin identity are serialized; distinct identities proceed
// in parallel.

pub mod keyed_mutex;

pub use keyed_mutex::KeyedMutex;

use crate::manifest::{ManifestError, ManifestValidator, PluginManifest};
use plughost_core::{
    InstalledPlugin, LoadStatusReporter, LoadStatusUpdate, PluginKind, PluginStatus, PluginStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("installed plugin {0} not found")]
    NotFound(Uuid),

    #[error("plugin kind '{0}' is not loadable; only tool plugins execute")]
    UnsupportedKind(PluginKind),

    #[error("install directory missing at {0}")]
    MissingInstallDir(PathBuf),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// A plugin resident in the registry: validated manifest plus the
/// resolved tool entry. Lost on restart; rebuilt via `bootstrap`.
#[derive(Debug, Clone)]
pub struct LoadedRuntimePlugin {
    pub installed_plugin_id: Uuid,
    pub workspace_id: String,
    pub plugin_id: String,
    pub plugin_name: String,
    pub version: Option<String>,
    pub install_path: PathBuf,
    pub manifest: PluginManifest,
    pub tool_entry: PathBuf,
    pub export_name: String,
}

/// What a loader action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    AlreadyLoaded,
    Reloaded,
    Unloaded,
    NotLoaded,
}

impl LoadOutcome {
    fn message(&self) -> &'static str {
        match self {
            Self::Loaded => "plugin loaded",
            Self::AlreadyLoaded => "already loaded",
            Self::Reloaded => "plugin reloaded",
            Self::Unloaded => "plugin unloaded",
            Self::NotLoaded => "not loaded",
        }
    }
}

/// Aggregated result of a bootstrap pass. Per-item failures never abort
/// the pass; they are collected here instead.
#[derive(Debug, Default)]
pub struct BootstrapSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: Vec<(Uuid, String)>,
}

pub struct PluginLoader {
    plugin_root: PathBuf,
    store: Arc<dyn PluginStore>,
    reporter: Arc<dyn LoadStatusReporter>,
    registry: RwLock<HashMap<Uuid, LoadedRuntimePlugin>>,
    op_locks: KeyedMutex,
}

impl PluginLoader {
    pub fn new(
        plugin_root: PathBuf,
        store: Arc<dyn PluginStore>,
        reporter: Arc<dyn LoadStatusReporter>,
    ) -> Self {
        Self {
            plugin_root,
            store,
            reporter,
            registry: RwLock::new(HashMap::new()),
            op_locks: KeyedMutex::new(),
        }
    }

    /// Load a plugin into the registry. No-op when it is already loaded
    /// from the same install path.
    pub async fn load(
        &self,
        installed_plugin_id: Uuid,
        actor: Option<String>,
    ) -> Result<LoadOutcome, LoadError> {
        let _op = self.op_locks.lock(&installed_plugin_id.to_string()).await;
        let result = self.load_locked(installed_plugin_id, false).await;
        self.report(installed_plugin_id, "load", &result, actor).await;
        result
    }

    /// Re-validate from disk and replace the registry entry.
    pub async fn reload(
        &self,
        installed_plugin_id: Uuid,
        actor: Option<String>,
    ) -> Result<LoadOutcome, LoadError> {
        let _op = self.op_locks.lock(&installed_plugin_id.to_string()).await;
        let result = self.load_locked(installed_plugin_id, true).await;
        self.report(installed_plugin_id, "reload", &result, actor)
            .await;
        result
    }

    /// Remove a plugin from the registry. Reports `NotLoaded` cleanly
    /// when it was absent.
    pub async fn unload(
        &self,
        installed_plugin_id: Uuid,
        actor: Option<String>,
    ) -> Result<LoadOutcome, LoadError> {
        let _op = self.op_locks.lock(&installed_plugin_id.to_string()).await;
        let removed = self.registry.write().await.remove(&installed_plugin_id);
        let result = Ok(match removed {
            Some(plugin) => {
                info!("unloaded plugin '{}'", plugin.plugin_id);
                LoadOutcome::Unloaded
            }
            None => LoadOutcome::NotLoaded,
        });
        self.report(installed_plugin_id, "unload", &result, actor)
            .await;
        result
    }

    /// Hydrate the registry for every persisted enabled row at process
    /// start. Per-item failures are aggregated, not surfaced.
    pub async fn bootstrap(&self, actor: Option<String>) -> Result<BootstrapSummary, LoadError> {
        let rows = self
            .store
            .list_installed()
            .await
            .map_err(LoadError::Store)?;
        let mut summary = BootstrapSummary::default();

        for row in rows {
            if row.status != PluginStatus::Enabled {
                summary.skipped += 1;
                continue;
            }
            let _op = self.op_locks.lock(&row.id.to_string()).await;
            let result = self.load_locked(row.id, false).await;
            self.report(row.id, "bootstrap", &result, actor.clone()).await;
            match result {
                Ok(_) => summary.loaded += 1,
                Err(LoadError::UnsupportedKind(_)) => summary.skipped += 1,
                Err(e) => summary.failed.push((row.id, e.to_string())),
            }
        }

        info!(
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "bootstrap pass complete"
        );
        Ok(summary)
    }

    pub async fn get(&self, installed_plugin_id: Uuid) -> Option<LoadedRuntimePlugin> {
        self.registry.read().await.get(&installed_plugin_id).cloned()
    }

    pub async fn loaded_for_workspace(&self, workspace_id: &str) -> Vec<LoadedRuntimePlugin> {
        let registry = self.registry.read().await;
        let mut plugins: Vec<_> = registry
            .values()
            .filter(|p| p.workspace_id == workspace_id)
            .cloned()
            .collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        plugins
    }

    /// Shared body of load/reload; caller holds the per-key lock.
    async fn load_locked(
        &self,
        installed_plugin_id: Uuid,
        replace: bool,
    ) -> Result<LoadOutcome, LoadError> {
        let row = self
            .store
            .get_installed(installed_plugin_id)
            .await
            .map_err(LoadError::Store)?
            .ok_or(LoadError::NotFound(installed_plugin_id))?;

        let install_path = self.plugin_root.join(&row.plugin_id);
        if !replace {
            let registry = self.registry.read().await;
            if let Some(existing) = registry.get(&installed_plugin_id) {
                if existing.install_path == install_path {
                    debug!("plugin '{}' already loaded", row.plugin_id);
                    return Ok(LoadOutcome::AlreadyLoaded);
                }
            }
        }

        let plugin = self.validate_from_disk(&row, install_path)?;
        let outcome = {
            let mut registry = self.registry.write().await;
            let replaced = registry.insert(installed_plugin_id, plugin).is_some();
            if replaced {
                LoadOutcome::Reloaded
            } else {
                LoadOutcome::Loaded
            }
        };
        info!("{} '{}'", outcome.message(), row.plugin_id);
        Ok(outcome)
    }

    fn validate_from_disk(
        &self,
        row: &InstalledPlugin,
        install_path: PathBuf,
    ) -> Result<LoadedRuntimePlugin, LoadError> {
        if !install_path.is_dir() {
            return Err(LoadError::MissingInstallDir(install_path));
        }
        let validated = ManifestValidator::new().validate_dir(&install_path)?;
        if !validated.kind.is_loadable() {
            return Err(LoadError::UnsupportedKind(validated.kind));
        }
        // Tool manifests always carry a resolved entry after validation.
        let tool_entry = validated
            .tool_entry
            .ok_or(ManifestError::MissingToolRuntime)?;
        let export_name = validated
            .export_name
            .ok_or(ManifestError::MissingToolRuntime)?;

        Ok(LoadedRuntimePlugin {
            installed_plugin_id: row.id,
            workspace_id: row.workspace_id.clone(),
            plugin_id: row.plugin_id.clone(),
            plugin_name: validated.manifest.display_name().to_string(),
            version: validated.manifest.version.clone(),
            install_path,
            manifest: validated.manifest,
            tool_entry,
            export_name,
        })
    }

    /// Best-effort status callback: spawned so it never blocks or fails
    /// the action; failures are logged.
    async fn report(
        &self,
        installed_plugin_id: Uuid,
        operation: &str,
        result: &Result<LoadOutcome, LoadError>,
        actor: Option<String>,
    ) {
        let row = match self.store.get_installed(installed_plugin_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                warn!("status report skipped, store lookup failed: {e}");
                return;
            }
        };
        let (status, message) = match result {
            Ok(outcome) => ("success".to_string(), outcome.message().to_string()),
            Err(e) => ("failure".to_string(), e.to_string()),
        };
        let update = LoadStatusUpdate {
            installed_plugin_id,
            workspace_id: row.workspace_id,
            plugin_id: row.plugin_id,
            status,
            operation: operation.to_string(),
            message,
            actor_id: actor,
        };
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            if let Err(e) = reporter.report(update).await {
                warn!("load status report failed: {e}");
            }
        });
    }
}
