// Plugin Installer
//
// Secure fetch/verify/place pipeline: policy gate, staging, root
// discovery, integrity verification, dependency materialization, atomic
// placement, transactional commit and rollback. Every lifecycle action
// writes an append-only audit row; audit failures are swallowed.

pub mod integrity;
pub mod source;

pub use integrity::{hash_directory, hash_file, verify_expected, IntegrityError, PackageHashes};
pub use source::{ChildProcessRunner, SourceError};

use crate::manifest::{derive_config_fields, ManifestError, ManifestValidator, ValidatedManifest};
use chrono::Utc;
use common::{HostConfig, PolicyError};
use plughost_core::{
    AuditAction, AuditOutcome, InstalledPlugin, PluginInstallAudit, PluginInstallRecord,
    PluginPackage, PluginStatus, PluginStore, SourceType,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("install request needs a plugin id, a source, or both")]
    MissingSource,

    #[error("source type and source spec must be supplied together")]
    IncompleteSource,

    #[error("requested plugin id '{requested}' does not match manifest id '{actual}'")]
    IdMismatch { requested: String, actual: String },

    #[error("pinned version '{pinned}' does not match resolved version '{resolved}'")]
    PinMismatch { pinned: String, resolved: String },

    #[error("plugin '{0}' is already installed in workspace '{1}'")]
    AlreadyInstalled(String, String),

    #[error("config must be a JSON object")]
    InvalidConfig,

    #[error("unknown status '{0}'")]
    InvalidStatus(String),

    #[error("plugin '{0}' is not in the catalog and no source was supplied")]
    UnknownPlugin(String),

    #[error("plugin '{0}' has no on-disk code; supply a source")]
    NotMaterialized(String),

    #[error("IO failure during install: {0}")]
    Io(#[from] std::io::Error),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
}

/// Install request as received from the control plane.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub workspace_id: String,
    pub plugin_id: Option<String>,
    pub config_json: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_spec: Option<String>,
    pub source_integrity: Option<String>,
    pub source_pin: Option<String>,
    pub installed_by: Option<String>,
}

impl InstallRequest {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            plugin_id: None,
            config_json: None,
            source_type: None,
            source_spec: None,
            source_integrity: None,
            source_pin: None,
            installed_by: None,
        }
    }

    pub fn with_plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_source(mut self, source_type: SourceType, spec: impl Into<String>) -> Self {
        self.source_type = Some(source_type);
        self.source_spec = Some(spec.into());
        self
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.source_integrity = Some(integrity.into());
        self
    }

    pub fn with_pin(mut self, version: impl Into<String>) -> Self {
        self.source_pin = Some(version.into());
        self
    }

    pub fn with_config(mut self, config_json: impl Into<String>) -> Self {
        self.config_json = Some(config_json.into());
        self
    }

    pub fn with_installer(mut self, actor: impl Into<String>) -> Self {
        self.installed_by = Some(actor.into());
        self
    }
}

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub installed: InstalledPlugin,
    pub plugin_id: String,
    pub install_path: PathBuf,
    /// Whether this install created the on-disk directory (as opposed to
    /// reusing a pre-existing copy of the same plugin id).
    pub created_directory: bool,
    pub record: Option<PluginInstallRecord>,
}

/// A staged source tree, hashed and rooted at its manifest.
struct StagedPackage {
    root: PathBuf,
    hashes: PackageHashes,
    source_type: SourceType,
    source_spec: String,
    resolved_spec: Option<String>,
    resolved_version: Option<String>,
    /// Keeps the extraction/pack temp directory alive until placement.
    _staging: Option<tempfile::TempDir>,
}

pub struct PluginInstaller {
    config: Arc<HostConfig>,
    store: Arc<dyn PluginStore>,
    runner: ChildProcessRunner,
}

impl PluginInstaller {
    pub fn new(config: Arc<HostConfig>, store: Arc<dyn PluginStore>) -> Self {
        let runner = ChildProcessRunner::new(config.child_process_timeout_ms);
        Self {
            config,
            store,
            runner,
        }
    }

    /// Install a plugin into a workspace. On any failure, freshly
    /// created directories are rolled back and failure (plus rollback,
    /// if cleanup ran) audit rows are written.
    pub async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, InstallError> {
        let mut created_paths: Vec<PathBuf> = Vec::new();
        let result = self.install_pipeline(&request, &mut created_paths).await;

        match result {
            Ok(outcome) => {
                let detail = success_detail(&outcome);
                self.audit(
                    PluginInstallAudit::new(
                        AuditAction::Install,
                        AuditOutcome::Success,
                        request.workspace_id.as_str(),
                    )
                    .with_plugin(outcome.plugin_id.clone())
                    .with_actor(request.installed_by.clone())
                    .with_message("plugin installed")
                    .with_detail(detail),
                )
                .await;
                info!(
                    "installed plugin '{}' into workspace '{}'",
                    outcome.plugin_id, request.workspace_id
                );
                Ok(outcome)
            }
            Err(error) => {
                let mut rolled_back = false;
                for path in created_paths.iter().rev() {
                    if path.exists() {
                        match tokio::fs::remove_dir_all(path).await {
                            Ok(()) => rolled_back = true,
                            Err(e) => warn!("rollback of {} failed: {e}", path.display()),
                        }
                    }
                }
                let plugin_id = request.plugin_id.clone();
                self.audit(
                    PluginInstallAudit::new(
                        AuditAction::Install,
                        AuditOutcome::Failure,
                        request.workspace_id.as_str(),
                    )
                    .with_plugin(plugin_id.clone().unwrap_or_default())
                    .with_actor(request.installed_by.clone())
                    .with_message(error.to_string()),
                )
                .await;
                if rolled_back {
                    self.audit(
                        PluginInstallAudit::new(
                            AuditAction::Install,
                            AuditOutcome::Rollback,
                            request.workspace_id.as_str(),
                        )
                        .with_plugin(plugin_id.unwrap_or_default())
                        .with_actor(request.installed_by.clone())
                        .with_message("removed freshly created install directory"),
                    )
                    .await;
                }
                Err(error)
            }
        }
    }

    /// Delete the installed row and decrement the package install count
    /// in one transaction. On-disk code is intentionally left in place:
    /// other installs of the same plugin id share it (documented
    /// limitation, not a defect).
    pub async fn uninstall(
        &self,
        workspace_id: &str,
        plugin_key: &str,
        actor: Option<String>,
    ) -> Result<InstalledPlugin, InstallError> {
        let result = self
            .store
            .remove_installed(workspace_id, plugin_key)
            .await
            .map_err(InstallError::Store);

        let (outcome, message) = match &result {
            Ok(_) => (AuditOutcome::Success, "plugin uninstalled".to_string()),
            Err(e) => (AuditOutcome::Failure, e.to_string()),
        };
        self.audit(
            PluginInstallAudit::new(AuditAction::Uninstall, outcome, workspace_id)
                .with_plugin(plugin_key)
                .with_actor(actor)
                .with_message(message),
        )
        .await;
        result
    }

    /// Update a row's status. Legacy aliases are normalized.
    pub async fn update_status(
        &self,
        workspace_id: &str,
        plugin_key: &str,
        raw_status: &str,
        actor: Option<String>,
    ) -> Result<InstalledPlugin, InstallError> {
        let result = match PluginStatus::normalize(raw_status) {
            Some(status) => self
                .store
                .update_installed_status(workspace_id, plugin_key, status)
                .await
                .map_err(InstallError::Store),
            None => Err(InstallError::InvalidStatus(raw_status.to_string())),
        };

        let (outcome, message) = match &result {
            Ok(row) => (
                AuditOutcome::Success,
                format!("status set to {}", row.status),
            ),
            Err(e) => (AuditOutcome::Failure, e.to_string()),
        };
        self.audit(
            PluginInstallAudit::new(AuditAction::UpdateStatus, outcome, workspace_id)
                .with_plugin(plugin_key)
                .with_actor(actor)
                .with_message(message),
        )
        .await;
        result
    }

    /// Replace a row's config with a new JSON object.
    pub async fn update_config(
        &self,
        workspace_id: &str,
        plugin_key: &str,
        config_json: &str,
        actor: Option<String>,
    ) -> Result<InstalledPlugin, InstallError> {
        let result = match parse_config_object(Some(config_json)) {
            Ok(config) => self
                .store
                .update_installed_config(workspace_id, plugin_key, config)
                .await
                .map_err(InstallError::Store),
            Err(e) => Err(e),
        };

        let (outcome, message) = match &result {
            Ok(_) => (AuditOutcome::Success, "config updated".to_string()),
            Err(e) => (AuditOutcome::Failure, e.to_string()),
        };
        self.audit(
            PluginInstallAudit::new(AuditAction::UpdateConfig, outcome, workspace_id)
                .with_plugin(plugin_key)
                .with_actor(actor)
                .with_message(message),
        )
        .await;
        result
    }

    async fn install_pipeline(
        &self,
        request: &InstallRequest,
        created_paths: &mut Vec<PathBuf>,
    ) -> Result<InstallOutcome, InstallError> {
        // Policy gate runs before any staging I/O.
        let staged = match (&request.source_type, &request.source_spec) {
            (Some(source_type), Some(spec)) => {
                self.config.install_policy.check_source_type(*source_type)?;
                Some(self.stage_source(*source_type, spec).await?)
            }
            (None, None) => None,
            _ => return Err(InstallError::IncompleteSource),
        };

        // A pinned registry version must be the one the pack resolved.
        if let (Some(pin), Some(staged)) = (&request.source_pin, &staged) {
            if staged.source_type == SourceType::RegistryPackage
                && staged.resolved_version.as_deref() != Some(pin.as_str())
            {
                return Err(InstallError::PinMismatch {
                    pinned: pin.clone(),
                    resolved: staged.resolved_version.clone().unwrap_or_default(),
                });
            }
        }

        // Integrity verification aborts with no retained side effect:
        // nothing has been placed under the plugin root yet.
        let resolved_integrity = match (&request.source_integrity, &staged) {
            (Some(expected), Some(staged)) => Some(verify_expected(expected, &staged.hashes)?),
            _ => None,
        };

        let (validated, install_path, created) = match &staged {
            Some(staged) => {
                let validated = ManifestValidator::new().validate_dir(&staged.root)?;
                let (install_path, created) =
                    self.place(&staged.root, &validated.manifest.id, created_paths).await?;
                (validated, install_path, created)
            }
            None => {
                // Catalog-only install: the code must already be on disk
                // from a previous source-based install of the same id.
                let plugin_id = request
                    .plugin_id
                    .as_deref()
                    .ok_or(InstallError::MissingSource)?;
                if self
                    .store
                    .get_package(plugin_id)
                    .await
                    .map_err(InstallError::Store)?
                    .is_none()
                {
                    return Err(InstallError::UnknownPlugin(plugin_id.to_string()));
                }
                let install_path = self.config.plugin_root.join(plugin_id);
                if !install_path.is_dir() {
                    return Err(InstallError::NotMaterialized(plugin_id.to_string()));
                }
                let validated = ManifestValidator::new().validate_dir(&install_path)?;
                (validated, install_path, false)
            }
        };
        let manifest = &validated.manifest;

        // Pre-commit checks.
        if let Some(requested) = &request.plugin_id {
            if requested != &manifest.id {
                return Err(InstallError::IdMismatch {
                    requested: requested.clone(),
                    actual: manifest.id.clone(),
                });
            }
        }
        if self
            .store
            .find_installed(&request.workspace_id, &manifest.id)
            .await
            .map_err(InstallError::Store)?
            .is_some()
        {
            return Err(InstallError::AlreadyInstalled(
                manifest.id.clone(),
                request.workspace_id.clone(),
            ));
        }
        let config = parse_config_object(request.config_json.as_deref())?;

        self.upsert_package_row(&validated).await?;
        if staged.is_some() {
            self.write_metadata_sidecar(&validated, &staged, &install_path)
                .await?;
        }

        let installed = InstalledPlugin {
            id: Uuid::new_v4(),
            workspace_id: request.workspace_id.clone(),
            plugin_id: manifest.id.clone(),
            status: PluginStatus::Enabled,
            config,
            installed_at: Utc::now(),
            installed_by: request.installed_by.clone(),
        };
        let record = staged.as_ref().map(|staged| PluginInstallRecord {
            installed_plugin_id: installed.id,
            source_type: staged.source_type,
            source_spec: staged.source_spec.clone(),
            resolved_spec: staged.resolved_spec.clone(),
            resolved_version: staged.resolved_version.clone(),
            expected_integrity: request.source_integrity.clone(),
            resolved_integrity: resolved_integrity.clone(),
            checksum: staged.hashes.sha256_hex(),
            sha256: staged.hashes.sha256_hex(),
            sha512: staged.hashes.sha512_hex(),
            install_path: install_path.clone(),
        });

        self.store
            .commit_install(installed.clone(), record.clone())
            .await
            .map_err(InstallError::Store)?;

        Ok(InstallOutcome {
            plugin_id: manifest.id.clone(),
            installed,
            install_path,
            created_directory: created,
            record,
        })
    }

    /// Stage a source into a hashed tree rooted at its manifest.
    async fn stage_source(
        &self,
        source_type: SourceType,
        spec: &str,
    ) -> Result<StagedPackage, InstallError> {
        let policy = &self.config.install_policy;
        match source_type {
            SourceType::RegistryPackage => {
                let name = policy.check_registry_spec(spec)?;
                let staging = tempfile::tempdir()?;
                let tarball = source::pack_registry_spec(
                    &self.runner,
                    &self.config.package_manager,
                    spec,
                    staging.path(),
                )
                .await?;
                let hashes = hash_file(&tarball).await?;
                let extracted = staging.path().join("extracted");
                source::extract_archive(&self.runner, &tarball, &extracted).await?;
                let root = source::discover_manifest_root(&extracted)?;
                let resolved_version = read_package_version(&root).await;
                let resolved_spec = resolved_version
                    .as_ref()
                    .map(|version| format!("{name}@{version}"));
                Ok(StagedPackage {
                    root,
                    hashes,
                    source_type,
                    source_spec: spec.to_string(),
                    resolved_spec,
                    resolved_version,
                    _staging: Some(staging),
                })
            }
            SourceType::Archive => {
                let archive = policy.check_local_path(std::path::Path::new(spec))?;
                let hashes = hash_file(&archive).await?;
                let staging = tempfile::tempdir()?;
                let extracted = staging.path().join("extracted");
                source::extract_archive(&self.runner, &archive, &extracted).await?;
                let root = source::discover_manifest_root(&extracted)?;
                Ok(StagedPackage {
                    root,
                    hashes,
                    source_type,
                    source_spec: spec.to_string(),
                    resolved_spec: None,
                    resolved_version: None,
                    _staging: Some(staging),
                })
            }
            SourceType::Path => {
                let dir = policy.check_local_path(std::path::Path::new(spec))?;
                let root = source::discover_manifest_root(&dir)?;
                let hashes = hash_directory(&root).await?;
                Ok(StagedPackage {
                    root,
                    hashes,
                    source_type,
                    source_spec: spec.to_string(),
                    resolved_spec: None,
                    resolved_version: None,
                    _staging: None,
                })
            }
        }
    }

    /// Place a staged tree under `<plugin_root>/<manifest_id>`. Fresh
    /// installs stage into a sibling path, materialize dependencies and
    /// rename into place; an existing directory only gets a dependency
    /// pass and is never overwritten.
    async fn place(
        &self,
        staged_root: &std::path::Path,
        manifest_id: &str,
        created_paths: &mut Vec<PathBuf>,
    ) -> Result<(PathBuf, bool), InstallError> {
        let target = self.config.plugin_root.join(manifest_id);
        if target.is_dir() {
            source::install_dependencies(&self.runner, &self.config.package_manager, &target)
                .await?;
            return Ok((target, false));
        }

        tokio::fs::create_dir_all(&self.config.plugin_root).await?;
        let sibling = self
            .config
            .plugin_root
            .join(format!(".{manifest_id}.staging-{}", Uuid::new_v4()));
        created_paths.push(sibling.clone());
        source::copy_dir_recursive(staged_root, &sibling).await?;
        source::install_dependencies(&self.runner, &self.config.package_manager, &sibling).await?;

        // The existence check above and this rename are not atomic across
        // concurrent installs of the same plugin id; documented, accepted
        // gap - the loser's rename fails or overwrites an identical tree.
        tokio::fs::rename(&sibling, &target).await?;
        created_paths.push(target.clone());
        Ok((target, true))
    }

    async fn upsert_package_row(&self, validated: &ValidatedManifest) -> Result<(), InstallError> {
        let manifest = &validated.manifest;
        let existing = self
            .store
            .get_package(&manifest.id)
            .await
            .map_err(InstallError::Store)?;
        let (pricing_model, price_cents, install_count) = existing
            .map(|p| (p.pricing_model, p.price_cents, p.install_count))
            .unwrap_or_default();

        let package = PluginPackage {
            id: manifest.id.clone(),
            name: manifest.display_name().to_string(),
            kind: validated.kind,
            description: manifest.description.clone().unwrap_or_default(),
            author: manifest.author.clone().unwrap_or_default(),
            version: manifest.version.clone().unwrap_or_default(),
            pricing_model,
            price_cents,
            install_count,
        };
        self.store
            .upsert_package(package)
            .await
            .map_err(InstallError::Store)
    }

    /// Write the per-plugin metadata sidecar next to the install
    /// directory.
    async fn write_metadata_sidecar(
        &self,
        validated: &ValidatedManifest,
        staged: &Option<StagedPackage>,
        install_path: &std::path::Path,
    ) -> Result<(), InstallError> {
        let manifest = &validated.manifest;
        let now = Utc::now();
        let metadata = plughost_core::PluginMetadataFile {
            display_name: manifest.display_name().to_string(),
            long_description: manifest.description.clone().unwrap_or_default(),
            config_fields: derive_config_fields(manifest),
            tags: manifest.tags.clone(),
            permissions: manifest.permissions.clone(),
            screenshots: Vec::new(),
            created_at: now,
            updated_at: now,
            source_type: staged.as_ref().map(|s| s.source_type.to_string()),
            source_spec: staged.as_ref().map(|s| s.source_spec.clone()),
            install_path: install_path.to_path_buf(),
        };
        let sidecar_path = self
            .config
            .plugin_root
            .join(format!("{}.metadata.json", manifest.id));
        let body = serde_json::to_string_pretty(&metadata)
            .map_err(|e| InstallError::Store(e.into()))?;
        tokio::fs::write(sidecar_path, body).await?;
        Ok(())
    }

    /// Best-effort audit append; failures are logged, never surfaced.
    async fn audit(&self, audit: PluginInstallAudit) {
        if let Err(e) = self.store.append_audit(audit).await {
            warn!("audit write failed: {e}");
        }
    }
}

fn parse_config_object(config_json: Option<&str>) -> Result<serde_json::Value, InstallError> {
    match config_json {
        None => Ok(serde_json::json!({})),
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).map_err(|_| InstallError::InvalidConfig)?;
            if value.is_object() {
                Ok(value)
            } else {
                Err(InstallError::InvalidConfig)
            }
        }
    }
}

async fn read_package_version(root: &std::path::Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(root.join("package.json")).await.ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    parsed
        .get("version")
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn success_detail(outcome: &InstallOutcome) -> serde_json::Value {
    match &outcome.record {
        Some(record) => serde_json::json!({
            "source_type": record.source_type.to_string(),
            "source_spec": record.source_spec,
            "resolved_spec": record.resolved_spec,
            "resolved_version": record.resolved_version,
            "expected_integrity": record.expected_integrity,
            "resolved_integrity": record.resolved_integrity,
            "sha256": record.sha256,
            "sha512": record.sha512,
            "install_path": record.install_path,
            "created_directory": outcome.created_directory,
        }),
        None => serde_json::json!({
            "source_type": serde_json::Value::Null,
            "install_path": outcome.install_path,
            "created_directory": outcome.created_directory,
        }),
    }
}
