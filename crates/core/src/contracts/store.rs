// Control-plane persistence contract
//
// The actual persistence/RPC layer is an external collaborator; the
// installer and loader only see this trait.

use crate::domain::{
    InstalledPlugin, PluginInstallAudit, PluginInstallRecord, PluginPackage, PluginStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence seam for the plugin host.
///
/// `commit_install` and `remove_installed` are the two transactional
/// operations: each applies all of its writes or none of them.
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn get_package(&self, plugin_id: &str) -> Result<Option<PluginPackage>>;

    async fn upsert_package(&self, package: PluginPackage) -> Result<()>;

    async fn find_installed(
        &self,
        workspace_id: &str,
        plugin_id: &str,
    ) -> Result<Option<InstalledPlugin>>;

    async fn get_installed(&self, installed_plugin_id: Uuid) -> Result<Option<InstalledPlugin>>;

    async fn list_installed(&self) -> Result<Vec<InstalledPlugin>>;

    async fn list_installed_for_workspace(&self, workspace_id: &str)
        -> Result<Vec<InstalledPlugin>>;

    /// Atomically insert the installed row, increment the package's
    /// install count and (for source-based installs) insert the install
    /// record. All or nothing.
    async fn commit_install(
        &self,
        installed: InstalledPlugin,
        record: Option<PluginInstallRecord>,
    ) -> Result<()>;

    /// Atomically delete the installed row and decrement the package's
    /// install count. Returns the deleted row.
    async fn remove_installed(
        &self,
        workspace_id: &str,
        plugin_id: &str,
    ) -> Result<InstalledPlugin>;

    async fn update_installed_status(
        &self,
        workspace_id: &str,
        plugin_id: &str,
        status: PluginStatus,
    ) -> Result<InstalledPlugin>;

    async fn update_installed_config(
        &self,
        workspace_id: &str,
        plugin_id: &str,
        config: serde_json::Value,
    ) -> Result<InstalledPlugin>;

    /// Append one audit row. Callers treat failures as best-effort.
    async fn append_audit(&self, audit: PluginInstallAudit) -> Result<()>;

    /// Catalog snapshot of installable candidates.
    async fn list_installable(&self) -> Result<Vec<PluginPackage>>;
}
