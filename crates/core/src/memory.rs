// In-memory control plane
//
// Reference implementation of the persistence and reporting contracts.
// Used by tests and by single-process deployments that do not attach an
// external control plane.

use crate::contracts::{
    LoadStatusReporter, LoadStatusUpdate, PluginStore, UsageEvent, UsageReporter,
};
use crate::domain::{
    InstalledPlugin, PluginInstallAudit, PluginInstallRecord, PluginPackage, PluginStatus,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    packages: HashMap<String, PluginPackage>,
    installed: HashMap<Uuid, InstalledPlugin>,
    records: Vec<PluginInstallRecord>,
    audits: Vec<PluginInstallAudit>,
    status_updates: Vec<LoadStatusUpdate>,
    usage_events: Vec<UsageEvent>,
}

/// Memory-backed store + reporters behind one `RwLock`d state.
#[derive(Default, Clone)]
pub struct MemoryControlPlane {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit rows in append order, for assertions.
    pub async fn audits(&self) -> Vec<PluginInstallAudit> {
        self.state.read().await.audits.clone()
    }

    pub async fn install_records(&self) -> Vec<PluginInstallRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn status_updates(&self) -> Vec<LoadStatusUpdate> {
        self.state.read().await.status_updates.clone()
    }

    pub async fn usage_events(&self) -> Vec<UsageEvent> {
        self.state.read().await.usage_events.clone()
    }
}

#[async_trait]
impl PluginStore for MemoryControlPlane {
    async fn get_package(&self, plugin_id: &str) -> Result<Option<PluginPackage>> {
        Ok(self.state.read().await.packages.get(plugin_id).cloned())
    }

    async fn upsert_package(&self, package: PluginPackage) -> Result<()> {
        self.state
            .write()
            .await
            .packages
            .insert(package.id.clone(), package);
        Ok(())
    }

    async fn find_installed(
        &self,
        workspace_id: &str,
        plugin_id: &str,
    ) -> Result<Option<InstalledPlugin>> {
        let state = self.state.read().await;
        Ok(state
            .installed
            .values()
            .find(|row| row.workspace_id == workspace_id && row.plugin_id == plugin_id)
            .cloned())
    }

    async fn get_installed(&self, installed_plugin_id: Uuid) -> Result<Option<InstalledPlugin>> {
        Ok(self
            .state
            .read()
            .await
            .installed
            .get(&installed_plugin_id)
            .cloned())
    }

    async fn list_installed(&self) -> Result<Vec<InstalledPlugin>> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state.installed.values().cloned().collect();
        rows.sort_by_key(|row| row.installed_at);
        Ok(rows)
    }

    async fn list_installed_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<InstalledPlugin>> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .installed
            .values()
            .filter(|row| row.workspace_id == workspace_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.installed_at);
        Ok(rows)
    }

    async fn commit_install(
        &self,
        installed: InstalledPlugin,
        record: Option<PluginInstallRecord>,
    ) -> Result<()> {
        // Single write lock makes the three writes atomic.
        let mut state = self.state.write().await;
        if state.installed.contains_key(&installed.id) {
            return Err(anyhow!("installed plugin {} already committed", installed.id));
        }
        let package = state
            .packages
            .get_mut(&installed.plugin_id)
            .ok_or_else(|| anyhow!("no package row for plugin {}", installed.plugin_id))?;
        package.install_count += 1;
        state.installed.insert(installed.id, installed);
        if let Some(record) = record {
            state.records.push(record);
        }
        Ok(())
    }

    async fn remove_installed(
        &self,
        workspace_id: &str,
        plugin_id: &str,
    ) -> Result<InstalledPlugin> {
        let mut state = self.state.write().await;
        let id = state
            .installed
            .values()
            .find(|row| row.workspace_id == workspace_id && row.plugin_id == plugin_id)
            .map(|row| row.id)
            .ok_or_else(|| {
                anyhow!("plugin {plugin_id} is not installed in workspace {workspace_id}")
            })?;
        let row = state
            .installed
            .remove(&id)
            .ok_or_else(|| anyhow!("installed row {id} disappeared"))?;
        if let Some(package) = state.packages.get_mut(plugin_id) {
            package.install_count = package.install_count.saturating_sub(1);
        }
        Ok(row)
    }

    async fn update_installed_status(
        &self,
        workspace_id: &str,
        plugin_id: &str,
        status: PluginStatus,
    ) -> Result<InstalledPlugin> {
        let mut state = self.state.write().await;
        let row = state
            .installed
            .values_mut()
            .find(|row| row.workspace_id == workspace_id && row.plugin_id == plugin_id)
            .ok_or_else(|| {
                anyhow!("plugin {plugin_id} is not installed in workspace {workspace_id}")
            })?;
        row.status = status;
        Ok(row.clone())
    }

    async fn update_installed_config(
        &self,
        workspace_id: &str,
        plugin_id: &str,
        config: serde_json::Value,
    ) -> Result<InstalledPlugin> {
        let mut state = self.state.write().await;
        let row = state
            .installed
            .values_mut()
            .find(|row| row.workspace_id == workspace_id && row.plugin_id == plugin_id)
            .ok_or_else(|| {
                anyhow!("plugin {plugin_id} is not installed in workspace {workspace_id}")
            })?;
        row.config = config;
        Ok(row.clone())
    }

    async fn append_audit(&self, audit: PluginInstallAudit) -> Result<()> {
        self.state.write().await.audits.push(audit);
        Ok(())
    }

    async fn list_installable(&self) -> Result<Vec<PluginPackage>> {
        let state = self.state.read().await;
        let mut packages: Vec<_> = state.packages.values().cloned().collect();
        packages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(packages)
    }
}

#[async_trait]
impl LoadStatusReporter for MemoryControlPlane {
    async fn report(&self, update: LoadStatusUpdate) -> Result<()> {
        self.state.write().await.status_updates.push(update);
        Ok(())
    }
}

#[async_trait]
impl UsageReporter for MemoryControlPlane {
    async fn record(&self, event: UsageEvent) -> Result<()> {
        self.state.write().await.usage_events.push(event);
        Ok(())
    }
}
