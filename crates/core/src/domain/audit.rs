// Append-only install audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Install,
    Uninstall,
    UpdateStatus,
    UpdateConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Rollback,
}

/// One lifecycle audit row. Rows are append-only and never mutated;
/// writes are best-effort and the writer swallows its own failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstallAudit {
    pub id: Uuid,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub workspace_id: String,
    pub plugin_id: Option<String>,
    pub actor: Option<String>,
    pub message: String,
    /// Resolved source/integrity/hash fields and similar context.
    #[serde(default)]
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl PluginInstallAudit {
    pub fn new(action: AuditAction, outcome: AuditOutcome, workspace_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            outcome,
            workspace_id: workspace_id.into(),
            plugin_id: None,
            actor: None,
            message: String::new(),
            detail: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
