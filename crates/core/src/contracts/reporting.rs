// Best-effort reporting contracts
//
// Both reporters are fire-and-forget collaborators: their failures are
// logged by the caller and never fail the primary operation.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status callback payload sent to the control plane after every loader
/// action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStatusUpdate {
    pub installed_plugin_id: Uuid,
    pub workspace_id: String,
    pub plugin_id: String,
    /// "success" or "failure".
    pub status: String,
    /// The loader operation that ran: load, reload, unload, bootstrap.
    pub operation: String,
    pub message: String,
    pub actor_id: Option<String>,
}

#[async_trait]
pub trait LoadStatusReporter: Send + Sync {
    async fn report(&self, update: LoadStatusUpdate) -> Result<()>;
}

/// One usage/audit event per tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub installed_plugin_id: Uuid,
    pub workspace_id: String,
    pub plugin_id: String,
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error_code: Option<String>,
}

#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn record(&self, event: UsageEvent) -> Result<()>;
}
