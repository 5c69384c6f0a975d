// Tool invocation boundary
//
// The loader resolves what to run; this module actually runs it. The
// provided implementation executes the plugin's entry script via the
// configured interpreter, passing the export name and arguments as JSON
// on stdin and reading a JSON result from stdout. No execution-level
// isolation is applied beyond the child process itself.

use crate::loader::LoadedRuntimePlugin;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no script runtime configured for extension '{0}'")]
    NoRuntimeForExtension(String),

    #[error("failed to spawn script runtime '{runtime}': {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool process killed after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("tool process exited with {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },

    #[error("tool produced malformed output: {0}")]
    MalformedOutput(String),

    #[error("IO error talking to tool process: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the toolset and the execution mechanism; tests swap in
/// in-process fakes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, plugin: &LoadedRuntimePlugin, args: Value) -> Result<Value>;
}

/// Executes the resolved entry script as a child process with a JSON
/// stdio contract: `{"export_name": ..., "args": ...}` in, one JSON
/// value out.
pub struct SubprocessInvoker {
    script_runtimes: HashMap<String, String>,
    kill_timeout: Duration,
}

impl SubprocessInvoker {
    pub fn new(script_runtimes: HashMap<String, String>, kill_timeout_ms: u64) -> Self {
        Self {
            script_runtimes,
            kill_timeout: Duration::from_millis(kill_timeout_ms),
        }
    }

    fn runtime_for(&self, plugin: &LoadedRuntimePlugin) -> Result<String, InvokeError> {
        let extension = plugin
            .tool_entry
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_lowercase();
        self.script_runtimes
            .get(&extension)
            .cloned()
            .ok_or(InvokeError::NoRuntimeForExtension(extension))
    }
}

#[async_trait]
impl ToolInvoker for SubprocessInvoker {
    async fn invoke(&self, plugin: &LoadedRuntimePlugin, args: Value) -> Result<Value> {
        let runtime = self.runtime_for(plugin)?;
        debug!(
            "invoking '{}' export '{}' via {runtime}",
            plugin.plugin_id, plugin.export_name
        );

        let mut child = Command::new(&runtime)
            .arg(&plugin.tool_entry)
            .current_dir(&plugin.install_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InvokeError::Spawn {
                runtime: runtime.clone(),
                source,
            })?;

        let request = serde_json::json!({
            "export_name": plugin.export_name,
            "args": args,
        });
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.to_string().as_bytes())
                .await
                .map_err(InvokeError::Io)?;
            // Close stdin so the script sees EOF.
            drop(stdin);
        }

        let output = tokio::time::timeout(self.kill_timeout, child.wait_with_output())
            .await
            .map_err(|_| InvokeError::Timeout {
                timeout_ms: self.kill_timeout.as_millis() as u64,
            })?
            .map_err(InvokeError::Io)?;

        if !output.status.success() {
            return Err(InvokeError::NonZeroExit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = serde_json::from_str(stdout.trim())
            .map_err(|e| InvokeError::MalformedOutput(e.to_string()))?;
        Ok(value)
    }
}
