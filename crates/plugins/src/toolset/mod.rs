// Runtime Toolset Assembly
//
// Composes loader output with the execution guard into the callable
// tool surface handed to the agent's model-invocation layer. Guard
// errors and raw tool exceptions both become structured error results -
// never panics or propagated errors - so one plugin cannot abort the
// surrounding agent turn.

use crate::guard::{ExecutionGuard, GuardError};
use crate::invoker::ToolInvoker;
use crate::loader::{LoadedRuntimePlugin, PluginLoader};
use plughost_core::{UsageEvent, UsageReporter};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Structured error payload embedded in a failed tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// What the model-invocation layer receives for every tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolCallError>,
}

impl ToolCallResult {
    fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    fn err(code: impl Into<String>, message: impl Into<String>, meta: Option<Value>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(ToolCallError {
                code: code.into(),
                message: message.into(),
                meta,
            }),
        }
    }
}

/// One callable tool: a loaded plugin wrapped in the guard. Safe to hand
/// directly to the model-invocation layer.
#[derive(Clone)]
pub struct RuntimeTool {
    pub name: String,
    pub description: String,
    pub plugin: LoadedRuntimePlugin,
    guard: Arc<ExecutionGuard>,
    invoker: Arc<dyn ToolInvoker>,
    usage: Arc<dyn UsageReporter>,
}

impl RuntimeTool {
    /// Invoke the plugin's tool under the guard keyed by installed-plugin
    /// identity. Always returns a result, never an error.
    pub async fn call(&self, args: Value) -> ToolCallResult {
        let key = self.plugin.installed_plugin_id.to_string();
        let invoker = Arc::clone(&self.invoker);
        let plugin = self.plugin.clone();
        let started = Instant::now();

        let outcome = self
            .guard
            .run(&key, move || async move { invoker.invoke(&plugin, args).await })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                self.report_usage(true, duration_ms, None);
                ToolCallResult::ok(value)
            }
            Err(guard_error) => {
                let code = guard_error.code();
                self.report_usage(false, duration_ms, Some(code.to_string()));
                let meta = serde_json::to_value(guard_error.meta()).ok();
                ToolCallResult::err(code, error_message(&guard_error), meta)
            }
        }
    }

    /// Fire-and-forget usage event; failures are logged only.
    fn report_usage(&self, success: bool, duration_ms: u64, error_code: Option<String>) {
        let event = UsageEvent {
            installed_plugin_id: self.plugin.installed_plugin_id,
            workspace_id: self.plugin.workspace_id.clone(),
            plugin_id: self.plugin.plugin_id.clone(),
            tool_name: self.name.clone(),
            success,
            duration_ms,
            error_code,
        };
        let usage = Arc::clone(&self.usage);
        tokio::spawn(async move {
            if let Err(e) = usage.record(event).await {
                warn!("usage report failed: {e}");
            }
        });
    }
}

fn error_message(error: &GuardError) -> String {
    match error {
        GuardError::ExecutionFailed { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

pub struct ToolsetAssembler {
    loader: Arc<PluginLoader>,
    guard: Arc<ExecutionGuard>,
    invoker: Arc<dyn ToolInvoker>,
    usage: Arc<dyn UsageReporter>,
}

impl ToolsetAssembler {
    pub fn new(
        loader: Arc<PluginLoader>,
        guard: Arc<ExecutionGuard>,
        invoker: Arc<dyn ToolInvoker>,
        usage: Arc<dyn UsageReporter>,
    ) -> Self {
        Self {
            loader,
            guard,
            invoker,
            usage,
        }
    }

    /// Build the tool surface for one workspace: every loaded plugin,
    /// each under a collision-free name.
    pub async fn assemble(&self, workspace_id: &str) -> Vec<RuntimeTool> {
        let plugins = self.loader.loaded_for_workspace(workspace_id).await;
        let mut taken = HashSet::new();
        let mut tools = Vec::with_capacity(plugins.len());

        for plugin in plugins {
            let name = assign_tool_name(&mut taken, &plugin);
            let description = plugin
                .manifest
                .description
                .clone()
                .unwrap_or_else(|| format!("Tool plugin '{}'", plugin.plugin_name));
            tools.push(RuntimeTool {
                name,
                description,
                plugin,
                guard: Arc::clone(&self.guard),
                invoker: Arc::clone(&self.invoker),
                usage: Arc::clone(&self.usage),
            });
        }
        tools
    }
}

/// Base name from the plugin's display name; on collision append the
/// first free `_2`, `_3`, ... suffix slot.
fn assign_tool_name(taken: &mut HashSet<String>, plugin: &LoadedRuntimePlugin) -> String {
    let base = sanitize_tool_name(&plugin.plugin_name, &plugin.plugin_id);
    if taken.insert(base.clone()) {
        return base;
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}_{suffix}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn sanitize_tool_name(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        sanitize_fallback(fallback)
    } else {
        cleaned
    }
}

fn sanitize_fallback(fallback: &str) -> String {
    let cleaned: String = fallback
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "plugin_tool".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::schema::{PluginManifest, RuntimeSection, ToolRuntime};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn loaded(name: &str, id: &str) -> LoadedRuntimePlugin {
        LoadedRuntimePlugin {
            installed_plugin_id: Uuid::new_v4(),
            workspace_id: "ws".to_string(),
            plugin_id: id.to_string(),
            plugin_name: name.to_string(),
            version: None,
            install_path: PathBuf::from("/tmp/unused"),
            manifest: PluginManifest {
                id: id.to_string(),
                kind: None,
                name: Some(name.to_string()),
                version: None,
                description: None,
                author: None,
                tags: Vec::new(),
                permissions: Vec::new(),
                runtime: RuntimeSection {
                    tool: Some(ToolRuntime {
                        entry: "index.js".to_string(),
                        export_name: "default".to_string(),
                    }),
                },
                config_schema: serde_json::Value::Null,
            },
            tool_entry: PathBuf::from("/tmp/unused/index.js"),
            export_name: "default".to_string(),
        }
    }

    #[test]
    fn collision_names_get_incrementing_suffixes() {
        let mut taken = HashSet::new();
        let a = assign_tool_name(&mut taken, &loaded("Web Search", "p1"));
        let b = assign_tool_name(&mut taken, &loaded("Web Search", "p2"));
        let c = assign_tool_name(&mut taken, &loaded("Web Search", "p3"));
        assert_eq!(a, "web_search");
        assert_eq!(b, "web_search_2");
        assert_eq!(c, "web_search_3");
    }

    #[test]
    fn suffix_takes_first_available_slot() {
        let mut taken = HashSet::new();
        taken.insert("tool".to_string());
        taken.insert("tool_2".to_string());
        taken.insert("tool_4".to_string());
        let name = assign_tool_name(&mut taken, &loaded("Tool", "p9"));
        assert_eq!(name, "tool_3");
    }

    #[test]
    fn unusable_names_fall_back_to_plugin_id() {
        let mut taken = HashSet::new();
        let name = assign_tool_name(&mut taken, &loaded("###", "my-plugin"));
        assert_eq!(name, "my_plugin");
    }
}
