// Loader registry and toolset assembly against the in-memory control
// plane, with an in-process fake invoker.

use async_trait::async_trait;
use common::{GuardConfig, HostConfig};
use plughost_core::{MemoryControlPlane, SourceType};
use plugins::guard::ExecutionGuard;
use plugins::installer::{InstallRequest, PluginInstaller};
use plugins::invoker::ToolInvoker;
use plugins::loader::{LoadError, LoadOutcome, LoadedRuntimePlugin, PluginLoader};
use plugins::toolset::ToolsetAssembler;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

struct Fixture {
    installer: PluginInstaller,
    loader: Arc<PluginLoader>,
    plane: MemoryControlPlane,
    plugin_root: std::path::PathBuf,
    _home: TempDir,
}

fn fixture() -> Fixture {
    let home = TempDir::new().expect("tempdir");
    let plugin_root = home.path().join("plugins");
    let config = Arc::new(HostConfig::default().with_plugin_root(&plugin_root));
    let plane = MemoryControlPlane::new();
    let installer = PluginInstaller::new(Arc::clone(&config), Arc::new(plane.clone()));
    let loader = Arc::new(PluginLoader::new(
        plugin_root.clone(),
        Arc::new(plane.clone()),
        Arc::new(plane.clone()),
    ));
    Fixture {
        installer,
        loader,
        plane,
        plugin_root,
        _home: home,
    }
}

fn write_plugin_source(dir: &Path, id: &str, kind: &str) {
    std::fs::create_dir_all(dir).expect("mkdir");
    std::fs::write(dir.join("index.js"), "// entry\n").expect("entry");
    let mut manifest = json!({
        "id": id,
        "kind": kind,
        "name": format!("{id} plugin"),
        "version": "1.0.0",
        "description": format!("{id} description"),
    });
    if kind == "tool" {
        manifest["runtime"] = json!({"tool": {"entry": "index.js", "export_name": "default"}});
    }
    std::fs::write(dir.join("plugin.json"), manifest.to_string()).expect("manifest");
}

async fn install(fx: &Fixture, workspace: &str, id: &str, kind: &str) -> Uuid {
    let source = TempDir::new().expect("tempdir");
    write_plugin_source(source.path(), id, kind);
    fx.installer
        .install(
            InstallRequest::new(workspace)
                .with_source(SourceType::Path, source.path().to_string_lossy()),
        )
        .await
        .expect("install")
        .installed
        .id
}

#[tokio::test]
async fn load_twice_yields_one_entry_and_already_loaded() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;

    let first = fx.loader.load(installed_id, None).await.expect("load");
    assert_eq!(first, LoadOutcome::Loaded);

    let second = fx.loader.load(installed_id, None).await.expect("load");
    assert_eq!(second, LoadOutcome::AlreadyLoaded);

    let loaded = fx.loader.loaded_for_workspace("ws1").await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].plugin_id, "alpha");
    assert!(loaded[0].tool_entry.ends_with("index.js"));
}

#[tokio::test]
async fn reload_revalidates_from_disk() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;
    fx.loader.load(installed_id, None).await.expect("load");

    // Break the on-disk manifest; reload must fail even though the
    // registry holds a previously valid entry.
    std::fs::write(fx.plugin_root.join("alpha/plugin.json"), "{not json").expect("corrupt");
    let result = fx.loader.reload(installed_id, None).await;
    assert!(matches!(result, Err(LoadError::Manifest(_))));

    // Restore and reload succeeds with a replaced entry.
    let source = TempDir::new().expect("tempdir");
    write_plugin_source(source.path(), "alpha", "tool");
    std::fs::copy(
        source.path().join("plugin.json"),
        fx.plugin_root.join("alpha/plugin.json"),
    )
    .expect("restore");
    let outcome = fx.loader.reload(installed_id, None).await.expect("reload");
    assert_eq!(outcome, LoadOutcome::Reloaded);
}

#[tokio::test]
async fn unload_reports_not_loaded_cleanly() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;

    fx.loader.load(installed_id, None).await.expect("load");
    assert_eq!(
        fx.loader.unload(installed_id, None).await.expect("unload"),
        LoadOutcome::Unloaded
    );
    assert_eq!(
        fx.loader.unload(installed_id, None).await.expect("unload"),
        LoadOutcome::NotLoaded
    );
    assert!(fx.loader.loaded_for_workspace("ws1").await.is_empty());
}

#[tokio::test]
async fn non_tool_kinds_are_rejected_at_load_time() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "chan", "channel").await;

    let result = fx.loader.load(installed_id, None).await;
    assert!(matches!(result, Err(LoadError::UnsupportedKind(_))));
}

#[tokio::test]
async fn bootstrap_aggregates_failures_instead_of_surfacing_them() {
    let fx = fixture();
    let good = install(&fx, "ws1", "good", "tool").await;
    install(&fx, "ws1", "chan", "channel").await;
    let disabled = install(&fx, "ws1", "dormant", "tool").await;
    fx.installer
        .update_status("ws1", "dormant", "disabled", None)
        .await
        .expect("disable");
    let broken = install(&fx, "ws1", "broken", "tool").await;
    std::fs::remove_dir_all(fx.plugin_root.join("broken")).expect("remove code");

    let summary = fx.loader.bootstrap(None).await.expect("bootstrap");
    assert_eq!(summary.loaded, 1);
    // The channel plugin and the disabled row are skipped, not failures.
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, broken);

    assert!(fx.loader.get(good).await.is_some());
    assert!(fx.loader.get(disabled).await.is_none());
}

#[tokio::test]
async fn load_status_is_reported_best_effort() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;
    fx.loader.load(installed_id, None).await.expect("load");

    // Reporting is spawned; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let updates = fx.plane.status_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].operation, "load");
    assert_eq!(updates[0].status, "success");
    assert_eq!(updates[0].plugin_id, "alpha");
}

// --- toolset ---

struct EchoInvoker;

#[async_trait]
impl ToolInvoker for EchoInvoker {
    async fn invoke(&self, plugin: &LoadedRuntimePlugin, args: Value) -> anyhow::Result<Value> {
        Ok(json!({"plugin": plugin.plugin_id, "echo": args}))
    }
}

struct FailingInvoker;

#[async_trait]
impl ToolInvoker for FailingInvoker {
    async fn invoke(&self, _plugin: &LoadedRuntimePlugin, _args: Value) -> anyhow::Result<Value> {
        anyhow::bail!("tool blew up")
    }
}

struct SlowInvoker;

#[async_trait]
impl ToolInvoker for SlowInvoker {
    async fn invoke(&self, _plugin: &LoadedRuntimePlugin, _args: Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!(null))
    }
}

fn assembler(fx: &Fixture, invoker: Arc<dyn ToolInvoker>, guard: GuardConfig) -> ToolsetAssembler {
    ToolsetAssembler::new(
        Arc::clone(&fx.loader),
        Arc::new(ExecutionGuard::new(guard)),
        invoker,
        Arc::new(fx.plane.clone()),
    )
}

#[tokio::test]
async fn assembled_tools_execute_through_the_guard() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;
    fx.loader.load(installed_id, None).await.expect("load");

    let toolset = assembler(&fx, Arc::new(EchoInvoker), GuardConfig::default());
    let tools = toolset.assemble("ws1").await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "alpha_plugin");
    assert_eq!(tools[0].description, "alpha description");

    let result = tools[0].call(json!({"q": "hello"})).await;
    assert!(result.success);
    let output = result.output.expect("output");
    assert_eq!(output["plugin"], "alpha");
    assert_eq!(output["echo"]["q"], "hello");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = fx.plane.usage_events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].tool_name, "alpha_plugin");
}

#[tokio::test]
async fn tool_failures_become_structured_results() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;
    fx.loader.load(installed_id, None).await.expect("load");

    let toolset = assembler(&fx, Arc::new(FailingInvoker), GuardConfig::default());
    let tools = toolset.assemble("ws1").await;

    let result = tools[0].call(json!({})).await;
    assert!(!result.success);
    let error = result.error.expect("error payload");
    assert_eq!(error.code, "plugin_execution_failed");
    assert!(error.message.contains("tool blew up"));
    let meta = error.meta.expect("meta snapshot");
    assert_eq!(meta["failure_streak"], 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = fx.plane.usage_events().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].error_code.as_deref(), Some("plugin_execution_failed"));
}

#[tokio::test]
async fn execution_timeout_surfaces_with_meta() {
    let fx = fixture();
    let installed_id = install(&fx, "ws1", "alpha", "tool").await;
    fx.loader.load(installed_id, None).await.expect("load");

    let toolset = assembler(
        &fx,
        Arc::new(SlowInvoker),
        GuardConfig {
            execution_timeout_ms: 50,
            ..GuardConfig::default()
        },
    );
    let tools = toolset.assemble("ws1").await;

    let result = tools[0].call(json!({})).await;
    assert!(!result.success);
    let error = result.error.expect("error payload");
    assert_eq!(error.code, "plugin_execution_timeout");
    assert_eq!(error.meta.expect("meta")["execution_timeout_ms"], 50);
}

#[tokio::test]
async fn colliding_display_names_get_distinct_tool_names() {
    let fx = fixture();

    // Two plugins whose display names sanitize identically.
    for id in ["alpha-one", "alpha.one"] {
        let source = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(source.path()).expect("mkdir");
        std::fs::write(source.path().join("index.js"), "// entry\n").expect("entry");
        std::fs::write(
            source.path().join("plugin.json"),
            json!({
                "id": id,
                "kind": "tool",
                "name": "Shared Name",
                "runtime": {"tool": {"entry": "index.js", "export_name": "default"}},
            })
            .to_string(),
        )
        .expect("manifest");
        let installed = fx
            .installer
            .install(
                InstallRequest::new("ws1")
                    .with_source(SourceType::Path, source.path().to_string_lossy()),
            )
            .await
            .expect("install")
            .installed
            .id;
        fx.loader.load(installed, None).await.expect("load");
    }

    let toolset = assembler(&fx, Arc::new(EchoInvoker), GuardConfig::default());
    let mut names: Vec<_> = toolset
        .assemble("ws1")
        .await
        .into_iter()
        .map(|t| t.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["shared_name", "shared_name_2"]);
}
