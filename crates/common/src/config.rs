// Host configuration
//
// File-backed configuration with environment override, resolved once at
// process start and passed by handle to the services that need it.

use crate::policy::InstallPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// Execution-guard tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    /// Maximum wall time for one tool invocation.
    pub execution_timeout_ms: u64,
    /// Maximum time a call may wait for a concurrency slot.
    pub queue_timeout_ms: u64,
    /// Concurrency cap per installed plugin.
    pub max_concurrency_per_plugin: u32,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    pub failure_cooldown_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 30_000,
            queue_timeout_ms: 10_000,
            max_concurrency_per_plugin: 2,
            failure_threshold: 5,
            failure_cooldown_ms: 60_000,
        }
    }
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Sandboxed root under which every plugin's code is materialized.
    pub plugin_root: PathBuf,
    /// Package-manager binary used for registry staging and dependency
    /// materialization.
    pub package_manager: String,
    /// Hard timeout for every spawned child process (pack, extract,
    /// dependency install). Processes exceeding it are killed.
    pub child_process_timeout_ms: u64,
    /// Script extension -> interpreter command for tool invocation.
    pub script_runtimes: HashMap<String, String>,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub install_policy: InstallPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        let mut script_runtimes = HashMap::new();
        script_runtimes.insert("js".to_string(), "node".to_string());
        script_runtimes.insert("mjs".to_string(), "node".to_string());
        script_runtimes.insert("cjs".to_string(), "node".to_string());
        script_runtimes.insert("py".to_string(), "python3".to_string());

        Self {
            plugin_root: Self::default_home().join("plugins"),
            package_manager: "npm".to_string(),
            child_process_timeout_ms: 120_000,
            script_runtimes,
            guard: GuardConfig::default(),
            install_policy: InstallPolicy::default(),
        }
    }
}

impl HostConfig {
    fn default_home() -> PathBuf {
        std::env::var("PLUGHOST_HOME")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                dir.push(".plughost");
                dir
            })
    }

    fn config_path() -> PathBuf {
        Self::default_home().join("config.json")
    }

    /// Load the host configuration from `$PLUGHOST_HOME/config.json`.
    /// A missing or unreadable file falls back to defaults; a present
    /// but malformed file is reported and also falls back.
    pub fn load() -> Self {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("malformed host config at {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn with_plugin_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.plugin_root = root.into();
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_install_policy(mut self, policy: InstallPolicy) -> Self {
        self.install_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_cover_script_runtimes() {
        let config = HostConfig::default();
        assert_eq!(config.script_runtimes.get("js").map(String::as_str), Some("node"));
        assert_eq!(config.script_runtimes.get("py").map(String::as_str), Some("python3"));
        assert_eq!(config.package_manager, "npm");
    }

    #[test]
    #[serial]
    fn load_reads_env_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("PLUGHOST_HOME", dir.path());

        let custom = HostConfig::default().with_plugin_root("/srv/plugins");
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string_pretty(&custom).expect("serialize"),
        )
        .expect("write config");

        let loaded = HostConfig::load();
        assert_eq!(loaded.plugin_root, PathBuf::from("/srv/plugins"));

        std::env::remove_var("PLUGHOST_HOME");
    }

    #[test]
    #[serial]
    fn load_falls_back_on_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("PLUGHOST_HOME", dir.path());

        let loaded = HostConfig::load();
        assert_eq!(loaded.guard, GuardConfig::default());

        std::env::remove_var("PLUGHOST_HOME");
    }
}
