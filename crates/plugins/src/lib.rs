//! plughost plugin pipeline: install -> load -> execute.
//!
//! - `manifest`: descriptor parsing and validation, shared by installer
//!   and loader
//! - `installer`: secure fetch/verify/place with transactional commit,
//!   rollback and audit
//! - `loader`: per-process registry with serialized load/reload/unload
//!   and bootstrap
//! - `guard`: per-plugin concurrency limits, queue/execution timeouts
//!   and a failure-triggered circuit breaker
//! - `toolset`: the guarded, collision-free tool surface handed to the
//!   agent's model-invocation layer
//! - `invoker`: subprocess-based tool execution boundary

pub mod guard;
pub mod installer;
pub mod invoker;
pub mod loader;
pub mod manifest;
pub mod toolset;

pub use guard::{ExecutionGuard, GuardError, GuardErrorMeta, GuardStats};
pub use installer::{InstallError, InstallOutcome, InstallRequest, PluginInstaller};
pub use invoker::{InvokeError, SubprocessInvoker, ToolInvoker};
pub use loader::{BootstrapSummary, LoadError, LoadOutcome, LoadedRuntimePlugin, PluginLoader};
pub use manifest::{ManifestError, ManifestValidator, PluginManifest, MANIFEST_FILE};
pub use toolset::{RuntimeTool, ToolCallError, ToolCallResult, ToolsetAssembler};
