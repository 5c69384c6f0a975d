// Plugin manifest parsing and validation (shared by installer and loader)

pub mod schema;
pub mod validation;

pub use schema::{derive_config_fields, PluginManifest, ToolRuntime, MANIFEST_FILE};
pub use validation::{
    resolve_tool_entry, validate_entry_path, validate_export_name, ManifestError,
    ManifestValidator, ValidatedManifest,
};
