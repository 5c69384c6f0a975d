// Plugin Manifest Schema Definitions

use plughost_core::{ConfigField, ConfigFieldOption, ConfigFieldType};
use serde::{Deserialize, Serialize};

/// Fixed manifest filename at every plugin's install root.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Tool runtime descriptor. Only plugins of kind `tool` carry one, and
/// only those are executable by the loader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRuntime {
    /// Entry script, relative to the install root.
    pub entry: String,
    /// Exported function name: `default` or a valid identifier.
    pub export_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSection {
    #[serde(default)]
    pub tool: Option<ToolRuntime>,
}

/// On-disk plugin descriptor - the complete plugin.json schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin identity; doubles as the install directory name.
    pub id: String,
    /// Plugin kind, normalized lowercase. Absent means `tool`.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Declared configuration schema: `{properties: {...}, required: [..]}`.
    #[serde(default)]
    pub config_schema: serde_json::Value,
}

impl PluginManifest {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Derive UI config fields from the manifest's declared schema
/// properties. A `sensitive: true` hint promotes text to password;
/// select options come from `options` or `enum`; defaults are kept
/// JSON-encoded.
pub fn derive_config_fields(manifest: &PluginManifest) -> Vec<ConfigField> {
    let Some(properties) = manifest
        .config_schema
        .get("properties")
        .and_then(|v| v.as_object())
    else {
        return Vec::new();
    };
    let required: Vec<&str> = manifest
        .config_schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut fields = Vec::with_capacity(properties.len());
    for (key, prop) in properties {
        let declared_type = prop.get("type").and_then(|v| v.as_str()).unwrap_or("string");
        let sensitive = prop
            .get("sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let options = select_options(prop);

        let field_type = if !options.is_empty() {
            ConfigFieldType::Select
        } else {
            match declared_type {
                "number" | "integer" => ConfigFieldType::Number,
                "boolean" => ConfigFieldType::Boolean,
                _ if sensitive => ConfigFieldType::Password,
                _ => ConfigFieldType::Text,
            }
        };

        let label = prop
            .get("label")
            .or_else(|| prop.get("title"))
            .and_then(|v| v.as_str())
            .unwrap_or(key)
            .to_string();

        fields.push(ConfigField {
            key: key.clone(),
            label,
            field_type,
            required: required.contains(&key.as_str())
                || prop.get("required").and_then(|v| v.as_bool()).unwrap_or(false),
            placeholder: prop
                .get("placeholder")
                .and_then(|v| v.as_str())
                .map(String::from),
            description: prop
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
            options,
            default: prop.get("default").map(|v| v.to_string()),
        });
    }
    fields
}

fn select_options(prop: &serde_json::Value) -> Vec<ConfigFieldOption> {
    if let Some(options) = prop.get("options").and_then(|v| v.as_array()) {
        return options
            .iter()
            .filter_map(|opt| {
                if let Some(s) = opt.as_str() {
                    Some(ConfigFieldOption {
                        value: s.to_string(),
                        label: s.to_string(),
                    })
                } else {
                    let value = opt.get("value")?.as_str()?.to_string();
                    let label = opt
                        .get("label")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&value)
                        .to_string();
                    Some(ConfigFieldOption { value, label })
                }
            })
            .collect();
    }
    if let Some(variants) = prop.get("enum").and_then(|v| v.as_array()) {
        return variants
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| ConfigFieldOption {
                value: s.to_string(),
                label: s.to_string(),
            })
            .collect();
    }
    Vec::new()
}
