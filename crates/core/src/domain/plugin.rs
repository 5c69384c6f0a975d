// Plugin catalog domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Plugin kinds known to the catalog. Only `Tool` carries a loadable
/// runtime descriptor; every other kind is installable but rejected at
/// load time with an unsupported-kind error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Tool,
    Channel,
    Memory,
    Hook,
    Skill,
    AgentTemplate,
    Observability,
}

impl PluginKind {
    /// Parse a manifest `kind` value. Matching is case-insensitive;
    /// an absent kind defaults to `Tool` at the manifest layer.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "tool" => Some(Self::Tool),
            "channel" => Some(Self::Channel),
            "memory" => Some(Self::Memory),
            "hook" => Some(Self::Hook),
            "skill" => Some(Self::Skill),
            "agent-template" => Some(Self::AgentTemplate),
            "observability" => Some(Self::Observability),
            _ => None,
        }
    }

    pub fn is_loadable(&self) -> bool {
        matches!(self, Self::Tool)
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tool => "tool",
            Self::Channel => "channel",
            Self::Memory => "memory",
            Self::Hook => "hook",
            Self::Skill => "skill",
            Self::AgentTemplate => "agent-template",
            Self::Observability => "observability",
        };
        write!(f, "{s}")
    }
}

/// Pricing attached to a catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PricingModel {
    #[default]
    Free,
    OneTime,
    Subscription,
}

/// Catalog row for a plugin package. Created or updated by the installer
/// on a source-based install; may also be pre-seeded externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginPackage {
    pub id: String,
    pub name: String,
    pub kind: PluginKind,
    pub description: String,
    pub author: String,
    pub version: String,
    #[serde(default)]
    pub pricing_model: PricingModel,
    #[serde(default)]
    pub price_cents: u64,
    #[serde(default)]
    pub install_count: u64,
}

impl PluginPackage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            description: String::new(),
            author: String::new(),
            version: String::new(),
            pricing_model: PricingModel::Free,
            price_cents: 0,
            install_count: 0,
        }
    }
}

/// Field types a plugin config schema can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFieldType {
    Text,
    Password,
    Number,
    Boolean,
    Select,
}

/// One option of a select field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFieldOption {
    pub value: String,
    pub label: String,
}

/// A single configuration field derived from the manifest's declared
/// schema properties plus UI hints. Keys are unique within one schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: ConfigFieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ConfigFieldOption>,
    /// JSON-encoded default value, if the schema declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Sidecar metadata file, one per plugin id, written next to the install
/// directory after manifest parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadataFile {
    pub display_name: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub config_fields: Vec<ConfigField>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_type: Option<String>,
    pub source_spec: Option<String>,
    pub install_path: PathBuf,
}
