// Installed-plugin rows and install provenance records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of an installed plugin row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Enabled,
    Disabled,
    Error,
    Updating,
}

impl PluginStatus {
    /// Normalize a raw status string. Legacy aliases from older control
    /// planes are accepted: `active` means enabled, `inactive`/`paused`
    /// mean disabled.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "enabled" | "active" => Some(Self::Enabled),
            "disabled" | "inactive" | "paused" => Some(Self::Disabled),
            "error" => Some(Self::Error),
            "updating" => Some(Self::Updating),
            _ => None,
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Updating => "updating",
        };
        write!(f, "{s}")
    }
}

/// One plugin installed into one workspace. Conceptually unique per
/// (workspace_id, plugin_id); uniqueness is enforced by a
/// lookup-then-insert check rather than a storage constraint, so callers
/// must treat "already installed" as race-prone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPlugin {
    pub id: Uuid,
    pub workspace_id: String,
    pub plugin_id: String,
    pub status: PluginStatus,
    /// Arbitrary JSON object holding per-workspace plugin configuration.
    pub config: serde_json::Value,
    pub installed_at: DateTime<Utc>,
    pub installed_by: Option<String>,
}

/// Where plugin code came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    RegistryPackage,
    Path,
    Archive,
}

impl SourceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "registry-package" | "registry" => Some(Self::RegistryPackage),
            "path" => Some(Self::Path),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RegistryPackage => "registry-package",
            Self::Path => "path",
            Self::Archive => "archive",
        };
        write!(f, "{s}")
    }
}

/// Provenance record for a source-based install. Absent for pre-seeded
/// installs that never went through the fetch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstallRecord {
    pub installed_plugin_id: Uuid,
    pub source_type: SourceType,
    pub source_spec: String,
    /// Registry installs only: the spec after resolution (exact version).
    pub resolved_spec: Option<String>,
    pub resolved_version: Option<String>,
    /// Integrity string supplied by the caller, if any.
    pub expected_integrity: Option<String>,
    /// Integrity string the verified digest resolves to.
    pub resolved_integrity: Option<String>,
    /// Primary content checksum (sha256 hex) over the final package.
    pub checksum: String,
    pub sha256: String,
    pub sha512: String,
    pub install_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalization_accepts_legacy_aliases() {
        assert_eq!(PluginStatus::normalize("active"), Some(PluginStatus::Enabled));
        assert_eq!(PluginStatus::normalize("INACTIVE"), Some(PluginStatus::Disabled));
        assert_eq!(PluginStatus::normalize("paused"), Some(PluginStatus::Disabled));
        assert_eq!(PluginStatus::normalize("updating"), Some(PluginStatus::Updating));
        assert_eq!(PluginStatus::normalize("bogus"), None);
    }

    #[test]
    fn source_type_round_trips() {
        for raw in ["registry-package", "path", "archive"] {
            let parsed = SourceType::parse(raw).expect("known source type");
            assert_eq!(parsed.to_string(), raw);
        }
        assert_eq!(SourceType::parse("registry"), Some(SourceType::RegistryPackage));
        assert_eq!(SourceType::parse("git"), None);
    }
}
