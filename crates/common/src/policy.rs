// Install source policy
//
// Operator-configured whitelists gating what the installer may fetch.
// Everything is optional; an empty policy is fully permissive.

use plughost_core::SourceType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("source type '{0}' is not allowed by install policy")]
    SourceTypeNotAllowed(SourceType),

    #[error("registry spec '{0}' is not a valid package spec (expected name[@version])")]
    InvalidRegistrySpec(String),

    #[error("registry spec '{0}' does not match any allowed pattern")]
    RegistrySpecNotAllowed(String),

    #[error("local source path '{0}' could not be resolved: {1}")]
    UnresolvablePath(PathBuf, std::io::Error),

    #[error("local source path '{0}' is outside every allowed root")]
    PathNotAllowed(PathBuf),
}

/// Whitelist policy applied before any install I/O happens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallPolicy {
    /// Allowed source types. Empty = all types allowed.
    #[serde(default)]
    pub allowed_source_types: Vec<SourceType>,
    /// Allowed registry package names. A trailing `*` makes the entry a
    /// prefix match; otherwise the name must match exactly. Empty = any
    /// well-formed spec allowed.
    #[serde(default)]
    pub allowed_registry_specs: Vec<String>,
    /// Roots a path/archive source must resolve under. Empty = any path.
    #[serde(default)]
    pub allowed_local_roots: Vec<PathBuf>,
}

impl InstallPolicy {
    pub fn check_source_type(&self, source_type: SourceType) -> Result<(), PolicyError> {
        if self.allowed_source_types.is_empty()
            || self.allowed_source_types.contains(&source_type)
        {
            Ok(())
        } else {
            Err(PolicyError::SourceTypeNotAllowed(source_type))
        }
    }

    /// Validate a registry spec and apply the allow-pattern list.
    /// Returns the package name (without version suffix).
    pub fn check_registry_spec(&self, spec: &str) -> Result<String, PolicyError> {
        let name = parse_registry_spec(spec)
            .ok_or_else(|| PolicyError::InvalidRegistrySpec(spec.to_string()))?;
        if self.allowed_registry_specs.is_empty() {
            return Ok(name);
        }
        let allowed = self.allowed_registry_specs.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name == *pattern
            }
        });
        if allowed {
            Ok(name)
        } else {
            Err(PolicyError::RegistrySpecNotAllowed(spec.to_string()))
        }
    }

    /// Resolve a local path/archive spec and require containment in one
    /// of the allowed roots when roots are configured. Returns the
    /// canonical absolute path.
    pub fn check_local_path(&self, raw: &Path) -> Result<PathBuf, PolicyError> {
        let resolved = raw
            .canonicalize()
            .map_err(|e| PolicyError::UnresolvablePath(raw.to_path_buf(), e))?;
        if self.allowed_local_roots.is_empty() {
            return Ok(resolved);
        }
        for root in &self.allowed_local_roots {
            let Ok(root) = root.canonicalize() else {
                continue;
            };
            if resolved.starts_with(&root) {
                return Ok(resolved);
            }
        }
        Err(PolicyError::PathNotAllowed(resolved))
    }
}

/// Parse a strict `name[@version]` registry spec. URLs, filesystem
/// paths, and git refs are rejected outright. Returns the bare name.
fn parse_registry_spec(spec: &str) -> Option<String> {
    if spec.is_empty()
        || spec.contains("://")
        || spec.starts_with("git+")
        || spec.chars().any(char::is_whitespace)
    {
        return None;
    }
    if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with('~') {
        return None;
    }

    // Scoped names start with '@'; the version separator is any later '@'.
    let (name, version) = match spec[1..].find('@') {
        Some(idx) => (&spec[..idx + 1], Some(&spec[idx + 2..])),
        None => (spec, None),
    };

    if !is_valid_package_name(name) {
        return None;
    }
    if let Some(version) = version {
        if version.is_empty() || !version.chars().all(is_version_char) {
            return None;
        }
    }
    Some(name.to_string())
}

fn is_valid_package_name(name: &str) -> bool {
    let unscoped = match name.strip_prefix('@') {
        Some(rest) => {
            let mut parts = rest.splitn(2, '/');
            let scope = parts.next().unwrap_or_default();
            let Some(pkg) = parts.next() else {
                return false;
            };
            if !is_valid_name_segment(scope) {
                return false;
            }
            pkg
        }
        None => name,
    };
    // Unscoped part may not itself contain '/'.
    !unscoped.contains('/') && is_valid_name_segment(unscoped)
}

fn is_valid_name_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.starts_with('_')
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-._~".contains(c))
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ".-+".contains(c)
}
