// Manifest Validation Engine
//
// Pure function of file contents: any violation fails synchronously with
// a descriptive error and no partial state. Entry-path rules run before
// any filesystem access touches the entry file.

use super::schema::{PluginManifest, MANIFEST_FILE};
use common::paths::is_strict_descendant;
use plughost_core::PluginKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Extensions the runtime knows how to execute.
pub const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "py"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found at {0}")]
    Missing(PathBuf),

    #[error("IO error reading manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("manifest id must be a non-empty string")]
    EmptyId,

    #[error("unknown plugin kind '{0}'")]
    UnknownKind(String),

    #[error("tool manifest requires runtime.tool.entry and runtime.tool.export_name")]
    MissingToolRuntime,

    #[error("unsafe entry path '{0}': {1}")]
    UnsafeEntryPath(String, &'static str),

    #[error("entry path '{0}' has no recognized script extension")]
    UnrecognizedExtension(String),

    #[error("invalid export name '{0}'")]
    InvalidExportName(String),

    #[error("resolved entry '{0}' escapes the install directory")]
    EntryEscapesInstallDir(PathBuf),

    #[error("entry file not found: {0}")]
    EntryNotFound(PathBuf),
}

/// Outcome of a successful validation pass.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    pub manifest: PluginManifest,
    pub kind: PluginKind,
    /// Canonical absolute entry path; present for tool manifests when
    /// resolution ran against the install directory.
    pub tool_entry: Option<PathBuf>,
    pub export_name: Option<String>,
}

/// Manifest validator shared by installer and loader.
pub struct ManifestValidator {
    check_file_existence: bool,
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestValidator {
    pub fn new() -> Self {
        Self {
            check_file_existence: true,
        }
    }

    /// Disable entry-file resolution; structural checks still run.
    pub fn with_file_existence_check(mut self, check: bool) -> Self {
        self.check_file_existence = check;
        self
    }

    /// Read and validate `plugin.json` inside `install_dir`.
    pub fn validate_dir(&self, install_dir: &Path) -> Result<ValidatedManifest, ManifestError> {
        let manifest_path = install_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(ManifestError::Missing(manifest_path));
        }
        let raw = std::fs::read_to_string(&manifest_path)?;
        let manifest: PluginManifest = serde_json::from_str(&raw)?;
        debug!("validating manifest for plugin '{}'", manifest.id);
        self.validate_manifest(manifest, Some(install_dir))
    }

    /// Validate an already-parsed manifest. `install_dir` enables entry
    /// resolution for tool manifests.
    pub fn validate_manifest(
        &self,
        manifest: PluginManifest,
        install_dir: Option<&Path>,
    ) -> Result<ValidatedManifest, ManifestError> {
        if manifest.id.trim().is_empty() {
            return Err(ManifestError::EmptyId);
        }

        let kind = match manifest.kind.as_deref() {
            None => PluginKind::Tool,
            Some(raw) => {
                PluginKind::parse(raw).ok_or_else(|| ManifestError::UnknownKind(raw.to_string()))?
            }
        };

        let mut tool_entry = None;
        let mut export_name = None;
        if kind == PluginKind::Tool {
            let runtime = manifest
                .runtime
                .tool
                .as_ref()
                .ok_or(ManifestError::MissingToolRuntime)?;
            if runtime.entry.trim().is_empty() || runtime.export_name.trim().is_empty() {
                return Err(ManifestError::MissingToolRuntime);
            }

            // Structural path checks run before any stat of the entry.
            let normalized = validate_entry_path(&runtime.entry)?;
            validate_export_name(&runtime.export_name)?;
            export_name = Some(runtime.export_name.clone());

            if self.check_file_existence {
                if let Some(dir) = install_dir {
                    tool_entry = Some(resolve_tool_entry(dir, &normalized)?);
                }
            }
        }

        Ok(ValidatedManifest {
            manifest,
            kind,
            tool_entry,
            export_name,
        })
    }
}

/// Normalize and check an entry path without touching the filesystem.
/// Returns the separator-normalized relative path.
pub fn validate_entry_path(entry: &str) -> Result<String, ManifestError> {
    let normalized = entry.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(ManifestError::UnsafeEntryPath(
            entry.to_string(),
            "absolute paths are not allowed",
        ));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(ManifestError::UnsafeEntryPath(
            entry.to_string(),
            "drive-qualified paths are not allowed",
        ));
    }
    for segment in normalized.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ManifestError::UnsafeEntryPath(
                entry.to_string(),
                "path traversal segments are not allowed",
            ));
        }
    }

    let has_known_extension = normalized
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| SCRIPT_EXTENSIONS.contains(&ext))
        .unwrap_or(false);
    if !has_known_extension {
        return Err(ManifestError::UnrecognizedExtension(entry.to_string()));
    }

    Ok(normalized)
}

/// `default` or an identifier: `[A-Za-z_$][A-Za-z0-9_$]*`.
pub fn validate_export_name(name: &str) -> Result<(), ManifestError> {
    if name == "default" {
        return Ok(());
    }
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        .unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(ManifestError::InvalidExportName(name.to_string()))
    }
}

/// Resolve a pre-validated entry path against the install directory and
/// re-check containment on the canonical result (symlink defense).
pub fn resolve_tool_entry(install_dir: &Path, entry: &str) -> Result<PathBuf, ManifestError> {
    let root = install_dir.canonicalize().map_err(ManifestError::Io)?;
    let candidate = root.join(entry);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| ManifestError::EntryNotFound(candidate.clone()))?;
    if !is_strict_descendant(&resolved, &root) {
        return Err(ManifestError::EntryEscapesInstallDir(resolved));
    }
    if !resolved.is_file() {
        return Err(ManifestError::EntryNotFound(resolved));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::schema::{RuntimeSection, ToolRuntime};
    use std::fs;
    use tempfile::tempdir;

    fn tool_manifest(entry: &str, export_name: &str) -> PluginManifest {
        PluginManifest {
            id: "demo".to_string(),
            kind: Some("tool".to_string()),
            name: Some("Demo".to_string()),
            version: Some("1.0.0".to_string()),
            description: None,
            author: None,
            tags: Vec::new(),
            permissions: Vec::new(),
            runtime: RuntimeSection {
                tool: Some(ToolRuntime {
                    entry: entry.to_string(),
                    export_name: export_name.to_string(),
                }),
            },
            config_schema: serde_json::Value::Null,
        }
    }

    #[test]
    fn traversal_entries_rejected_without_io() {
        for entry in [
            "../../etc/passwd",
            "..\\..\\windows\\system32\\cmd.js",
            "/abs/entry.js",
            "C:\\tools\\entry.js",
            "dir/../entry.js",
            "dir//entry.js",
            "./entry.js",
        ] {
            let result = validate_entry_path(entry);
            assert!(result.is_err(), "expected rejection for {entry:?}");
        }
    }

    #[test]
    fn recognized_extensions_only() {
        assert!(validate_entry_path("dist/index.js").is_ok());
        assert!(validate_entry_path("tool.py").is_ok());
        assert!(matches!(
            validate_entry_path("binary.exe"),
            Err(ManifestError::UnrecognizedExtension(_))
        ));
        assert!(matches!(
            validate_entry_path("no_extension"),
            Err(ManifestError::UnrecognizedExtension(_))
        ));
    }

    #[test]
    fn export_names() {
        assert!(validate_export_name("default").is_ok());
        assert!(validate_export_name("runTool").is_ok());
        assert!(validate_export_name("_private$2").is_ok());
        assert!(validate_export_name("2fast").is_err());
        assert!(validate_export_name("with-dash").is_err());
        assert!(validate_export_name("").is_err());
    }

    #[test]
    fn validate_dir_happy_path() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("index.js"), "module.exports = {};").expect("entry");
        let manifest = tool_manifest("index.js", "default");
        fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_string(&manifest).expect("serialize"),
        )
        .expect("manifest");

        let validated = ManifestValidator::new()
            .validate_dir(dir.path())
            .expect("valid manifest");
        assert_eq!(validated.kind, PluginKind::Tool);
        assert!(validated.tool_entry.expect("entry resolved").ends_with("index.js"));
        assert_eq!(validated.export_name.as_deref(), Some("default"));
    }

    #[test]
    fn missing_tool_runtime_is_an_error() {
        let mut manifest = tool_manifest("index.js", "default");
        manifest.runtime = RuntimeSection::default();
        let result = ManifestValidator::new().validate_manifest(manifest, None);
        assert!(matches!(result, Err(ManifestError::MissingToolRuntime)));
    }

    #[test]
    fn traversal_entry_rejected_before_any_stat() {
        let dir = tempdir().expect("tempdir");
        let manifest = tool_manifest("../../etc/passwd", "default");
        fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_string(&manifest).expect("serialize"),
        )
        .expect("manifest");

        // The entry file obviously does not exist; validation still must
        // fail on the path shape, not on a stat result.
        let result = ManifestValidator::new().validate_dir(dir.path());
        assert!(matches!(result, Err(ManifestError::UnsafeEntryPath(..))));
    }

    #[test]
    fn non_tool_kinds_skip_runtime_requirements() {
        let mut manifest = tool_manifest("index.js", "default");
        manifest.kind = Some("channel".to_string());
        manifest.runtime = RuntimeSection::default();
        let validated = ManifestValidator::new()
            .validate_manifest(manifest, None)
            .expect("channel manifests need no runtime");
        assert_eq!(validated.kind, PluginKind::Channel);
        assert!(validated.tool_entry.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_entry_outside_install_dir_is_rejected() {
        let install = tempdir().expect("tempdir");
        let outside = tempdir().expect("tempdir");
        let secret = outside.path().join("secret.js");
        fs::write(&secret, "exports.x = 1;").expect("secret");
        std::os::unix::fs::symlink(&secret, install.path().join("entry.js")).expect("symlink");

        let result = resolve_tool_entry(install.path(), "entry.js");
        assert!(matches!(result, Err(ManifestError::EntryEscapesInstallDir(_))));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut manifest = tool_manifest("index.js", "default");
        manifest.kind = Some("widget".to_string());
        let result = ManifestValidator::new().validate_manifest(manifest, None);
        assert!(matches!(result, Err(ManifestError::UnknownKind(_))));
    }
}
