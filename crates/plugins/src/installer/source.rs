// Source staging for the installer
//
// Registry packages are packed via the ecosystem package manager,
// archives are extracted with the platform tar/unzip utilities, and
// directory paths are used as-is. Every child process runs under a hard
// timeout and is killed on expiry - the installer's only real
// parallelism boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::manifest::MANIFEST_FILE;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exceeded the {timeout_ms}ms timeout and was killed")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("package manager produced no archive for spec '{0}'")]
    NoPackOutput(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),

    #[error("no manifest found in staged package at {0}")]
    ManifestNotFound(PathBuf),

    #[error("ambiguous package layout: multiple manifest candidates ({0})")]
    AmbiguousRoot(String),

    #[error("IO error while staging: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs installer child processes under one hard timeout.
#[derive(Debug, Clone)]
pub struct ChildProcessRunner {
    timeout: Duration,
}

impl ChildProcessRunner {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Run `program` to completion, capturing stdout. On timeout the
    /// process is forcibly killed and the operation fails.
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
    ) -> Result<String, SourceError> {
        debug!("spawning '{program} {}' in {}", args.join(" "), cwd.display());
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(result) => result.map_err(|source| SourceError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                // kill_on_drop reaps the child when the future above is
                // dropped by the timeout.
                warn!("'{program}' timed out after {:?}", self.timeout);
                return Err(SourceError::Timeout {
                    program: program.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if !output.status.success() {
            return Err(SourceError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Pack a registry spec into a tarball inside `dest` using the
/// configured package manager, with dependency scripts disabled.
/// Returns the produced archive path.
pub async fn pack_registry_spec(
    runner: &ChildProcessRunner,
    package_manager: &str,
    spec: &str,
    dest: &Path,
) -> Result<PathBuf, SourceError> {
    let dest_str = dest.to_string_lossy().to_string();
    let stdout = runner
        .run(
            package_manager,
            &[
                "pack",
                spec,
                "--ignore-scripts",
                "--pack-destination",
                &dest_str,
            ],
            dest,
        )
        .await?;

    // The pack command prints the tarball filename as its last line.
    let tarball = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .next_back()
        .map(|line| dest.join(line.trim()))
        .filter(|path| path.is_file())
        .ok_or_else(|| SourceError::NoPackOutput(spec.to_string()))?;
    Ok(tarball)
}

/// Extract an archive into `dest` using the platform utilities.
pub async fn extract_archive(
    runner: &ChildProcessRunner,
    archive: &Path,
    dest: &Path,
) -> Result<(), SourceError> {
    tokio::fs::create_dir_all(dest).await?;
    let archive_str = archive.to_string_lossy().to_string();
    let dest_str = dest.to_string_lossy().to_string();
    let name = archive.to_string_lossy().to_lowercase();

    if name.ends_with(".zip") {
        runner
            .run("unzip", &["-q", "-o", &archive_str, "-d", &dest_str], dest)
            .await?;
    } else if name.ends_with(".tar")
        || name.ends_with(".tgz")
        || name.ends_with(".tar.gz")
        || name.ends_with(".tar.bz2")
        || name.ends_with(".tar.xz")
    {
        runner
            .run("tar", &["-xf", &archive_str, "-C", &dest_str], dest)
            .await?;
    } else {
        return Err(SourceError::UnsupportedArchive(archive.to_path_buf()));
    }
    Ok(())
}

/// Locate the manifest within a staged tree: the root itself, the
/// well-known `package/` pack subdirectory, or the unique immediate
/// subdirectory containing the manifest. More than one candidate is a
/// hard error.
pub fn discover_manifest_root(staged: &Path) -> Result<PathBuf, SourceError> {
    let mut candidates = Vec::new();
    if staged.join(MANIFEST_FILE).is_file() {
        candidates.push(staged.to_path_buf());
    }
    for entry in std::fs::read_dir(staged)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
            candidates.push(path);
        }
    }

    match candidates.len() {
        0 => Err(SourceError::ManifestNotFound(staged.to_path_buf())),
        1 => Ok(candidates.remove(0)),
        _ => Err(SourceError::AmbiguousRoot(
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )),
    }
}

/// Install production dependencies declared by the staged package, with
/// scripts disabled, unless they are already materialized. Returns
/// whether an install ran.
pub async fn install_dependencies(
    runner: &ChildProcessRunner,
    package_manager: &str,
    dir: &Path,
) -> Result<bool, SourceError> {
    let package_json = dir.join("package.json");
    if !package_json.is_file() {
        return Ok(false);
    }
    let raw = tokio::fs::read_to_string(&package_json).await?;
    let declared: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("ignoring malformed package.json in {}: {e}", dir.display());
            return Ok(false);
        }
    };
    let has_dependencies = declared
        .get("dependencies")
        .and_then(|deps| deps.as_object())
        .map(|deps| !deps.is_empty())
        .unwrap_or(false);
    if !has_dependencies || dir.join("node_modules").is_dir() {
        return Ok(false);
    }

    runner
        .run(
            package_manager,
            &[
                "install",
                "--ignore-scripts",
                "--omit=dev",
                "--no-audit",
                "--no-fund",
            ],
            dir,
        )
        .await?;
    Ok(true)
}

/// Recursive directory copy with an explicit stack (no symlink
/// following; links are skipped).
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&target).await?;
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_prefers_single_candidate() {
        let staged = tempdir().expect("tempdir");
        fs::create_dir(staged.path().join("package")).expect("mkdir");
        fs::write(staged.path().join("package").join(MANIFEST_FILE), "{}").expect("write");

        let root = discover_manifest_root(staged.path()).expect("discover");
        assert!(root.ends_with("package"));
    }

    #[test]
    fn discovery_accepts_manifest_at_root() {
        let staged = tempdir().expect("tempdir");
        fs::write(staged.path().join(MANIFEST_FILE), "{}").expect("write");
        let root = discover_manifest_root(staged.path()).expect("discover");
        assert_eq!(root, staged.path());
    }

    #[test]
    fn discovery_rejects_multiple_candidates() {
        let staged = tempdir().expect("tempdir");
        for sub in ["one", "two"] {
            fs::create_dir(staged.path().join(sub)).expect("mkdir");
            fs::write(staged.path().join(sub).join(MANIFEST_FILE), "{}").expect("write");
        }
        assert!(matches!(
            discover_manifest_root(staged.path()),
            Err(SourceError::AmbiguousRoot(_))
        ));
    }

    #[test]
    fn discovery_rejects_empty_tree() {
        let staged = tempdir().expect("tempdir");
        assert!(matches!(
            discover_manifest_root(staged.path()),
            Err(SourceError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn copy_preserves_nested_tree() {
        let src = tempdir().expect("tempdir");
        fs::create_dir_all(src.path().join("a/b")).expect("mkdir");
        fs::write(src.path().join("top.txt"), b"top").expect("write");
        fs::write(src.path().join("a/b/deep.txt"), b"deep").expect("write");

        let dst = tempdir().expect("tempdir");
        let target = dst.path().join("copy");
        copy_dir_recursive(src.path(), &target).await.expect("copy");

        assert_eq!(fs::read(target.join("top.txt")).expect("read"), b"top");
        assert_eq!(fs::read(target.join("a/b/deep.txt")).expect("read"), b"deep");
    }

    #[tokio::test]
    async fn timed_out_child_is_killed() {
        let runner = ChildProcessRunner::new(50);
        let cwd = tempdir().expect("tempdir");
        let result = runner.run("sleep", &["5"], cwd.path()).await;
        assert!(matches!(result, Err(SourceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn failing_child_reports_stderr() {
        let runner = ChildProcessRunner::new(5_000);
        let cwd = tempdir().expect("tempdir");
        let result = runner.run("ls", &["/definitely/not/a/path"], cwd.path()).await;
        assert!(matches!(result, Err(SourceError::Failed { .. })));
    }

    #[tokio::test]
    async fn dependency_pass_skips_without_declarations() {
        let runner = ChildProcessRunner::new(1_000);
        let dir = tempdir().expect("tempdir");
        // No package.json at all.
        assert!(!install_dependencies(&runner, "npm", dir.path())
            .await
            .expect("no-op"));

        // Empty dependency table.
        fs::write(dir.path().join("package.json"), r#"{"dependencies": {}}"#).expect("write");
        assert!(!install_dependencies(&runner, "npm", dir.path())
            .await
            .expect("no-op"));

        // Already materialized.
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"left-pad": "^1.0.0"}}"#,
        )
        .expect("write");
        fs::create_dir(dir.path().join("node_modules")).expect("mkdir");
        assert!(!install_dependencies(&runner, "npm", dir.path())
            .await
            .expect("no-op"));
    }
}
