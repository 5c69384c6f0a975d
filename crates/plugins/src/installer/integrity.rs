// Package integrity hashing and verification
//
// Digests are computed over the exact bytes/tree used to decide
// installation, before any subsequent mutation. Directory hashes are
// enumeration-order independent: sorted relative paths plus contents.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("unrecognized integrity string '{0}'")]
    UnrecognizedFormat(String),

    #[error("integrity mismatch ({algorithm}): expected {expected}, computed {actual}")]
    Mismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("IO error while hashing: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to walk package tree: {0}")]
    Walk(#[from] walkdir::Error),
}

/// SHA-256 and SHA-512 digests over one package.
#[derive(Debug, Clone)]
pub struct PackageHashes {
    sha256: Vec<u8>,
    sha512: Vec<u8>,
}

impl PackageHashes {
    pub fn sha256_hex(&self) -> String {
        hex(&self.sha256)
    }

    pub fn sha512_hex(&self) -> String {
        hex(&self.sha512)
    }

    /// Subresource-integrity form of the sha256 digest.
    pub fn sha256_sri(&self) -> String {
        format!("sha256-{}", BASE64.encode(&self.sha256))
    }

    pub fn sha512_sri(&self) -> String {
        format!("sha512-{}", BASE64.encode(&self.sha512))
    }
}

/// Hash an archive's raw bytes (pre-extraction).
pub async fn hash_file(path: &Path) -> Result<PackageHashes, IntegrityError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(PackageHashes {
        sha256: Sha256::digest(&bytes).to_vec(),
        sha512: Sha512::digest(&bytes).to_vec(),
    })
}

/// Hash a directory tree deterministically. Every regular file's
/// normalized relative path and contents feed both hashers, in sorted
/// path order, so the result does not depend on enumeration order.
pub async fn hash_directory(root: &Path) -> Result<PackageHashes, IntegrityError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push((relative, entry.path().to_path_buf()));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    for (relative, path) in files {
        let contents = tokio::fs::read(&path).await?;
        sha256.update(relative.as_bytes());
        sha256.update([0u8]);
        sha256.update(&contents);
        sha512.update(relative.as_bytes());
        sha512.update([0u8]);
        sha512.update(&contents);
    }
    Ok(PackageHashes {
        sha256: sha256.finalize().to_vec(),
        sha512: sha512.finalize().to_vec(),
    })
}

enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

/// Verify a caller-supplied integrity string against the computed
/// hashes. Accepted encodings: SRI (`sha256-<b64>`), algorithm-prefixed
/// hex (`sha512:<hex>`), bare hex (length-inferred) and bare base64
/// digests. Returns the canonical SRI form of the matched digest.
pub fn verify_expected(
    expected: &str,
    hashes: &PackageHashes,
) -> Result<String, IntegrityError> {
    let trimmed = expected.trim();
    let (algorithm, digest) =
        parse_expected(trimmed).ok_or_else(|| IntegrityError::UnrecognizedFormat(expected.to_string()))?;

    let (actual, canonical) = match algorithm {
        Algorithm::Sha256 => (&hashes.sha256, hashes.sha256_sri()),
        Algorithm::Sha512 => (&hashes.sha512, hashes.sha512_sri()),
    };
    if &digest == actual {
        Ok(canonical)
    } else {
        Err(IntegrityError::Mismatch {
            algorithm: algorithm.name(),
            expected: trimmed.to_string(),
            actual: hex(actual),
        })
    }
}

fn parse_expected(raw: &str) -> Option<(Algorithm, Vec<u8>)> {
    if let Some(rest) = raw.strip_prefix("sha256-") {
        return BASE64.decode(rest).ok().map(|d| (Algorithm::Sha256, d));
    }
    if let Some(rest) = raw.strip_prefix("sha512-") {
        return BASE64.decode(rest).ok().map(|d| (Algorithm::Sha512, d));
    }
    if let Some(rest) = raw.strip_prefix("sha256:") {
        return decode_hex(rest).map(|d| (Algorithm::Sha256, d));
    }
    if let Some(rest) = raw.strip_prefix("sha512:") {
        return decode_hex(rest).map(|d| (Algorithm::Sha512, d));
    }
    // Bare hex, length-inferred.
    if raw.len() == 64 || raw.len() == 128 {
        if let Some(digest) = decode_hex(raw) {
            let algorithm = if raw.len() == 64 {
                Algorithm::Sha256
            } else {
                Algorithm::Sha512
            };
            return Some((algorithm, digest));
        }
    }
    // Bare base64, length-inferred from the decoded digest.
    if let Ok(digest) = BASE64.decode(raw) {
        match digest.len() {
            32 => return Some((Algorithm::Sha256, digest)),
            64 => return Some((Algorithm::Sha512, digest)),
            _ => {}
        }
    }
    None
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directory_hash_ignores_enumeration_order() {
        // Write the same tree twice with different creation order; the
        // digests must agree.
        let first = tempdir().expect("tempdir");
        fs::create_dir(first.path().join("sub")).expect("mkdir");
        fs::write(first.path().join("a.txt"), b"alpha").expect("write");
        fs::write(first.path().join("sub/b.txt"), b"beta").expect("write");

        let second = tempdir().expect("tempdir");
        fs::create_dir(second.path().join("sub")).expect("mkdir");
        fs::write(second.path().join("sub/b.txt"), b"beta").expect("write");
        fs::write(second.path().join("a.txt"), b"alpha").expect("write");

        let h1 = hash_directory(first.path()).await.expect("hash");
        let h2 = hash_directory(second.path()).await.expect("hash");
        assert_eq!(h1.sha256_hex(), h2.sha256_hex());
        assert_eq!(h1.sha512_hex(), h2.sha512_hex());
    }

    #[tokio::test]
    async fn directory_hash_tracks_content_changes() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"alpha").expect("write");
        let before = hash_directory(dir.path()).await.expect("hash");

        fs::write(dir.path().join("a.txt"), b"changed").expect("write");
        let after = hash_directory(dir.path()).await.expect("hash");
        assert_ne!(before.sha256_hex(), after.sha256_hex());
    }

    #[tokio::test]
    async fn expected_integrity_encodings_all_verify() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"alpha").expect("write");
        let hashes = hash_directory(dir.path()).await.expect("hash");

        for expected in [
            hashes.sha256_sri(),
            hashes.sha512_sri(),
            format!("sha256:{}", hashes.sha256_hex()),
            format!("sha512:{}", hashes.sha512_hex()),
            hashes.sha256_hex(),
            hashes.sha512_hex(),
        ] {
            let resolved = verify_expected(&expected, &hashes)
                .unwrap_or_else(|e| panic!("encoding {expected:?} failed: {e}"));
            assert!(resolved.starts_with("sha256-") || resolved.starts_with("sha512-"));
        }
    }

    #[tokio::test]
    async fn mismatch_is_reported_with_algorithm() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"alpha").expect("write");
        let hashes = hash_directory(dir.path()).await.expect("hash");

        let bogus = format!("sha256:{}", "0".repeat(64));
        match verify_expected(&bogus, &hashes) {
            Err(IntegrityError::Mismatch { algorithm, .. }) => assert_eq!(algorithm, "sha256"),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn garbage_integrity_is_unrecognized() {
        let hashes = PackageHashes {
            sha256: vec![0; 32],
            sha512: vec![0; 64],
        };
        for bad in ["md5:abcd", "zz", "sha256-!!!", "sha256:xyz"] {
            assert!(matches!(
                verify_expected(bad, &hashes),
                Err(IntegrityError::UnrecognizedFormat(_))
            ));
        }
    }
}
