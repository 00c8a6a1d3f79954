//! BLAKE3 digests and integrity checks for task artifacts.
//!
//! An artifact is either a single file or a directory. Directories are
//! hashed over their files in sorted relative-path order, path bytes first,
//! so the digest does not depend on directory iteration order.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use forge_types::ArtifactRef;

use crate::error::{Result, StoreError};

/// Return `(size_bytes, blake3_hex)` for a file or directory artifact.
pub fn digest_path(path: &Path) -> Result<(u64, String)> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.display().to_string()));
    }

    let mut hasher = blake3::Hasher::new();
    let mut total = 0u64;

    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, &mut files)?;
        files.sort();
        for file in files {
            let rel = file.strip_prefix(path).unwrap_or(&file);
            hasher.update(rel.to_string_lossy().as_bytes());
            total += hash_file(&file, &mut hasher)?;
        }
    } else {
        total = hash_file(path, &mut hasher)?;
    }

    Ok((total, hasher.finalize().to_hex().to_string()))
}

/// Verify that an artifact on disk still matches its recorded digest.
pub fn verify_artifact(artifact: &ArtifactRef) -> Result<()> {
    let (_, actual) = digest_path(&artifact.path)?;
    if actual != artifact.blake3_hash {
        return Err(StoreError::IntegrityMismatch {
            path: artifact.path.display().to_string(),
            expected: artifact.blake3_hash.clone(),
            actual,
        });
    }
    Ok(())
}

fn hash_file(path: &Path, hasher: &mut blake3::Hasher) -> Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_digest_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmm.mmf");
        fs::write(&path, b"~o <VECSIZE> 39").unwrap();

        let (size, hex) = digest_path(&path).unwrap();
        assert_eq!(size, 15);
        assert_eq!(hex, blake3::hash(b"~o <VECSIZE> 39").to_hex().to_string());
    }

    #[test]
    fn directory_digest_is_order_independent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("x"), b"1").unwrap();
        fs::write(a.path().join("y"), b"2").unwrap();
        fs::write(b.path().join("y"), b"2").unwrap();
        fs::write(b.path().join("x"), b"1").unwrap();

        assert_eq!(digest_path(a.path()).unwrap(), digest_path(b.path()).unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acc.0");
        fs::write(&path, b"accumulators").unwrap();
        let (size, hash) = digest_path(&path).unwrap();
        let artifact = ArtifactRef {
            task_id: "t".into(),
            path: path.clone(),
            size_bytes: size,
            blake3_hash: hash,
        };
        verify_artifact(&artifact).unwrap();

        fs::write(&path, b"tampered").unwrap();
        let err = verify_artifact(&artifact).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let err = digest_path(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
