//! Write-to-temp-then-rename file replacement.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Atomically replace `path` with `bytes`.
///
/// The temp file lives in the destination directory so the final `rename`
/// never crosses a filesystem.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let written = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
        return written;
    }

    // Persist the rename itself.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
