use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

/// Rewrites `path` through a sibling temp file and a rename, so a concurrent
/// reader sees either the old document or the new one, never a torn write.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let temp_path = sibling_temp_path(path, parent);
    fs::write(&temp_path, content)
        .with_context(|| format!("failed to stage {}", temp_path.display()))?;
    if let Err(error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error)
            .with_context(|| format!("failed to replace {} atomically", path.display()));
    }
    Ok(())
}

// The temp file must live on the same filesystem as the destination for the
// rename to stay atomic, hence a sibling rather than a system temp dir.
fn sibling_temp_path(path: &Path, parent: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("engram-state");
    parent.join(format!(
        ".{name}.{}-{}.tmp",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}
