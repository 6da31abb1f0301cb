//! Atomic file replacement.

use std::path::Path;

use crate::error::{HarvestError, HarvestResult};

/// Replace `path` with `bytes` so readers see either the old or the new file.
///
/// Writes a uniquely named temp file in the same directory, then renames it over
/// the target. Parent directories are created as needed.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> HarvestResult<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await.map_err(|e| HarvestError::storage(dir, e))?;

    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(HarvestError::storage(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(HarvestError::storage(path, e));
    }
    Ok(())
}
