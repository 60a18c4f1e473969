use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ArchiveError;

/// Destination path for an archived copy of a recording:
/// `<root>/Documents/ai_recorder/<yyyy-MM-dd>/recording_<unix-secs>_<HHmmss>.wav`,
/// where `unix_secs` is the recording's creation time in epoch seconds.
pub fn archive_path(archive_root: &Path, unix_secs: i64) -> PathBuf {
    let now = Local::now();
    archive_root
        .join("Documents")
        .join("ai_recorder")
        .join(now.format("%Y-%m-%d").to_string())
        .join(format!(
            "recording_{}_{}.wav",
            unix_secs,
            now.format("%H%M%S")
        ))
}

/// Copy a finished recording into the archive tree.
///
/// The export is best-effort by contract: callers log failures and carry
/// on, and a failed export never affects the recording it copies. An
/// existing file at the destination is replaced.
pub fn export(src: &Path, unix_secs: i64, archive_root: &Path) -> Result<PathBuf, ArchiveError> {
    if !archive_root.is_dir() {
        return Err(ArchiveError::TargetUnavailable(archive_root.to_path_buf()));
    }
    if !src.exists() {
        return Err(ArchiveError::SourceMissing(src.to_path_buf()));
    }

    let dest = archive_path(archive_root, unix_secs);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::copy(src, &dest).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ArchiveError::SourceUnreadable(src.to_path_buf())
        } else {
            ArchiveError::Io(e)
        }
    })?;

    info!(src = %src.display(), dest = %dest.display(), "recording archived");
    Ok(dest)
}
