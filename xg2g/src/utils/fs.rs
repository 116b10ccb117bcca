//! Filesystem helpers with operation + path error context.

use std::path::Path;

use sysinfo::Disks;

use crate::{Error, Result};

/// Create a directory tree, labelling failures with `op`.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("create directory", path).await
}

/// Synchronous variant for startup, before the runtime does any work.
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path("create directory", path, e))
}

/// Remove a directory tree. A directory that is already gone is not an error.
///
/// Returns whether anything was removed.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("remove directory", path, e)),
    }
}

/// Check that `dir` accepts new files by creating and removing a probe file.
pub async fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".xg2g-write-probe");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| Error::io_path("write probe file", &probe, e))?;
    tokio::fs::remove_file(&probe)
        .await
        .map_err(|e| Error::io_path("remove probe file", &probe, e))
}

/// `(available, total)` bytes of the disk with the longest mount point
/// containing `path`. Blocking.
pub fn disk_space(path: &Path) -> Option<(u64, u64)> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.available_space(), disk.total_space()))
}
