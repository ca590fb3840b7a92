//! Primitive filesystem operations: copy/stat/mkdir/remove, xattr
//! preservation, symlink handling, and network-volume coordination.
//!
//! Every `copy`/`remove` call validates that its target stays within a
//! caller-declared allowed root (spec §4.2) before touching the
//! filesystem, and network-destination operations are serialized through
//! a per-root lock to avoid concurrent-writer corruption.

use crate::error::FileOpError;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Default per-operation timeout on network-coordinated filesystems (spec §4.2).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    pub size: u64,
    pub kind: EntryKind,
}

/// Join `relative` onto `root`, rejecting any component that would escape
/// `root` (a leading `..`, an absolute path, or a Windows prefix).
///
/// `relative` is expected to already be a normalized, non-absolute manifest
/// `relative_path`; this is a second, independent check at the FileOps
/// boundary per spec §4.2 ("every copy or remove verifies...").
pub fn join_within_root(root: &Path, relative: &Path) -> Result<PathBuf, FileOpError> {
    for component in relative.components() {
        match component {
            Component::ParentDir => {
                return Err(FileOpError::PathEscape(format!(
                    "{} escapes root {}",
                    relative.display(),
                    root.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FileOpError::PathEscape(format!(
                    "{} is not a relative path",
                    relative.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(root.join(relative))
}

/// Coordinates single-writer access to network-mounted destination roots.
#[derive(Clone)]
pub struct FileOps {
    network_locks: Arc<StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
    io_timeout: Duration,
}

impl Default for FileOps {
    fn default() -> Self {
        Self::new(DEFAULT_IO_TIMEOUT)
    }
}

impl FileOps {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            network_locks: Arc::new(StdMutex::new(HashMap::new())),
            io_timeout,
        }
    }

    fn lock_for_root(&self, root: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.network_locks.lock().expect("lock poisoned");
        locks
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    pub fn is_symlink(&self, path: &Path) -> bool {
        path.symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    pub fn attributes(&self, path: &Path) -> Result<Attributes, FileOpError> {
        let metadata = path.symlink_metadata().map_err(map_io_err)?;
        let kind = if metadata.file_type().is_symlink() {
            EntryKind::Symlink
        } else if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Ok(Attributes {
            size: metadata.len(),
            kind,
        })
    }

    pub async fn create_dir_all(&self, path: &Path) -> Result<(), FileOpError> {
        tokio::fs::create_dir_all(path).await.map_err(map_io_err)
    }

    /// Copy `src` to `dst`, both validated against their respective
    /// allowed roots. Symlink sources are a silent no-op (caller logs the
    /// `skip` event); symlinks are never followed or recreated.
    pub async fn copy(
        &self,
        src: &Path,
        src_root: &Path,
        dst: &Path,
        dst_root: &Path,
        network_destination: bool,
    ) -> Result<u64, FileOpError> {
        let src_rel = src.strip_prefix(src_root).unwrap_or(src);
        let dst_rel = dst.strip_prefix(dst_root).unwrap_or(dst);
        join_within_root(src_root, src_rel)?;
        join_within_root(dst_root, dst_rel)?;

        if self.is_symlink(src) {
            // Symlinks are a silent skip at the FileOps layer; the caller
            // is responsible for the `skip` event (spec §4.2).
            return Ok(0);
        }

        let do_copy = async {
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(map_io_err)?;
            }
            tokio::fs::copy(src, dst).await.map_err(map_io_err)
        };

        if network_destination {
            let lock = self.lock_for_root(dst_root);
            let _guard = lock.lock().await;
            with_timeout(self.io_timeout, do_copy).await
        } else {
            do_copy.await
        }
    }

    /// Remove a file or empty directory at `path`, validated against `root`.
    pub async fn remove(
        &self,
        path: &Path,
        root: &Path,
        network_destination: bool,
    ) -> Result<(), FileOpError> {
        let rel = path.strip_prefix(root).unwrap_or(path);
        join_within_root(root, rel)?;

        let do_remove = async {
            let attrs = self.attributes(path)?;
            if attrs.kind == EntryKind::Directory {
                tokio::fs::remove_dir_all(path).await.map_err(map_io_err)
            } else {
                tokio::fs::remove_file(path).await.map_err(map_io_err)
            }
        };

        if network_destination {
            let lock = self.lock_for_root(root);
            let _guard = lock.lock().await;
            with_timeout(self.io_timeout, do_remove).await
        } else {
            do_remove.await
        }
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> Result<(), FileOpError> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_io_err)?;
        }
        tokio::fs::rename(src, dst).await.map_err(map_io_err)
    }

    /// Acquire host-level permission to read/write under `path`. No-op on
    /// platforms without a scoped-access mechanism (spec §6).
    pub fn start_scoped_access(&self, _path: &Path) -> Result<(), FileOpError> {
        Ok(())
    }

    pub fn stop_scoped_access(&self, _path: &Path) {}

    /// Probe whether `path` lives on a network filesystem
    /// (SMB/AFP/NFS/WebDAV/FUSE/CIFS) by consulting `/proc/mounts` on Linux.
    /// Conservatively returns `false` when the probe is unavailable.
    pub fn is_network_volume(&self, path: &Path) -> bool {
        #[cfg(target_os = "linux")]
        {
            is_network_volume_linux(path)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = path;
            false
        }
    }

    /// Best-effort copy of non-system extended attributes from `src` to
    /// `dst`. Failure is logged at `warning` and never fails the file
    /// (spec §4.2).
    pub async fn xattr_copy(&self, src: &Path, dst: &Path) {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let result = tokio::task::spawn_blocking(move || copy_xattrs_blocking(&src, &dst)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("xattr copy failed: {}", e),
            Err(e) => warn!("xattr copy task panicked: {}", e),
        }
    }
}

async fn with_timeout<F, T>(timeout: Duration, fut: F) -> Result<T, FileOpError>
where
    F: std::future::Future<Output = Result<T, FileOpError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(FileOpError::Timeout(timeout)),
    }
}

fn map_io_err(e: std::io::Error) -> FileOpError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FileOpError::InvalidSource(e.to_string()),
        std::io::ErrorKind::PermissionDenied => FileOpError::PermissionDenied(e.to_string()),
        std::io::ErrorKind::TimedOut => FileOpError::Timeout(DEFAULT_IO_TIMEOUT),
        _ if e.raw_os_error() == Some(libc_enospc()) => FileOpError::NoSpace(e.to_string()),
        _ => FileOpError::Internal(e.to_string()),
    }
}

fn libc_enospc() -> i32 {
    28 // ENOSPC on Linux/macOS
}

#[cfg(target_os = "linux")]
fn is_network_volume_linux(path: &Path) -> bool {
    const NETWORK_FSTYPES: &[&str] = &[
        "cifs", "smb", "smbfs", "nfs", "nfs4", "afpfs", "webdav", "davfs", "fuse", "fuseblk",
    ];

    let Ok(canon) = path.canonicalize() else {
        return false;
    };
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };

    let mut best_match: Option<(usize, bool)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount_point), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if canon.starts_with(mount_point) {
            let is_net = NETWORK_FSTYPES
                .iter()
                .any(|t| fstype.eq_ignore_ascii_case(t));
            let len = mount_point.len();
            if best_match.map(|(l, _)| len > l).unwrap_or(true) {
                best_match = Some((len, is_net));
            }
        }
    }
    best_match.map(|(_, is_net)| is_net).unwrap_or(false)
}

fn copy_xattrs_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    let names = match xattr::list(src) {
        Ok(n) => n,
        Err(_) => return Ok(()), // not supported on this filesystem
    };

    for name in names {
        // Skip system/security attributes; only user-facing tags/comments
        // are worth best-effort propagating (spec §4.2).
        let name_str = name.to_string_lossy();
        if name_str.starts_with("security.") || name_str.starts_with("system.") {
            continue;
        }
        if let Some(value) = xattr::get(src, &name)? {
            xattr::set(dst, &name, &value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn join_within_root_accepts_normal_relative() {
        let root = Path::new("/dest");
        let joined = join_within_root(root, Path::new("sub/a.jpg")).unwrap();
        assert_eq!(joined, PathBuf::from("/dest/sub/a.jpg"));
    }

    #[test]
    fn join_within_root_rejects_parent_dir() {
        let root = Path::new("/dest");
        let result = join_within_root(root, Path::new("../escape.jpg"));
        assert!(matches!(result, Err(FileOpError::PathEscape(_))));
    }

    #[test]
    fn join_within_root_rejects_absolute_path() {
        let root = Path::new("/dest");
        let result = join_within_root(root, Path::new("/etc/passwd"));
        assert!(matches!(result, Err(FileOpError::PathEscape(_))));
    }

    #[tokio::test]
    async fn copy_creates_parent_dirs_and_matches_content() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src_file = src_dir.path().join("a.jpg");
        tokio::fs::write(&src_file, b"aaaaaaaaaa").await.unwrap();

        let ops = FileOps::default();
        let dst_file = dst_dir.path().join("sub/a.jpg");
        let bytes = ops
            .copy(&src_file, src_dir.path(), &dst_file, dst_dir.path(), false)
            .await
            .unwrap();

        assert_eq!(bytes, 10);
        let content = tokio::fs::read(&dst_file).await.unwrap();
        assert_eq!(content, b"aaaaaaaaaa");
    }

    #[tokio::test]
    async fn copy_skips_symlink_silently() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let target = src_dir.path().join("real.jpg");
        tokio::fs::write(&target, b"content").await.unwrap();
        let link = src_dir.path().join("link.jpg");

        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let ops = FileOps::default();
        let dst_file = dst_dir.path().join("link.jpg");
        let bytes = ops
            .copy(&link, src_dir.path(), &dst_file, dst_dir.path(), false)
            .await
            .unwrap();

        assert_eq!(bytes, 0);
        assert!(!ops.exists(&dst_file));
    }

    #[test]
    fn attributes_reports_file_size() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x.jpg");
        std::fs::write(&file, b"12345").unwrap();

        let ops = FileOps::default();
        let attrs = ops.attributes(&file).unwrap();
        assert_eq!(attrs.size, 5);
        assert_eq!(attrs.kind, EntryKind::File);
    }
}
