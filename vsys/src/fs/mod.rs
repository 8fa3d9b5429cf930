//! Filesystem virtual table for vsys
//!
//! [`FsVTable`] is the only way script-facing code reaches a filesystem.
//! Every operation normalizes its path, checks it against the permission
//! store, re-checks the path symlinks resolve to, and only then delegates to
//! the configured [`FsBackend`]: the real filesystem ([`RealFs`]), an
//! in-memory tree ([`MemoryFs`]) or a backend that refuses everything
//! ([`DeniedFs`]).
//!
//! Async operations run backend work on tokio's blocking pool; `_sync`
//! variants run inline and never prompt.

mod memory;
mod real;

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub use memory::MemoryFs;
pub use real::RealFs;

use crate::error::{VsysError, VsysResult};
use crate::gate::PermissionGate;
use crate::path;
use crate::permissions::{CapabilityKind, CapabilityRequest, Domain};

/// Upper bound on symlink hops, matching Linux `MAXSYMLINKS`
pub const MAX_SYMLINK_HOPS: usize = 40;

// Access check modes
pub const F_OK: u32 = 0;
pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

/// File type information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<std::fs::FileType> for FileType {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            FileType::File
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else {
            FileType::Other
        }
    }
}

/// File statistics (platform-independent subset)
#[derive(Debug, Clone)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
    pub readonly: bool,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
    /// Unix mode (0 on Windows)
    pub mode: u32,
}

impl FileStat {
    /// Create from std::fs::Metadata
    pub fn from_metadata(metadata: &Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            metadata.mode()
        };

        #[cfg(not(unix))]
        let mode = 0;

        Self {
            file_type: metadata.file_type().into(),
            size: metadata.len(),
            readonly: metadata.permissions().readonly(),
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            created: metadata.created().ok(),
            mode,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// Primitive filesystem operations a backend provides.
///
/// Backends never check permissions; [`FsVTable`] does that before calling
/// them. Paths handed to a backend are absolute.
pub trait FsBackend: Send + Sync {
    fn read(&self, path: &Path) -> VsysResult<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> VsysResult<()>;
    fn append(&self, path: &Path, data: &[u8]) -> VsysResult<()>;
    fn stat(&self, path: &Path) -> VsysResult<FileStat>;
    fn lstat(&self, path: &Path) -> VsysResult<FileStat>;
    fn read_dir(&self, path: &Path) -> VsysResult<Vec<DirEntry>>;
    fn read_link(&self, path: &Path) -> VsysResult<PathBuf>;
    fn canonicalize(&self, path: &Path) -> VsysResult<PathBuf>;
    fn create_dir_all(&self, path: &Path) -> VsysResult<()>;
    fn remove_file(&self, path: &Path) -> VsysResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> VsysResult<()>;
    fn create_dir(&self, path: &Path) -> VsysResult<()>;
    fn remove_dir(&self, path: &Path) -> VsysResult<()>;
    fn remove_dir_all(&self, path: &Path) -> VsysResult<()>;
    /// Returns the number of bytes copied
    fn copy(&self, from: &Path, to: &Path) -> VsysResult<u64>;
    /// Create `link` pointing at `original`, stored verbatim
    fn symlink(&self, original: &Path, link: &Path) -> VsysResult<()>;
    fn truncate(&self, path: &Path, size: u64) -> VsysResult<()>;
    fn set_permissions(&self, path: &Path, readonly: bool) -> VsysResult<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> VsysResult<()>;
    /// Host-level access check, `mode` is a mask of [`R_OK`], [`W_OK`] and
    /// [`X_OK`] or exactly [`F_OK`]
    fn access(&self, path: &Path, mode: u32) -> VsysResult<()>;

    fn exists(&self, path: &Path) -> VsysResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(VsysError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_file(&self, path: &Path) -> VsysResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(stat.is_file()),
            Err(VsysError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_dir(&self, path: &Path) -> VsysResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(stat.is_dir()),
            Err(VsysError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Backend that refuses every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedFs;

fn refuse<T>(kind: CapabilityKind, path: &Path) -> VsysResult<T> {
    Err(VsysError::denied(kind, path.display().to_string()))
}

impl FsBackend for DeniedFs {
    fn read(&self, path: &Path) -> VsysResult<Vec<u8>> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn write(&self, path: &Path, _: &[u8]) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn append(&self, path: &Path, _: &[u8]) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn stat(&self, path: &Path) -> VsysResult<FileStat> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn lstat(&self, path: &Path) -> VsysResult<FileStat> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn read_dir(&self, path: &Path) -> VsysResult<Vec<DirEntry>> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn read_link(&self, path: &Path) -> VsysResult<PathBuf> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn canonicalize(&self, path: &Path) -> VsysResult<PathBuf> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn create_dir_all(&self, path: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn remove_file(&self, path: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn rename(&self, from: &Path, _: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, from)
    }
    fn create_dir(&self, path: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn remove_dir(&self, path: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn remove_dir_all(&self, path: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn copy(&self, from: &Path, _: &Path) -> VsysResult<u64> {
        refuse(CapabilityKind::FsRead, from)
    }
    fn symlink(&self, _: &Path, link: &Path) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, link)
    }
    fn truncate(&self, path: &Path, _: u64) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn set_permissions(&self, path: &Path, _: bool) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn set_mode(&self, path: &Path, _: u32) -> VsysResult<()> {
        refuse(CapabilityKind::FsWrite, path)
    }
    fn access(&self, path: &Path, _: u32) -> VsysResult<()> {
        refuse(CapabilityKind::FsRead, path)
    }
    fn exists(&self, _: &Path) -> VsysResult<bool> {
        Ok(false)
    }
    fn is_file(&self, _: &Path) -> VsysResult<bool> {
        Ok(false)
    }
    fn is_dir(&self, _: &Path) -> VsysResult<bool> {
        Ok(false)
    }
}

/// Permission-gated filesystem operations
///
/// Cloning is cheap and keeps the backend identity.
///
/// Checks run against the path as resolved just before the backend call.
/// A symlink swapped in between the check and the call is not seen; hosts
/// that share a writable tree with untrusted processes need OS-level
/// confinement on top of this.
#[derive(Clone)]
pub struct FsVTable {
    backend: Arc<dyn FsBackend>,
    gate: PermissionGate,
    cwd: Arc<Path>,
}

impl std::fmt::Debug for FsVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsVTable")
            .field("cwd", &self.cwd)
            .field("context", self.gate.context())
            .finish_non_exhaustive()
    }
}

impl FsVTable {
    pub fn new(backend: Arc<dyn FsBackend>, gate: PermissionGate, cwd: &Path) -> Self {
        Self {
            backend,
            gate,
            cwd: Arc::from(path::normalize_absolute(cwd)),
        }
    }

    /// Same backend, different permission gate
    pub fn with_gate(&self, gate: PermissionGate) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            gate,
            cwd: Arc::clone(&self.cwd),
        }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn same_backend(&self, other: &FsVTable) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    /// Absolute, lexically normalized form of `path`
    pub fn absolute(&self, path: &Path) -> PathBuf {
        path::normalize(&self.cwd, path)
    }

    /// Best-effort physical location of `path`: symlinks in the parent
    /// chain are always resolved, the last component only when
    /// `follow_last` is set. Dangling links resolve to their target.
    fn physical(&self, path: &Path, follow_last: bool) -> PathBuf {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_HOPS {
            if follow_last {
                if let Ok(resolved) = self.backend.canonicalize(&current) {
                    return resolved;
                }
            }
            let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                return current;
            };
            let parent = self.resolve_existing(parent);
            let candidate = parent.join(name);
            if !follow_last {
                return candidate;
            }
            match self.backend.lstat(&candidate) {
                Ok(stat) if stat.is_symlink() => match self.backend.read_link(&candidate) {
                    Ok(target) => current = path::normalize(&parent, &target),
                    Err(_) => return candidate,
                },
                _ => return candidate,
            }
        }
        current
    }

    /// Canonicalize the deepest existing ancestor of `dir` and re-append
    /// the components that do not exist yet
    fn resolve_existing(&self, dir: &Path) -> PathBuf {
        let mut missing = Vec::new();
        let mut current = dir;
        loop {
            if let Ok(resolved) = self.backend.canonicalize(current) {
                return missing.iter().rev().fold(resolved, |acc, name| acc.join(name));
            }
            match (current.parent(), current.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    current = parent;
                }
                _ => return dir.to_path_buf(),
            }
        }
    }

    fn guard_sync(&self, kind: CapabilityKind, path: &Path, follow_last: bool) -> VsysResult<PathBuf> {
        let lexical = self.absolute(path);
        self.gate
            .authorize_sync(&CapabilityRequest::path(kind, &lexical))?;
        let physical = self.physical(&lexical, follow_last);
        if physical != lexical {
            tracing::trace!(from = %lexical.display(), to = %physical.display(), "re-checking resolved path");
            self.gate
                .authorize_sync(&CapabilityRequest::path(kind, &physical))?;
        }
        Ok(physical)
    }

    async fn guard(&self, kind: CapabilityKind, path: &Path, follow_last: bool) -> VsysResult<PathBuf> {
        let lexical = self.absolute(path);
        self.gate
            .authorize(&CapabilityRequest::path(kind, &lexical))
            .await?;
        let physical = {
            let lexical = lexical.clone();
            self.blocking(move |fs| Ok(fs.physical(&lexical, follow_last)))
                .await?
        };
        if physical != lexical {
            tracing::trace!(from = %lexical.display(), to = %physical.display(), "re-checking resolved path");
            self.gate
                .authorize(&CapabilityRequest::path(kind, &physical))
                .await?;
        }
        Ok(physical)
    }

    /// Run backend work on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> VsysResult<T>
    where
        F: FnOnce(&FsVTable) -> VsysResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| VsysError::io(Domain::Fs, io::Error::other(e)))?
    }

    // Read operations

    pub fn read_sync(&self, path: &Path) -> VsysResult<Vec<u8>> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.read(&path)
    }

    pub async fn read(&self, path: &Path) -> VsysResult<Vec<u8>> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.read(&path)).await
    }

    pub fn read_to_string_sync(&self, path: &Path) -> VsysResult<String> {
        into_string(self.read_sync(path)?)
    }

    pub async fn read_to_string(&self, path: &Path) -> VsysResult<String> {
        into_string(self.read(path).await?)
    }

    pub fn exists_sync(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.exists(&path)
    }

    pub async fn exists(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.exists(&path)).await
    }

    pub fn is_file_sync(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.is_file(&path)
    }

    pub async fn is_file(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.is_file(&path)).await
    }

    pub fn is_dir_sync(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.is_dir(&path)
    }

    pub async fn is_dir(&self, path: &Path) -> VsysResult<bool> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.is_dir(&path)).await
    }

    pub fn stat_sync(&self, path: &Path) -> VsysResult<FileStat> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.stat(&path)
    }

    pub async fn stat(&self, path: &Path) -> VsysResult<FileStat> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.stat(&path)).await
    }

    pub fn lstat_sync(&self, path: &Path) -> VsysResult<FileStat> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, false)?;
        self.backend.lstat(&path)
    }

    pub async fn lstat(&self, path: &Path) -> VsysResult<FileStat> {
        let path = self.guard(CapabilityKind::FsRead, path, false).await?;
        self.blocking(move |fs| fs.backend.lstat(&path)).await
    }

    pub fn read_dir_sync(&self, path: &Path) -> VsysResult<Vec<DirEntry>> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.read_dir(&path)
    }

    pub async fn read_dir(&self, path: &Path) -> VsysResult<Vec<DirEntry>> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.read_dir(&path)).await
    }

    /// Raw link target; reading it does not grant access to the target
    pub fn read_link_sync(&self, path: &Path) -> VsysResult<PathBuf> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, false)?;
        self.backend.read_link(&path)
    }

    pub async fn read_link(&self, path: &Path) -> VsysResult<PathBuf> {
        let path = self.guard(CapabilityKind::FsRead, path, false).await?;
        self.blocking(move |fs| fs.backend.read_link(&path)).await
    }

    /// Resolve every symlink in `path`. Both the requested path and the
    /// resolved one must be readable.
    pub fn canonicalize_sync(&self, path: &Path) -> VsysResult<PathBuf> {
        let path = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        self.backend.canonicalize(&path)
    }

    pub async fn canonicalize(&self, path: &Path) -> VsysResult<PathBuf> {
        let path = self.guard(CapabilityKind::FsRead, path, true).await?;
        self.blocking(move |fs| fs.backend.canonicalize(&path)).await
    }

    // Write operations

    pub fn write_sync(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.write(&path, data)
    }

    pub async fn write(&self, path: &Path, data: Vec<u8>) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.write(&path, &data)).await
    }

    pub fn append_sync(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.append(&path, data)
    }

    pub async fn append(&self, path: &Path, data: Vec<u8>) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.append(&path, &data)).await
    }

    pub fn create_dir_all_sync(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.create_dir_all(&path)
    }

    pub async fn create_dir_all(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.create_dir_all(&path)).await
    }

    /// Removes a link itself, not its target
    pub fn remove_file_sync(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, false)?;
        self.backend.remove_file(&path)
    }

    pub async fn remove_file(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, false).await?;
        self.blocking(move |fs| fs.backend.remove_file(&path)).await
    }

    pub fn rename_sync(&self, from: &Path, to: &Path) -> VsysResult<()> {
        let from = self.guard_sync(CapabilityKind::FsWrite, from, false)?;
        let to = self.guard_sync(CapabilityKind::FsWrite, to, false)?;
        self.backend.rename(&from, &to)
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> VsysResult<()> {
        let from = self.guard(CapabilityKind::FsWrite, from, false).await?;
        let to = self.guard(CapabilityKind::FsWrite, to, false).await?;
        self.blocking(move |fs| fs.backend.rename(&from, &to)).await
    }

    pub fn create_dir_sync(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.create_dir(&path)
    }

    pub async fn create_dir(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.create_dir(&path)).await
    }

    pub fn remove_dir_sync(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, false)?;
        self.backend.remove_dir(&path)
    }

    pub async fn remove_dir(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, false).await?;
        self.blocking(move |fs| fs.backend.remove_dir(&path)).await
    }

    pub fn remove_dir_all_sync(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, false)?;
        self.backend.remove_dir_all(&path)
    }

    pub async fn remove_dir_all(&self, path: &Path) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, false).await?;
        self.blocking(move |fs| fs.backend.remove_dir_all(&path)).await
    }

    /// Needs read on `from` and write on `to`
    pub fn copy_sync(&self, from: &Path, to: &Path) -> VsysResult<u64> {
        let from = self.guard_sync(CapabilityKind::FsRead, from, true)?;
        let to = self.guard_sync(CapabilityKind::FsWrite, to, true)?;
        self.backend.copy(&from, &to)
    }

    pub async fn copy(&self, from: &Path, to: &Path) -> VsysResult<u64> {
        let from = self.guard(CapabilityKind::FsRead, from, true).await?;
        let to = self.guard(CapabilityKind::FsWrite, to, true).await?;
        self.blocking(move |fs| fs.backend.copy(&from, &to)).await
    }

    /// Needs write on `link` and read on whatever `original` resolves to,
    /// so a link cannot be used to publish a path the caller cannot read.
    /// Relative targets are kept relative.
    pub fn symlink_sync(&self, original: &Path, link: &Path) -> VsysResult<()> {
        let link = self.guard_sync(CapabilityKind::FsWrite, link, false)?;
        let target = link_target(&link, original);
        self.guard_sync(CapabilityKind::FsRead, &target, true)?;
        self.backend.symlink(original, &link)
    }

    pub async fn symlink(&self, original: &Path, link: &Path) -> VsysResult<()> {
        let link = self.guard(CapabilityKind::FsWrite, link, false).await?;
        let target = link_target(&link, original);
        self.guard(CapabilityKind::FsRead, &target, true).await?;
        let original = original.to_path_buf();
        self.blocking(move |fs| fs.backend.symlink(&original, &link))
            .await
    }

    pub fn truncate_sync(&self, path: &Path, size: u64) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.truncate(&path, size)
    }

    pub async fn truncate(&self, path: &Path, size: u64) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.truncate(&path, size)).await
    }

    pub fn set_permissions_sync(&self, path: &Path, readonly: bool) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.set_permissions(&path, readonly)
    }

    pub async fn set_permissions(&self, path: &Path, readonly: bool) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.set_permissions(&path, readonly))
            .await
    }

    pub fn set_mode_sync(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let path = self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        self.backend.set_mode(&path, mode)
    }

    pub async fn set_mode(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let path = self.guard(CapabilityKind::FsWrite, path, true).await?;
        self.blocking(move |fs| fs.backend.set_mode(&path, mode)).await
    }

    /// Capability check first (read, plus write when `mode` has [`W_OK`]),
    /// then the host's own access bits
    pub fn access_sync(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let resolved = self.guard_sync(CapabilityKind::FsRead, path, true)?;
        if mode & W_OK != 0 {
            self.guard_sync(CapabilityKind::FsWrite, path, true)?;
        }
        self.backend.access(&resolved, mode)
    }

    pub async fn access(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let resolved = self.guard(CapabilityKind::FsRead, path, true).await?;
        if mode & W_OK != 0 {
            self.guard(CapabilityKind::FsWrite, path, true).await?;
        }
        self.blocking(move |fs| fs.backend.access(&resolved, mode))
            .await
    }
}

/// Where a link at `link` pointing to `original` leads
fn link_target(link: &Path, original: &Path) -> PathBuf {
    let parent = link.parent().unwrap_or(Path::new("/"));
    path::normalize(parent, original)
}

fn into_string(bytes: Vec<u8>) -> VsysResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| VsysError::io(Domain::Fs, io::Error::new(io::ErrorKind::InvalidData, e)))
}
