use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{DirEntry, FileStat, FsBackend, F_OK, R_OK, W_OK, X_OK};
use crate::error::{VsysError, VsysResult};
use crate::permissions::Domain;

/// The host filesystem, through `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

fn io<T>(result: io::Result<T>) -> VsysResult<T> {
    result.map_err(|e| VsysError::io(Domain::Fs, e))
}

fn access_denied() -> VsysError {
    VsysError::io(Domain::Fs, io::Error::from(io::ErrorKind::PermissionDenied))
}

#[cfg(unix)]
fn check_mode_bits(metadata: &std::fs::Metadata, mode: u32) -> VsysResult<()> {
    use std::os::unix::fs::MetadataExt;

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let file_mode = metadata.mode();

    // root reads and writes anything, but executes only if some x bit is set
    if uid == 0 {
        if mode & X_OK != 0 && file_mode & 0o111 == 0 {
            return Err(access_denied());
        }
        return Ok(());
    }

    let shift = if uid == metadata.uid() {
        6
    } else if gid == metadata.gid() {
        3
    } else {
        0
    };
    let bits = (file_mode >> shift) & 0o7;
    if [R_OK, W_OK, X_OK]
        .iter()
        .any(|&flag| mode & flag != 0 && bits & flag == 0)
    {
        return Err(access_denied());
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode_bits(metadata: &std::fs::Metadata, mode: u32) -> VsysResult<()> {
    if mode & W_OK != 0 && metadata.permissions().readonly() {
        return Err(access_denied());
    }
    Ok(())
}

impl FsBackend for RealFs {
    fn read(&self, path: &Path) -> VsysResult<Vec<u8>> {
        io(std::fs::read(path))
    }

    fn write(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        io(std::fs::write(path, data))
    }

    fn append(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        let mut file = io(std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path))?;
        io(file.write_all(data))
    }

    fn stat(&self, path: &Path) -> VsysResult<FileStat> {
        let metadata = io(std::fs::metadata(path))?;
        Ok(FileStat::from_metadata(&metadata))
    }

    fn lstat(&self, path: &Path) -> VsysResult<FileStat> {
        let metadata = io(std::fs::symlink_metadata(path))?;
        Ok(FileStat::from_metadata(&metadata))
    }

    fn read_dir(&self, path: &Path) -> VsysResult<Vec<DirEntry>> {
        let entries = io(std::fs::read_dir(path))?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let file_type = entry.file_type().ok()?;
                Some(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    file_type: file_type.into(),
                })
            })
            .collect();
        Ok(entries)
    }

    fn read_link(&self, path: &Path) -> VsysResult<PathBuf> {
        io(std::fs::read_link(path))
    }

    fn canonicalize(&self, path: &Path) -> VsysResult<PathBuf> {
        io(std::fs::canonicalize(path))
    }

    fn create_dir_all(&self, path: &Path) -> VsysResult<()> {
        io(std::fs::create_dir_all(path))
    }

    fn remove_file(&self, path: &Path) -> VsysResult<()> {
        io(std::fs::remove_file(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> VsysResult<()> {
        io(std::fs::rename(from, to))
    }

    fn create_dir(&self, path: &Path) -> VsysResult<()> {
        io(std::fs::create_dir(path))
    }

    fn remove_dir(&self, path: &Path) -> VsysResult<()> {
        io(std::fs::remove_dir(path))
    }

    fn remove_dir_all(&self, path: &Path) -> VsysResult<()> {
        io(std::fs::remove_dir_all(path))
    }

    fn copy(&self, from: &Path, to: &Path) -> VsysResult<u64> {
        io(std::fs::copy(from, to))
    }

    #[cfg(unix)]
    fn symlink(&self, original: &Path, link: &Path) -> VsysResult<()> {
        io(std::os::unix::fs::symlink(original, link))
    }

    #[cfg(windows)]
    fn symlink(&self, original: &Path, link: &Path) -> VsysResult<()> {
        let target = link.parent().unwrap_or(Path::new("")).join(original);
        if target.is_dir() {
            io(std::os::windows::fs::symlink_dir(original, link))
        } else {
            io(std::os::windows::fs::symlink_file(original, link))
        }
    }

    fn truncate(&self, path: &Path, size: u64) -> VsysResult<()> {
        let file = io(std::fs::OpenOptions::new().write(true).open(path))?;
        io(file.set_len(size))
    }

    fn set_permissions(&self, path: &Path, readonly: bool) -> VsysResult<()> {
        let mut perms = io(std::fs::metadata(path))?.permissions();
        perms.set_readonly(readonly);
        io(std::fs::set_permissions(path, perms))
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &Path, mode: u32) -> VsysResult<()> {
        use std::os::unix::fs::PermissionsExt;
        io(std::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(mode),
        ))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, _path: &Path, _mode: u32) -> VsysResult<()> {
        Ok(())
    }

    fn access(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let metadata = io(std::fs::metadata(path))?;
        if mode == F_OK {
            return Ok(());
        }
        check_mode_bits(&metadata, mode)
    }
}
