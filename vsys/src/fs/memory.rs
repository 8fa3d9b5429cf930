use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use super::{DirEntry, FileStat, FileType, FsBackend, MAX_SYMLINK_HOPS, R_OK, W_OK, X_OK};
use crate::error::{VsysError, VsysResult};
use crate::path;
use crate::permissions::Domain;

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        modified: SystemTime,
        mode: u32,
    },
    Dir {
        mode: u32,
    },
    Symlink(PathBuf),
}

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

impl Node {
    fn dir() -> Self {
        Node::Dir { mode: DIR_MODE }
    }

    fn file(data: Vec<u8>) -> Self {
        Node::File {
            data,
            modified: SystemTime::now(),
            mode: FILE_MODE,
        }
    }

    /// Permission bits, without the file type
    fn mode(&self) -> u32 {
        match self {
            Node::File { mode, .. } | Node::Dir { mode } => *mode,
            Node::Symlink(_) => 0o777,
        }
    }

    fn set_mode(&mut self, new: u32) {
        if let Node::File { mode, .. } | Node::Dir { mode } = self {
            *mode = new & 0o7777;
        }
    }

    fn stat(&self) -> FileStat {
        let (file_type, size, modified, type_bits) = match self {
            Node::File { data, modified, .. } => {
                (FileType::File, data.len() as u64, Some(*modified), 0o100000)
            }
            Node::Dir { .. } => (FileType::Directory, 0, None, 0o040000),
            Node::Symlink(target) => (
                FileType::Symlink,
                target.as_os_str().len() as u64,
                None,
                0o120000,
            ),
        };
        let mode = self.mode();
        FileStat {
            file_type,
            size,
            readonly: mode & 0o222 == 0,
            modified,
            accessed: None,
            created: None,
            mode: type_bits | mode,
        }
    }
}

/// In-memory filesystem tree for tests and fully virtualized sandboxes.
///
/// Paths are absolute. Symlinks are stored as raw targets and resolved on
/// access the same way the host would.
#[derive(Debug)]
pub struct MemoryFs {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &Path) -> VsysError {
    VsysError::NotFound(path.display().to_string())
}

fn io_error(kind: io::ErrorKind, message: &str) -> VsysError {
    VsysError::io(Domain::Fs, io::Error::new(kind, message.to_string()))
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::dir());
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Add a file, creating missing parent directories
    pub fn with_file(self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> Self {
        self.insert_raw(path.as_ref(), Node::file(data.into()));
        self
    }

    pub fn with_dir(self, path: impl AsRef<Path>) -> Self {
        self.insert_raw(path.as_ref(), Node::dir());
        self
    }

    pub fn with_symlink(self, link: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        self.insert_raw(link.as_ref(), Node::Symlink(target.as_ref().to_path_buf()));
        self
    }

    /// Whether a node exists at exactly this path, without following links
    pub fn contains(&self, path: &Path) -> bool {
        self.read_nodes().contains_key(&path::normalize_absolute(path))
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_raw(&self, path: &Path, node: Node) {
        let path = path::normalize_absolute(path);
        let mut nodes = self.write_nodes();
        for ancestor in path.ancestors().skip(1) {
            nodes.entry(ancestor.to_path_buf()).or_insert_with(Node::dir);
        }
        nodes.insert(path, node);
    }

    /// Resolve every symlink in `path`; the last component is followed only
    /// when `follow_last` is set. The result need not exist.
    fn resolve(
        nodes: &BTreeMap<PathBuf, Node>,
        path: &Path,
        follow_last: bool,
    ) -> VsysResult<PathBuf> {
        let mut pending: Vec<PathBuf> = path::normalize_absolute(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(PathBuf::from(name)),
                _ => None,
            })
            .rev()
            .collect();
        let mut resolved = PathBuf::from("/");
        let mut hops = 0;

        while let Some(name) = pending.pop() {
            let candidate = resolved.join(&name);
            let is_last = pending.is_empty();
            match nodes.get(&candidate) {
                Some(Node::Symlink(target)) if follow_last || !is_last => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(io_error(
                            io::ErrorKind::Other,
                            "too many levels of symbolic links",
                        ));
                    }
                    let target = path::normalize(&resolved, target);
                    pending.extend(
                        target
                            .components()
                            .filter_map(|c| match c {
                                Component::Normal(name) => Some(PathBuf::from(name)),
                                _ => None,
                            })
                            .rev(),
                    );
                    resolved = PathBuf::from("/");
                }
                Some(Node::File { .. }) if !is_last => {
                    return Err(io_error(io::ErrorKind::Other, "not a directory"));
                }
                _ => resolved = candidate,
            }
        }
        Ok(resolved)
    }

    fn lookup(&self, path: &Path, follow_last: bool) -> VsysResult<(PathBuf, Node)> {
        let nodes = self.read_nodes();
        let resolved = Self::resolve(&nodes, path, follow_last)?;
        let node = nodes.get(&resolved).cloned().ok_or_else(|| not_found(path))?;
        Ok((resolved, node))
    }

    fn store_file(
        &self,
        path: &Path,
        update: impl FnOnce(Option<Vec<u8>>) -> Vec<u8>,
    ) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, true)?;
        Self::require_dir(&nodes, resolved.parent().unwrap_or(Path::new("/")))?;
        match nodes.get_mut(&resolved) {
            Some(Node::File { data, modified, mode }) => {
                if *mode & 0o200 == 0 {
                    return Err(io_error(io::ErrorKind::PermissionDenied, "read-only file"));
                }
                *data = update(Some(std::mem::take(data)));
                *modified = SystemTime::now();
            }
            Some(Node::Dir { .. }) => {
                return Err(io_error(io::ErrorKind::Other, "is a directory"));
            }
            _ => {
                nodes.insert(resolved, Node::file(update(None)));
            }
        }
        Ok(())
    }

    fn require_dir(nodes: &BTreeMap<PathBuf, Node>, dir: &Path) -> VsysResult<()> {
        match nodes.get(dir) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(_) => Err(io_error(io::ErrorKind::Other, "not a directory")),
            None => Err(not_found(dir)),
        }
    }

    /// Insert a new node whose parent must already be a directory
    fn create_node(&self, path: &Path, node: Node) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, false)?;
        if nodes.contains_key(&resolved) {
            return Err(io_error(io::ErrorKind::AlreadyExists, "file exists"));
        }
        Self::require_dir(&nodes, resolved.parent().unwrap_or(Path::new("/")))?;
        nodes.insert(resolved, node);
        Ok(())
    }

    fn update_node(&self, path: &Path, update: impl FnOnce(&mut Node)) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, true)?;
        let node = nodes.get_mut(&resolved).ok_or_else(|| not_found(path))?;
        update(node);
        Ok(())
    }
}

impl FsBackend for MemoryFs {
    fn read(&self, path: &Path) -> VsysResult<Vec<u8>> {
        match self.lookup(path, true)? {
            (_, Node::File { data, .. }) => Ok(data),
            _ => Err(io_error(io::ErrorKind::Other, "is a directory")),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        self.store_file(path, |_| data.to_vec())
    }

    fn append(&self, path: &Path, data: &[u8]) -> VsysResult<()> {
        self.store_file(path, |existing| {
            let mut buf = existing.unwrap_or_default();
            buf.extend_from_slice(data);
            buf
        })
    }

    fn stat(&self, path: &Path) -> VsysResult<FileStat> {
        self.lookup(path, true).map(|(_, node)| node.stat())
    }

    fn lstat(&self, path: &Path) -> VsysResult<FileStat> {
        self.lookup(path, false).map(|(_, node)| node.stat())
    }

    fn read_dir(&self, path: &Path) -> VsysResult<Vec<DirEntry>> {
        let nodes = self.read_nodes();
        let dir = Self::resolve(&nodes, path, true)?;
        match nodes.get(&dir) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(io_error(io::ErrorKind::Other, "not a directory")),
            None => return Err(not_found(path)),
        }
        let entries = nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(dir.as_path()))
            .filter_map(|(p, node)| {
                Some(DirEntry {
                    name: p.file_name()?.to_string_lossy().into_owned(),
                    file_type: node.stat().file_type,
                })
            })
            .collect();
        Ok(entries)
    }

    fn read_link(&self, path: &Path) -> VsysResult<PathBuf> {
        match self.lookup(path, false)? {
            (_, Node::Symlink(target)) => Ok(target),
            _ => Err(VsysError::InvalidArgument(format!(
                "{} is not a symbolic link",
                path.display()
            ))),
        }
    }

    fn canonicalize(&self, path: &Path) -> VsysResult<PathBuf> {
        self.lookup(path, true).map(|(resolved, _)| resolved)
    }

    fn create_dir_all(&self, path: &Path) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, true)?;
        for dir in resolved.ancestors().collect::<Vec<_>>().into_iter().rev() {
            match nodes.get(dir) {
                Some(Node::Dir { .. }) => {}
                Some(_) => return Err(io_error(io::ErrorKind::AlreadyExists, "file exists")),
                None => {
                    nodes.insert(dir.to_path_buf(), Node::dir());
                }
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, false)?;
        match nodes.get(&resolved) {
            Some(Node::Dir { .. }) => Err(io_error(io::ErrorKind::Other, "is a directory")),
            Some(_) => {
                nodes.remove(&resolved);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let from = Self::resolve(&nodes, from, false)?;
        let to = Self::resolve(&nodes, to, false)?;
        if !nodes.contains_key(&from) {
            return Err(not_found(&from));
        }
        Self::require_dir(&nodes, to.parent().unwrap_or(Path::new("/")))?;
        let moved: Vec<PathBuf> = nodes
            .keys()
            .filter(|p| p.starts_with(&from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = old.strip_prefix(&from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(suffix)
                };
                nodes.insert(new, node);
            }
        }
        Ok(())
    }
    fn create_dir(&self, path: &Path) -> VsysResult<()> {
        self.create_node(path, Node::dir())
    }

    fn remove_dir(&self, path: &Path) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, false)?;
        Self::require_dir(&nodes, &resolved)?;
        if nodes.keys().any(|p| p.parent() == Some(resolved.as_path())) {
            return Err(io_error(io::ErrorKind::Other, "directory not empty"));
        }
        if resolved == Path::new("/") {
            return Err(io_error(io::ErrorKind::PermissionDenied, "cannot remove root"));
        }
        nodes.remove(&resolved);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> VsysResult<()> {
        let mut nodes = self.write_nodes();
        let resolved = Self::resolve(&nodes, path, false)?;
        Self::require_dir(&nodes, &resolved)?;
        if resolved == Path::new("/") {
            return Err(io_error(io::ErrorKind::PermissionDenied, "cannot remove root"));
        }
        nodes.retain(|p, _| !p.starts_with(&resolved));
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> VsysResult<u64> {
        let (data, mode) = match self.lookup(from, true)? {
            (_, Node::File { data, mode, .. }) => (data, mode),
            _ => return Err(io_error(io::ErrorKind::Other, "is a directory")),
        };
        let len = data.len() as u64;
        self.store_file(to, |_| data)?;
        self.update_node(to, |node| node.set_mode(mode))?;
        Ok(len)
    }

    fn symlink(&self, original: &Path, link: &Path) -> VsysResult<()> {
        self.create_node(link, Node::Symlink(original.to_path_buf()))
    }

    fn truncate(&self, path: &Path, size: u64) -> VsysResult<()> {
        let size = usize::try_from(size)
            .map_err(|_| VsysError::InvalidArgument(format!("size {size} is too large")))?;
        match self.lookup(path, true)? {
            (_, Node::File { .. }) => self.store_file(path, |existing| {
                let mut data = existing.unwrap_or_default();
                data.resize(size, 0);
                data
            }),
            _ => Err(io_error(io::ErrorKind::Other, "is a directory")),
        }
    }

    fn set_permissions(&self, path: &Path, readonly: bool) -> VsysResult<()> {
        self.update_node(path, |node| {
            let mode = node.mode();
            node.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
        })
    }

    fn set_mode(&self, path: &Path, mode: u32) -> VsysResult<()> {
        self.update_node(path, |node| node.set_mode(mode))
    }

    fn access(&self, path: &Path, mode: u32) -> VsysResult<()> {
        let (_, node) = self.lookup(path, true)?;
        // sandboxed code owns every node in the tree
        let bits = node.mode();
        let wanted = [(R_OK, 0o400), (W_OK, 0o200), (X_OK, 0o100)];
        if wanted
            .iter()
            .any(|&(flag, bit)| mode & flag != 0 && bits & bit == 0)
        {
            return Err(io_error(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creates_parents() {
        let fs = MemoryFs::new().with_file("/a/b/c.txt", "c");
        assert!(fs.is_dir(Path::new("/a/b")).unwrap());
        assert!(fs.is_file(Path::new("/a/b/c.txt")).unwrap());
        assert_eq!(fs.read(Path::new("/a/b/c.txt")).unwrap(), b"c");
        assert_eq!(fs.stat(Path::new("/a/b/c.txt")).unwrap().size, 1);
    }

    #[test]
    fn test_symlinks_resolve() {
        let fs = MemoryFs::new()
            .with_file("/real/file", "x")
            .with_symlink("/link", "real")
            .with_symlink("/link2", "/link/file");
        assert_eq!(
            fs.canonicalize(Path::new("/link2")).unwrap(),
            PathBuf::from("/real/file")
        );
        assert_eq!(fs.read(Path::new("/link/file")).unwrap(), b"x");
        assert!(fs.lstat(Path::new("/link2")).unwrap().is_symlink());
        assert_eq!(fs.read_link(Path::new("/link")).unwrap(), PathBuf::from("real"));
    }

    #[test]
    fn test_symlink_loop() {
        let fs = MemoryFs::new()
            .with_symlink("/a", "/b")
            .with_symlink("/b", "/a");
        assert!(matches!(
            fs.read(Path::new("/a")),
            Err(VsysError::Io { .. })
        ));
    }

    #[test]
    fn test_write_requires_parent() {
        let fs = MemoryFs::new();
        assert!(matches!(
            fs.write(Path::new("/missing/x"), b"1"),
            Err(VsysError::NotFound(_))
        ));
        fs.create_dir_all(Path::new("/missing")).unwrap();
        fs.write(Path::new("/missing/x"), b"1").unwrap();
        fs.append(Path::new("/missing/x"), b"2").unwrap();
        assert_eq!(fs.read(Path::new("/missing/x")).unwrap(), b"12");
    }

    #[test]
    fn test_rename_moves_subtree_and_remove() {
        let fs = MemoryFs::new().with_file("/src/a/b.txt", "b");
        fs.rename(Path::new("/src"), Path::new("/dst")).unwrap();
        assert!(!fs.exists(Path::new("/src/a/b.txt")).unwrap());
        assert_eq!(fs.read(Path::new("/dst/a/b.txt")).unwrap(), b"b");

        let names: Vec<_> = fs
            .read_dir(Path::new("/dst"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a"]);

        fs.remove_file(Path::new("/dst/a/b.txt")).unwrap();
        assert!(fs.remove_file(Path::new("/dst/a")).is_err());
        assert!(!fs.contains(Path::new("/dst/a/b.txt")));
    }

    #[test]
    fn test_directory_lifecycle() {
        let fs = MemoryFs::new();
        fs.create_dir(Path::new("/a")).unwrap();
        assert!(fs.create_dir(Path::new("/a")).is_err());
        assert!(matches!(
            fs.create_dir(Path::new("/missing/b")),
            Err(VsysError::NotFound(_))
        ));
        fs.create_dir(Path::new("/a/b")).unwrap();
        fs.write(Path::new("/a/b/c.txt"), b"c").unwrap();

        assert!(fs.remove_dir(Path::new("/a")).is_err());
        assert!(fs.remove_dir(Path::new("/a/b/c.txt")).is_err());
        fs.remove_dir_all(Path::new("/a")).unwrap();
        assert!(!fs.contains(Path::new("/a")));
        assert!(!fs.contains(Path::new("/a/b/c.txt")));
        assert!(fs.remove_dir_all(Path::new("/")).is_err());
    }

    #[test]
    fn test_copy_truncate_and_modes() {
        let fs = MemoryFs::new().with_file("/src.txt", "hello");
        fs.set_mode(Path::new("/src.txt"), 0o600).unwrap();
        assert_eq!(fs.copy(Path::new("/src.txt"), Path::new("/dst.txt")).unwrap(), 5);
        assert_eq!(fs.read(Path::new("/dst.txt")).unwrap(), b"hello");
        assert_eq!(fs.stat(Path::new("/dst.txt")).unwrap().mode, 0o100600);

        fs.truncate(Path::new("/dst.txt"), 7).unwrap();
        assert_eq!(fs.read(Path::new("/dst.txt")).unwrap(), b"hello\0\0");
        fs.truncate(Path::new("/dst.txt"), 1).unwrap();
        assert_eq!(fs.read(Path::new("/dst.txt")).unwrap(), b"h");

        fs.set_permissions(Path::new("/dst.txt"), true).unwrap();
        assert!(fs.stat(Path::new("/dst.txt")).unwrap().readonly);
        assert!(fs.write(Path::new("/dst.txt"), b"x").is_err());
        assert!(fs.access(Path::new("/dst.txt"), W_OK).is_err());
        fs.access(Path::new("/dst.txt"), R_OK).unwrap();
        assert!(fs.access(Path::new("/dst.txt"), X_OK).is_err());
        fs.set_permissions(Path::new("/dst.txt"), false).unwrap();
        fs.write(Path::new("/dst.txt"), b"x").unwrap();
        assert!(matches!(
            fs.access(Path::new("/nope"), crate::fs::F_OK),
            Err(VsysError::NotFound(_))
        ));
    }

    #[test]
    fn test_symlink_is_stored_verbatim() {
        let fs = MemoryFs::new().with_file("/dir/target", "t");
        fs.symlink(Path::new("target"), Path::new("/dir/link")).unwrap();
        assert_eq!(fs.read_link(Path::new("/dir/link")).unwrap(), PathBuf::from("target"));
        assert_eq!(fs.read(Path::new("/dir/link")).unwrap(), b"t");
        assert!(fs.symlink(Path::new("x"), Path::new("/dir/link")).is_err());
    }
}
