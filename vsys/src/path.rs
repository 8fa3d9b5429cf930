//! Lexical path helpers shared by the permission matcher and the fs layer.

use std::path::{Component, Path, PathBuf};

/// Make `path` absolute against `base` and fold `.` / `..` components
/// without touching the filesystem.
///
/// `..` never climbs above the root, so `/a/../../etc` becomes `/etc`.
pub fn normalize(base: &Path, path: &Path) -> PathBuf {
    let joined;
    let path = if path.is_absolute() || base.as_os_str().is_empty() {
        path
    } else {
        joined = base.join(path);
        &joined
    };

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.parent().is_some() {
                    out.pop();
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir.as_os_str());
    }
    out
}

/// Normalize a path that is expected to be absolute already.
pub fn normalize_absolute(path: &Path) -> PathBuf {
    normalize(Path::new(""), path)
}

/// Number of normal components, used as the specificity of a path prefix.
pub fn depth(path: &Path) -> u32 {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/project"), Path::new("./src/../a.js")),
            PathBuf::from("/project/a.js")
        );
        assert_eq!(
            normalize(Path::new("/project"), Path::new("/project/../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(
            normalize_absolute(Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
        assert_eq!(normalize_absolute(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth(Path::new("/")), 0);
        assert_eq!(depth(Path::new("/data/public")), 2);
    }
}
