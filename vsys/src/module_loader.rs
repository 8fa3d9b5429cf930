//! Module loader virtual table for vsys
//!
//! This module provides a pluggable module loading/resolution abstraction.
//! The module loader uses the vsys FsVTable for all filesystem operations,
//! so every candidate it probes goes through the same permission checks as
//! a direct filesystem call from script code.
//!
//! # Resolution order
//!
//! 1. `node:` prefixed and built-in names resolve without touching the fs
//! 2. `file://` URLs become paths, other URL schemes are rejected
//! 3. Relative and absolute specifiers resolve against the referrer, trying
//!    the exact file, each known extension, then `index.<ext>`
//! 4. Bare specifiers consult the [`PackageMap`], then walk `node_modules`
//!    up from the referrer, then the global cache directory
//!
//! The winning candidate is canonicalized through the fs vtable, which
//! re-checks the target of any symlink on the way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{VsysError, VsysResult};
use crate::fs::FsVTable;

/// Module format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// ECMAScript module (import/export)
    ESM,
    /// CommonJS module (require/module.exports)
    CJS,
    /// JSON file
    Json,
    /// Binary/bytecode
    Binary,
}

/// Resolved module information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Canonical absolute path, or the bare name of a built-in
    pub path: String,
    /// Module format
    pub format: ModuleFormat,
    /// Whether this is a built-in/native module
    pub is_builtin: bool,
    /// Whether this is a CommonJS module that needs wrapping for ESM
    pub needs_cjs_wrapper: bool,
}

/// Loaded module source
#[derive(Debug, Clone)]
pub struct ModuleSource {
    /// Module source code or binary
    pub source: Vec<u8>,
    /// Module format
    pub format: ModuleFormat,
    /// Original path/URL
    pub path: String,
}

/// Installed packages, as laid out by the package manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PackageMap {
    /// Package name to package directory
    pub dependencies: HashMap<String, PathBuf>,
    /// Directory holding `<name>/` package folders shared across projects
    pub global_cache: Option<PathBuf>,
}

impl PackageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.dependencies.insert(name.into(), dir.into());
        self
    }

    pub fn with_global_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.global_cache = Some(dir.into());
        self
    }

    pub fn from_json_str(input: &str) -> VsysResult<Self> {
        serde_json::from_str(input)
            .map_err(|e| VsysError::InvalidArgument(format!("invalid package map: {}", e)))
    }
}

/// Module loader/resolver vtable
///
/// All functions receive the `FsVTable` to perform filesystem operations,
/// ensuring the module loader respects the virtual filesystem abstraction
/// and its permission checks.
pub struct ModuleLoaderVTable {
    /// Resolve a module specifier to an absolute path
    ///
    /// # Arguments
    /// * `fs` - The filesystem vtable to use for file operations
    /// * `packages` - Installed package locations
    /// * `specifier` - The import specifier (e.g., "./foo", "lodash", "node:fs")
    /// * `referrer` - The path of the module doing the import
    /// * `is_esm` - Whether this is an ESM import (vs CommonJS require)
    pub resolve: fn(
        fs: &FsVTable,
        packages: &PackageMap,
        specifier: &str,
        referrer: &str,
        is_esm: bool,
    ) -> VsysResult<ResolvedModule>,

    /// Load a module's source code from a path returned by `resolve`
    pub load: fn(fs: &FsVTable, path: &str) -> VsysResult<ModuleSource>,

    /// Check if a module exists at the given path
    pub exists: fn(fs: &FsVTable, path: &str) -> VsysResult<bool>,

    /// Check if a specifier is a built-in module
    pub is_builtin: fn(specifier: &str) -> bool,

    /// List all built-in module names
    pub list_builtins: fn() -> Vec<String>,

    /// Find the closest readable package.json from a directory
    pub find_package_json: fn(fs: &FsVTable, start_dir: &str) -> Option<String>,

    /// Read and parse package.json
    pub read_package_json: fn(fs: &FsVTable, path: &str) -> VsysResult<serde_json::Value>,
}

impl std::fmt::Debug for ModuleLoaderVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoaderVTable").finish_non_exhaustive()
    }
}

impl Default for ModuleLoaderVTable {
    fn default() -> Self {
        Self {
            resolve: default_resolve,
            load: default_load,
            exists: default_exists,
            is_builtin: default_is_builtin,
            list_builtins: default_list_builtins,
            find_package_json: default_find_package_json,
            read_package_json: default_read_package_json,
        }
    }
}

impl ModuleLoaderVTable {
    /// Create a loader that only allows built-in modules
    pub fn builtins_only() -> Self {
        Self {
            resolve: builtins_only_resolve,
            load: builtins_only_load,
            exists: |_, _| Ok(false),
            is_builtin: default_is_builtin,
            list_builtins: default_list_builtins,
            find_package_json: |_, _| None,
            read_package_json: |_, path| {
                Err(VsysError::ModuleLoad {
                    path: path.to_string(),
                    message: "Filesystem access not allowed".to_string(),
                })
            },
        }
    }
}

// Supported file extensions
const JS_EXTENSIONS: &[&str] = &[".js", ".mjs", ".cjs"];
const ALL_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".cjs", ".ts", ".mts", ".cts", ".tsx", ".jsx", ".json",
];

// Built-in modules (node: prefix)
const BUILTIN_MODULES: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "fs/promises",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "stream/web",
    "string_decoder",
    "sys",
    "timers",
    "timers/promises",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

fn default_is_builtin(specifier: &str) -> bool {
    let name = specifier.strip_prefix("node:").unwrap_or(specifier);
    BUILTIN_MODULES.contains(&name)
}

fn default_list_builtins() -> Vec<String> {
    BUILTIN_MODULES.iter().map(|s| s.to_string()).collect()
}

fn builtin(specifier: &str) -> ResolvedModule {
    ResolvedModule {
        path: specifier
            .strip_prefix("node:")
            .unwrap_or(specifier)
            .to_string(),
        format: ModuleFormat::ESM,
        is_builtin: true,
        needs_cjs_wrapper: false,
    }
}

fn resolution_failed(specifier: &str, reason: impl Into<String>) -> VsysError {
    VsysError::ResolutionFailed {
        specifier: specifier.to_string(),
        reason: reason.into(),
    }
}

/// A file found on disk, before canonicalization
struct Candidate {
    path: PathBuf,
    /// Owning package declares CommonJS
    is_cjs: bool,
}

fn default_resolve(
    fs: &FsVTable,
    packages: &PackageMap,
    specifier: &str,
    referrer: &str,
    is_esm: bool,
) -> VsysResult<ResolvedModule> {
    if specifier.starts_with("node:") || default_is_builtin(specifier) {
        if !default_is_builtin(specifier) {
            return Err(resolution_failed(specifier, "Unknown built-in module"));
        }
        return Ok(builtin(specifier));
    }

    let local = file_url_to_path(specifier)?;
    let base_dir = Path::new(referrer)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let candidate = match local {
        Some(target) => try_resolve_file(fs, &base_dir.join(target))?,
        None => try_resolve_bare(fs, packages, specifier, &base_dir, is_esm)?,
    };
    let Some(candidate) = candidate else {
        return Err(resolution_failed(specifier, "Cannot find module"));
    };

    let path = fs
        .canonicalize_sync(&candidate.path)
        .map_err(|e| match e {
            e if e.is_permission_denied() || e.is_fatal() => e,
            e => resolution_failed(specifier, e.to_string()),
        })?;

    let mut format = detect_format(&path);
    if candidate.is_cjs && path.extension().is_some_and(|e| e == "js") {
        format = ModuleFormat::CJS;
    }
    tracing::trace!(specifier, referrer, resolved = %path.display(), "resolved module");
    Ok(ResolvedModule {
        path: path.to_string_lossy().into_owned(),
        format,
        is_builtin: false,
        needs_cjs_wrapper: format == ModuleFormat::CJS && is_esm,
    })
}

/// `Some(path)` for relative, absolute and `file://` specifiers, `None` for
/// bare ones
fn file_url_to_path(specifier: &str) -> VsysResult<Option<PathBuf>> {
    if specifier.starts_with("file://") {
        let url = url::Url::parse(specifier)
            .map_err(|e| resolution_failed(specifier, e.to_string()))?;
        return url
            .to_file_path()
            .map(Some)
            .map_err(|_| resolution_failed(specifier, "Invalid file URL"));
    }
    if let Some((scheme, _)) = specifier.split_once("://") {
        return Err(resolution_failed(
            specifier,
            format!("Unsupported URL scheme '{}'", scheme),
        ));
    }
    let is_relative = specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
        || specifier.starts_with('/');
    Ok(is_relative.then(|| PathBuf::from(specifier)))
}

/// Append an extension without replacing an existing one
fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ext);
    PathBuf::from(os)
}

fn try_resolve_file(fs: &FsVTable, path: &Path) -> VsysResult<Option<Candidate>> {
    let found = |path: PathBuf| Some(Candidate { path, is_cjs: false });

    // Try exact path
    if fs.is_file_sync(path)? {
        return Ok(found(path.to_path_buf()));
    }

    // Try with extensions
    for ext in ALL_EXTENSIONS {
        let with_ext = with_suffix(path, ext);
        if fs.is_file_sync(&with_ext)? {
            return Ok(found(with_ext));
        }
    }

    // Try as directory with index
    if fs.is_dir_sync(path)? {
        for ext in ALL_EXTENSIONS {
            let index = path.join(format!("index{}", ext));
            if fs.is_file_sync(&index)? {
                return Ok(found(index));
            }
        }
    }

    Ok(None)
}

/// Split `@scope/pkg/sub` into `("@scope/pkg", Some("sub"))`
fn split_package_specifier(specifier: &str) -> Option<(&str, Option<&str>)> {
    let name_len = if specifier.starts_with('@') {
        let scope_end = specifier.find('/')?;
        specifier[scope_end + 1..]
            .find('/')
            .map_or(specifier.len(), |i| scope_end + 1 + i)
    } else {
        specifier.find('/').unwrap_or(specifier.len())
    };
    let (name, rest) = specifier.split_at(name_len);
    if name.is_empty() || name.ends_with('/') {
        return None;
    }
    let subpath = rest.strip_prefix('/').filter(|s| !s.is_empty());
    Some((name, subpath))
}

fn try_resolve_bare(
    fs: &FsVTable,
    packages: &PackageMap,
    specifier: &str,
    base_dir: &Path,
    is_esm: bool,
) -> VsysResult<Option<Candidate>> {
    let Some((name, subpath)) = split_package_specifier(specifier) else {
        return Err(resolution_failed(specifier, "Invalid package specifier"));
    };

    let mut package_dirs = Vec::new();
    if let Some(dir) = packages.dependencies.get(name) {
        package_dirs.push(dir.clone());
    }
    let start = fs.absolute(base_dir);
    package_dirs.extend(
        start
            .ancestors()
            .filter(|dir| dir.file_name().map_or(true, |n| n != "node_modules"))
            .map(|dir| dir.join("node_modules").join(name)),
    );
    if let Some(cache) = &packages.global_cache {
        package_dirs.push(cache.join(name));
    }

    let mut first_denial = None;
    for dir in package_dirs {
        match try_resolve_package(fs, &dir, subpath, is_esm) {
            Ok(Some(candidate)) => return Ok(Some(candidate)),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if e.is_permission_denied() => {
                tracing::trace!(dir = %dir.display(), "skipping denied package location");
                first_denial.get_or_insert(e);
            }
            Err(e) => {
                tracing::trace!(dir = %dir.display(), error = %e, "skipping package location");
            }
        }
    }

    match first_denial {
        Some(denial) => Err(denial),
        None => Ok(None),
    }
}

fn try_resolve_package(
    fs: &FsVTable,
    dir: &Path,
    subpath: Option<&str>,
    is_esm: bool,
) -> VsysResult<Option<Candidate>> {
    if !fs.is_dir_sync(dir)? {
        return Ok(None);
    }

    let package_json = dir.join("package.json");
    let json = if fs.is_file_sync(&package_json)? {
        Some(default_read_package_json(
            fs,
            &package_json.to_string_lossy(),
        )?)
    } else {
        None
    };
    // Determine if CJS based on type field
    let is_cjs = json
        .as_ref()
        .and_then(|j| j.get("type"))
        .and_then(|t| t.as_str())
        .map_or(true, |t| t != "module");
    let mark = |candidate: Option<Candidate>| {
        candidate.map(|c| Candidate {
            path: c.path,
            is_cjs,
        })
    };

    if let Some(subpath) = subpath {
        return Ok(mark(try_resolve_file(fs, &dir.join(subpath))?));
    }

    if let Some(json) = &json {
        for entry in package_entries(json, is_esm) {
            if let Some(candidate) = try_resolve_file(fs, &dir.join(entry))? {
                return Ok(mark(Some(candidate)));
            }
        }
    }

    // Try index as fallback
    for ext in JS_EXTENSIONS {
        let index = dir.join(format!("index{}", ext));
        if fs.is_file_sync(&index)? {
            return Ok(mark(Some(Candidate { path: index, is_cjs })));
        }
    }
    Ok(None)
}

/// Entry points named by package.json in preference order: `exports`
/// (`import` or `require` depending on who asks, then `default`), `module`
/// for ESM importers only, then `main`
fn package_entries(json: &serde_json::Value, is_esm: bool) -> Vec<&str> {
    let (condition, fields): (&str, &[&str]) = if is_esm {
        ("import", &["module", "main"])
    } else {
        ("require", &["main"])
    };
    let mut entries = Vec::new();
    match json.get("exports") {
        Some(serde_json::Value::String(entry)) => entries.push(entry.as_str()),
        Some(exports) => {
            let root = exports.get(".").unwrap_or(exports);
            match root {
                serde_json::Value::String(entry) => entries.push(entry.as_str()),
                _ => entries.extend(
                    [condition, "default"]
                        .iter()
                        .filter_map(|k| root.get(*k).and_then(|v| v.as_str())),
                ),
            }
        }
        None => {}
    }
    entries.extend(
        fields
            .iter()
            .filter_map(|k| json.get(*k).and_then(|v| v.as_str())),
    );
    entries
}

fn detect_format(path: &Path) -> ModuleFormat {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "mjs" | "mts" => ModuleFormat::ESM,
        "cjs" | "cts" => ModuleFormat::CJS,
        "json" => ModuleFormat::Json,
        "js" | "ts" | "tsx" | "jsx" => ModuleFormat::ESM,
        _ => ModuleFormat::Binary,
    }
}

fn default_load(fs: &FsVTable, path: &str) -> VsysResult<ModuleSource> {
    // Built-in modules are handled separately
    if default_is_builtin(path) {
        return Err(VsysError::ModuleLoad {
            path: path.to_string(),
            message: "Built-in modules should be loaded by the runtime".to_string(),
        });
    }

    let path_obj = Path::new(path);
    let source = fs.read_sync(path_obj)?;
    let format = detect_format(path_obj);

    Ok(ModuleSource {
        source,
        format,
        path: path.to_string(),
    })
}

fn default_exists(fs: &FsVTable, path: &str) -> VsysResult<bool> {
    fs.exists_sync(Path::new(path))
}

fn default_find_package_json(fs: &FsVTable, start_dir: &str) -> Option<String> {
    let mut current_dir = fs.absolute(Path::new(start_dir));
    loop {
        let package_json_path = current_dir.join("package.json");
        if fs.is_file_sync(&package_json_path).unwrap_or(false) {
            return Some(package_json_path.to_string_lossy().into_owned());
        }
        if !current_dir.pop() {
            break;
        }
    }
    None
}

fn default_read_package_json(fs: &FsVTable, path: &str) -> VsysResult<serde_json::Value> {
    let content = fs.read_sync(Path::new(path))?;
    serde_json::from_slice(&content).map_err(|e| VsysError::ModuleLoad {
        path: path.to_string(),
        message: format!("Failed to parse package.json: {}", e),
    })
}

fn builtins_only_resolve(
    _fs: &FsVTable,
    _packages: &PackageMap,
    specifier: &str,
    _referrer: &str,
    _is_esm: bool,
) -> VsysResult<ResolvedModule> {
    if default_is_builtin(specifier) {
        return Ok(builtin(specifier));
    }
    Err(resolution_failed(specifier, "Only built-in modules are allowed"))
}

fn builtins_only_load(_fs: &FsVTable, path: &str) -> VsysResult<ModuleSource> {
    Err(VsysError::ModuleLoad {
        path: path.to_string(),
        message: "Only built-in modules are allowed".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::MemoryFs;
    use crate::gate::{ExecutionContext, PermissionGate};
    use crate::permissions::{CapabilityKind, PermissionStore, ScopePattern};

    fn project_fs(memory: MemoryFs) -> FsVTable {
        let store = PermissionStore::default();
        store
            .grant(CapabilityKind::FsRead, ScopePattern::path("/project"))
            .unwrap();
        FsVTable::new(
            Arc::new(memory),
            PermissionGate::new(store, ExecutionContext::main()),
            Path::new("/project"),
        )
    }

    fn resolve(fs: &FsVTable, packages: &PackageMap, specifier: &str) -> VsysResult<ResolvedModule> {
        (ModuleLoaderVTable::default().resolve)(fs, packages, specifier, "/project/src/main.js", true)
    }

    #[test]
    fn test_is_builtin() {
        assert!(default_is_builtin("fs"));
        assert!(default_is_builtin("node:fs"));
        assert!(default_is_builtin("path"));
        assert!(!default_is_builtin("lodash"));
        assert!(!default_is_builtin("./foo"));
    }

    #[test]
    fn test_resolve_builtin() {
        let fs = project_fs(MemoryFs::new());
        let result = resolve(&fs, &PackageMap::new(), "node:fs").unwrap();
        assert!(result.is_builtin);
        assert_eq!(result.path, "fs");
        assert!(resolve(&fs, &PackageMap::new(), "node:nope").is_err());
    }

    #[test]
    fn test_builtins_only() {
        let vtable = ModuleLoaderVTable::builtins_only();
        let fs = project_fs(MemoryFs::new().with_file("/project/src/foo.js", ""));

        // Built-in should work
        let result = (vtable.resolve)(&fs, &PackageMap::new(), "fs", "/app/index.js", true);
        assert!(result.is_ok());

        // Non-builtin should fail
        let result = (vtable.resolve)(&fs, &PackageMap::new(), "./foo", "/project/src/main.js", true);
        assert!(matches!(result, Err(VsysError::ResolutionFailed { .. })));
        assert!(!(vtable.exists)(&fs, "/project/src/foo.js").unwrap());
    }

    #[test]
    fn test_resolve_relative_extensions_and_index() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file("/project/src/util.ts", "")
                .with_file("/project/src/config.json", "{}")
                .with_file("/project/src/lib/index.mjs", "")
                .with_file("/project/src/v1.2.js", "")
                .with_file("/project/shared.cjs", ""),
        );
        let packages = PackageMap::new();

        let util = resolve(&fs, &packages, "./util").unwrap();
        assert_eq!(util.path, "/project/src/util.ts");
        assert_eq!(util.format, ModuleFormat::ESM);

        assert_eq!(
            resolve(&fs, &packages, "./config.json").unwrap().format,
            ModuleFormat::Json
        );
        assert_eq!(
            resolve(&fs, &packages, "./lib").unwrap().path,
            "/project/src/lib/index.mjs"
        );
        // the extension is appended, not substituted
        assert_eq!(
            resolve(&fs, &packages, "./v1.2").unwrap().path,
            "/project/src/v1.2.js"
        );

        let shared = resolve(&fs, &packages, "../shared").unwrap();
        assert_eq!(shared.format, ModuleFormat::CJS);
        assert!(shared.needs_cjs_wrapper);

        assert_eq!(
            resolve(&fs, &packages, "file:///project/src/util.ts").unwrap().path,
            "/project/src/util.ts"
        );
        assert!(matches!(
            resolve(&fs, &packages, "./missing"),
            Err(VsysError::ResolutionFailed { .. })
        ));
        assert!(matches!(
            resolve(&fs, &packages, "https://cdn.example.com/x.js"),
            Err(VsysError::ResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_denied_path_is_permission_error() {
        let fs = project_fs(MemoryFs::new().with_file("/etc/init.js", ""));
        let err = resolve(&fs, &PackageMap::new(), "/etc/init.js").unwrap_err();
        assert!(matches!(
            err,
            VsysError::PermissionDenied { capability: CapabilityKind::FsRead, ref scope }
                if scope == "/etc/init.js"
        ));
        let err = resolve(&fs, &PackageMap::new(), "../../etc/init").unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_symlinked_module_outside_scope() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file("/secret/payload.js", "")
                .with_symlink("/project/src/evil.js", "/secret/payload.js"),
        );
        let err = resolve(&fs, &PackageMap::new(), "./evil.js").unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_node_modules_walk() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file(
                    "/project/node_modules/lodash/package.json",
                    r#"{"main": "lodash.js"}"#,
                )
                .with_file("/project/node_modules/lodash/lodash.js", "")
                .with_file("/project/node_modules/lodash/fp.js", "")
                .with_file(
                    "/project/node_modules/@acme/ui/package.json",
                    r#"{"type": "module", "exports": {".": {"import": "./esm/index.js", "require": "./cjs/index.js"}}}"#,
                )
                .with_file("/project/node_modules/@acme/ui/esm/index.js", "")
                .with_file("/project/node_modules/plain/index.js", ""),
        );
        let packages = PackageMap::new();

        let lodash = resolve(&fs, &packages, "lodash").unwrap();
        assert_eq!(lodash.path, "/project/node_modules/lodash/lodash.js");
        // no "type": "module" means CommonJS
        assert_eq!(lodash.format, ModuleFormat::CJS);
        assert!(lodash.needs_cjs_wrapper);

        assert_eq!(
            resolve(&fs, &packages, "lodash/fp").unwrap().path,
            "/project/node_modules/lodash/fp.js"
        );

        let ui = resolve(&fs, &packages, "@acme/ui").unwrap();
        assert_eq!(ui.path, "/project/node_modules/@acme/ui/esm/index.js");
        assert_eq!(ui.format, ModuleFormat::ESM);

        assert_eq!(
            resolve(&fs, &packages, "plain").unwrap().path,
            "/project/node_modules/plain/index.js"
        );
        // the walk ends at /node_modules, outside the readable tree
        assert!(resolve(&fs, &packages, "missing-pkg")
            .unwrap_err()
            .is_permission_denied());

        fs.gate()
            .store()
            .grant(CapabilityKind::FsRead, ScopePattern::path("/"))
            .unwrap();
        assert!(matches!(
            resolve(&fs, &packages, "missing-pkg"),
            Err(VsysError::ResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_dual_package_picks_condition_by_importer() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file(
                    "/project/node_modules/dual/package.json",
                    r#"{"exports": {".": {"import": "./esm.mjs", "require": "./cjs.cjs"}}, "module": "./esm.mjs", "main": "./cjs.cjs"}"#,
                )
                .with_file("/project/node_modules/dual/esm.mjs", "")
                .with_file("/project/node_modules/dual/cjs.cjs", "")
                .with_file(
                    "/project/node_modules/fields/package.json",
                    r#"{"module": "./lib.mjs", "main": "./lib.cjs"}"#,
                )
                .with_file("/project/node_modules/fields/lib.mjs", "")
                .with_file("/project/node_modules/fields/lib.cjs", ""),
        );
        let packages = PackageMap::new();
        let referrer = "/project/src/main.js";

        let imported = default_resolve(&fs, &packages, "dual", referrer, true).unwrap();
        assert_eq!(imported.path, "/project/node_modules/dual/esm.mjs");
        assert_eq!(imported.format, ModuleFormat::ESM);

        let required = default_resolve(&fs, &packages, "dual", referrer, false).unwrap();
        assert_eq!(required.path, "/project/node_modules/dual/cjs.cjs");
        assert_eq!(required.format, ModuleFormat::CJS);
        assert!(!required.needs_cjs_wrapper);

        // `module` is an ESM-only field
        assert_eq!(
            default_resolve(&fs, &packages, "fields", referrer, true).unwrap().path,
            "/project/node_modules/fields/lib.mjs"
        );
        assert_eq!(
            default_resolve(&fs, &packages, "fields", referrer, false).unwrap().path,
            "/project/node_modules/fields/lib.cjs"
        );
    }

    #[test]
    fn test_package_map_and_global_cache() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file("/project/.deps/react/index.js", "")
                .with_file("/project/node_modules/react/index.js", "")
                .with_file("/project/.cache/left-pad/package.json", r#"{"module": "lib.mjs"}"#)
                .with_file("/project/.cache/left-pad/lib.mjs", "")
                .with_file("/cache/denied/index.js", ""),
        );
        let packages = PackageMap::new()
            .with_dependency("react", "/project/.deps/react")
            .with_global_cache("/project/.cache");

        assert_eq!(
            resolve(&fs, &packages, "react").unwrap().path,
            "/project/.deps/react/index.js"
        );
        assert_eq!(
            resolve(&fs, &packages, "left-pad").unwrap().path,
            "/project/.cache/left-pad/lib.mjs"
        );

        // a denied location is reported once nothing else resolves
        let packages = PackageMap::new().with_global_cache("/cache");
        assert!(resolve(&fs, &packages, "denied")
            .unwrap_err()
            .is_permission_denied());
    }

    #[test]
    fn test_load_and_package_json_helpers() {
        let fs = project_fs(
            MemoryFs::new()
                .with_file("/project/package.json", r#"{"name": "app"}"#)
                .with_file("/project/src/main.js", "export default 1")
                .with_file("/etc/passwd", "root"),
        );
        let vtable = ModuleLoaderVTable::default();

        let source = (vtable.load)(&fs, "/project/src/main.js").unwrap();
        assert_eq!(source.source, b"export default 1");
        assert_eq!(source.format, ModuleFormat::ESM);
        assert!((vtable.load)(&fs, "/etc/passwd")
            .unwrap_err()
            .is_permission_denied());
        assert!((vtable.load)(&fs, "fs").is_err());

        let found = (vtable.find_package_json)(&fs, "/project/src").unwrap();
        assert_eq!(found, "/project/package.json");
        let json = (vtable.read_package_json)(&fs, &found).unwrap();
        assert_eq!(json["name"], "app");
        assert!((vtable.exists)(&fs, "/project/src/main.js").unwrap());
    }

    #[test]
    fn test_split_package_specifier() {
        assert_eq!(split_package_specifier("pkg"), Some(("pkg", None)));
        assert_eq!(split_package_specifier("pkg/a/b"), Some(("pkg", Some("a/b"))));
        assert_eq!(split_package_specifier("@s/pkg"), Some(("@s/pkg", None)));
        assert_eq!(split_package_specifier("@s/pkg/x"), Some(("@s/pkg", Some("x"))));
        assert_eq!(split_package_specifier("@s"), None);
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("foo.mjs")), ModuleFormat::ESM);
        assert_eq!(detect_format(Path::new("foo.cjs")), ModuleFormat::CJS);
        assert_eq!(detect_format(Path::new("foo.json")), ModuleFormat::Json);
        assert_eq!(detect_format(Path::new("foo.js")), ModuleFormat::ESM);
    }

    #[test]
    fn test_package_map_from_json() {
        let map = PackageMap::from_json_str(
            r#"{"dependencies": {"react": "/deps/react"}, "global_cache": "/cache"}"#,
        )
        .unwrap();
        assert_eq!(map.dependencies["react"], PathBuf::from("/deps/react"));
        assert_eq!(map.global_cache, Some(PathBuf::from("/cache")));
    }
}
