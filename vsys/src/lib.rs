//! # vsys - Virtual System Layer for Xmas.JS
//!
//! `vsys` sits between script-facing bindings and the operating system.
//! Every filesystem, network, environment, subprocess and module-loading
//! operation goes through a capability vtable that asks the shared
//! [`PermissionStore`] first and only then delegates to a swappable backend.
//!
//! ## Design Goals
//!
//! - **Deny by default**: nothing is reachable until a rule grants it
//! - **One store per runtime**: main and worker contexts share grants
//! - **Swappable backends**: real, in-memory or refuse-everything, chosen at
//!   construction
//! - **Uniform enforcement**: the module loader reads through the same gated
//!   fs vtable as script code
//!
//! ## Usage
//!
//! ```rust,ignore
//! // Real system, nothing granted
//! let vsys = Vsys::new();
//!
//! // Project sandbox from a host policy
//! let vsys = Vsys::builder()
//!     .cwd("/project")
//!     .permissions(Permissions::from_toml_str(policy)?)
//!     .prompt_handler(Arc::new(handler))
//!     .build()?;
//!
//! let worker = vsys.clone_for_worker();
//! ```

pub mod env;
pub mod error;
pub mod fs;
pub mod gate;
pub mod module_loader;
pub mod net;
pub mod path;
pub mod permissions;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use env::{DeniedEnv, EnvBackend, EnvVTable, MockEnv, RealEnv};
pub use error::{CVsysError, VsysError, VsysResult};
pub use fs::{DeniedFs, FsBackend, FsVTable, MemoryFs, RealFs};
pub use gate::{ContextKind, ExecutionContext, PermissionGate};
pub use module_loader::{
    ModuleFormat, ModuleLoaderVTable, ModuleSource, PackageMap, ResolvedModule,
};
pub use net::{DeniedNet, MockNet, NetBackend, NetStream, NetVTable, RealNet};
pub use permissions::{
    BlackOrWhiteList, CapabilityKind, CapabilityRequest, Decision, Domain, PermissionStore,
    Permissions, PromptAnswer, PromptHandler, RuleDecision, RuleSet, ScopePattern,
};
pub use process::{
    CommandSpec, DeniedProcess, MockProcess, ProcessBackend, ProcessOutput, ProcessVTable,
    RealProcess,
};

use permissions::DefaultPosture;

/// The main vsys context that holds all virtual system tables.
///
/// One `Vsys` belongs to one execution context. Clones share everything,
/// including the context; use [`Vsys::clone_for_worker`] for a new worker.
#[derive(Clone)]
pub struct Vsys {
    fs: FsVTable,
    net: NetVTable,
    env: EnvVTable,
    process: ProcessVTable,
    module_loader: Arc<ModuleLoaderVTable>,
    packages: Arc<PackageMap>,
    gate: PermissionGate,
}

impl std::fmt::Debug for Vsys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vsys")
            .field("context", self.gate.context())
            .field("cwd", &self.fs.cwd())
            .field("permissions", self.gate.store())
            .finish_non_exhaustive()
    }
}

impl Default for Vsys {
    fn default() -> Self {
        Self::new()
    }
}

/// The process working directory, or `/` if it cannot be determined
fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

impl Vsys {
    /// Real backends, nothing granted
    pub fn new() -> Self {
        Self::assemble(
            Backends::real(),
            PermissionStore::default(),
            &current_dir(),
            ModuleLoaderVTable::default(),
            PackageMap::default(),
        )
    }

    /// Real backends, everything granted
    pub fn allow_all() -> Self {
        let mut rules = RuleSet::new();
        for domain in Domain::ALL {
            rules.set_default(domain, DefaultPosture::Allow);
        }
        Self::assemble(
            Backends::real(),
            PermissionStore::new(rules),
            &current_dir(),
            ModuleLoaderVTable::default(),
            PackageMap::default(),
        )
    }

    /// Refusing backends, nothing granted, built-in modules only
    pub fn sandboxed() -> Self {
        Self::assemble(
            Backends::denied(),
            PermissionStore::default(),
            Path::new("/"),
            ModuleLoaderVTable::builtins_only(),
            PackageMap::default(),
        )
    }

    /// Create a new builder for customizing Vsys
    pub fn builder() -> VsysBuilder {
        VsysBuilder::default()
    }

    fn assemble(
        backends: Backends,
        store: PermissionStore,
        cwd: &Path,
        module_loader: ModuleLoaderVTable,
        packages: PackageMap,
    ) -> Self {
        let gate = PermissionGate::new(store, ExecutionContext::main());
        Self {
            fs: FsVTable::new(backends.fs, gate.clone(), cwd),
            net: NetVTable::new(backends.net, gate.clone()),
            env: EnvVTable::new(backends.env, gate.clone()),
            process: ProcessVTable::new(backends.process, gate.clone()),
            module_loader: Arc::new(module_loader),
            packages: Arc::new(packages),
            gate,
        }
    }

    #[inline]
    pub fn fs(&self) -> &FsVTable {
        &self.fs
    }

    #[inline]
    pub fn net(&self) -> &NetVTable {
        &self.net
    }

    #[inline]
    pub fn env(&self) -> &EnvVTable {
        &self.env
    }

    #[inline]
    pub fn process(&self) -> &ProcessVTable {
        &self.process
    }

    #[inline]
    pub fn module_loader(&self) -> &ModuleLoaderVTable {
        &self.module_loader
    }

    #[inline]
    pub fn packages(&self) -> &PackageMap {
        &self.packages
    }

    /// The store shared with every worker of this runtime
    #[inline]
    pub fn permissions(&self) -> &PermissionStore {
        self.gate.store()
    }

    #[inline]
    pub fn context(&self) -> &ExecutionContext {
        self.gate.context()
    }

    /// Handle for a new worker: same store and backends, fresh context
    /// whose teardown is tied to this one
    pub fn clone_for_worker(&self) -> Vsys {
        let gate = self.gate.for_context(self.gate.context().spawn_worker());
        tracing::debug!(parent = %self.gate.context(), worker = %gate.context(), "spawning worker vsys");
        Self {
            fs: self.fs.with_gate(gate.clone()),
            net: self.net.with_gate(gate.clone()),
            env: self.env.with_gate(gate.clone()),
            process: self.process.with_gate(gate.clone()),
            module_loader: Arc::clone(&self.module_loader),
            packages: Arc::clone(&self.packages),
            gate,
        }
    }

    /// Cancel this context; its pending prompts, and those of its workers,
    /// resolve to denied
    pub fn terminate(&self) {
        self.gate.context().terminate();
    }

    pub fn resolve_module(
        &self,
        specifier: &str,
        referrer: &str,
        is_esm: bool,
    ) -> VsysResult<ResolvedModule> {
        (self.module_loader.resolve)(&self.fs, &self.packages, specifier, referrer, is_esm)
    }

    pub fn load_module(&self, path: &str) -> VsysResult<ModuleSource> {
        (self.module_loader.load)(&self.fs, path)
    }

    /// Resolve and load on the blocking pool. Built-ins have no source.
    pub async fn import(
        &self,
        specifier: &str,
        referrer: &str,
        is_esm: bool,
    ) -> VsysResult<(ResolvedModule, Option<ModuleSource>)> {
        let this = self.clone();
        let specifier = specifier.to_string();
        let referrer = referrer.to_string();
        tokio::task::spawn_blocking(move || {
            let resolved = this.resolve_module(&specifier, &referrer, is_esm)?;
            if resolved.is_builtin {
                return Ok((resolved, None));
            }
            let source = this.load_module(&resolved.path)?;
            Ok((resolved, Some(source)))
        })
        .await
        .map_err(|e| VsysError::io(Domain::Fs, std::io::Error::other(e)))?
    }
}

struct Backends {
    fs: Arc<dyn FsBackend>,
    net: Arc<dyn NetBackend>,
    env: Arc<dyn EnvBackend>,
    process: Arc<dyn ProcessBackend>,
}

impl Backends {
    fn real() -> Self {
        Self {
            fs: Arc::new(RealFs),
            net: Arc::new(RealNet),
            env: Arc::new(RealEnv),
            process: Arc::new(RealProcess),
        }
    }

    fn denied() -> Self {
        Self {
            fs: Arc::new(DeniedFs),
            net: Arc::new(DeniedNet),
            env: Arc::new(DeniedEnv),
            process: Arc::new(DeniedProcess),
        }
    }
}

/// Builder for constructing a customized Vsys instance
///
/// Unset backends default to the real system, unset permissions to
/// deny-all, unset working directory to the process's.
#[derive(Default)]
pub struct VsysBuilder {
    fs: Option<Arc<dyn FsBackend>>,
    net: Option<Arc<dyn NetBackend>>,
    env: Option<Arc<dyn EnvBackend>>,
    process: Option<Arc<dyn ProcessBackend>>,
    module_loader: Option<ModuleLoaderVTable>,
    packages: Option<PackageMap>,
    permissions: Option<Permissions>,
    prompt_handler: Option<Arc<dyn PromptHandler>>,
    prompt_timeout: Option<Duration>,
    cwd: Option<PathBuf>,
}

impl VsysBuilder {
    pub fn fs(mut self, backend: Arc<dyn FsBackend>) -> Self {
        self.fs = Some(backend);
        self
    }

    pub fn net(mut self, backend: Arc<dyn NetBackend>) -> Self {
        self.net = Some(backend);
        self
    }

    pub fn env(mut self, backend: Arc<dyn EnvBackend>) -> Self {
        self.env = Some(backend);
        self
    }

    pub fn process(mut self, backend: Arc<dyn ProcessBackend>) -> Self {
        self.process = Some(backend);
        self
    }

    pub fn module_loader(mut self, loader: ModuleLoaderVTable) -> Self {
        self.module_loader = Some(loader);
        self
    }

    pub fn packages(mut self, packages: PackageMap) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn prompt_handler(mut self, handler: Arc<dyn PromptHandler>) -> Self {
        self.prompt_handler = Some(handler);
        self
    }

    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = Some(timeout);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Fails if the permission policy contains an invalid entry
    pub fn build(self) -> VsysResult<Vsys> {
        let cwd = self.cwd.unwrap_or_else(current_dir);
        let rules = match &self.permissions {
            Some(permissions) => permissions.to_rule_set(&cwd)?,
            None => RuleSet::new(),
        };
        let store = PermissionStore::with_prompt(rules, self.prompt_handler, self.prompt_timeout);
        let real = Backends::real();
        let backends = Backends {
            fs: self.fs.unwrap_or(real.fs),
            net: self.net.unwrap_or(real.net),
            env: self.env.unwrap_or(real.env),
            process: self.process.unwrap_or(real.process),
        };
        Ok(Vsys::assemble(
            backends,
            store,
            &cwd,
            self.module_loader.unwrap_or_default(),
            self.packages.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vsys_denies() {
        let vsys = Vsys::default();
        let err = vsys.env().get_sync("PATH").unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(vsys.context().kind(), ContextKind::Main);
    }

    #[test]
    fn test_allow_all_vsys() {
        let vsys = Vsys::allow_all();
        let req = CapabilityRequest::spawn("anything");
        assert_eq!(vsys.permissions().check(&req).unwrap(), Decision::Granted);
    }

    #[test]
    fn test_sandboxed_vsys() {
        let vsys = Vsys::sandboxed();
        vsys.permissions()
            .grant(CapabilityKind::FsRead, ScopePattern::Any)
            .unwrap();
        // the backend still refuses
        assert!(vsys
            .fs()
            .read_sync(Path::new("/etc/hosts"))
            .unwrap_err()
            .is_permission_denied());
        assert!(vsys.resolve_module("node:path", "/main.js", true).unwrap().is_builtin);
        assert!(vsys.resolve_module("./x.js", "/main.js", true).is_err());
    }

    #[test]
    fn test_builder() {
        let vsys = Vsys::builder()
            .fs(Arc::new(MemoryFs::new().with_file("/app/main.js", "1")))
            .cwd("/app")
            .permissions(Permissions {
                fs_read: BlackOrWhiteList::whitelist(["."]),
                ..Permissions::deny_all()
            })
            .build()
            .unwrap();
        assert_eq!(vsys.fs().read_to_string_sync(Path::new("main.js")).unwrap(), "1");
        assert!(vsys
            .fs()
            .write_sync(Path::new("main.js"), b"2")
            .unwrap_err()
            .is_permission_denied());
    }

    #[test]
    fn test_worker_shares_store_and_backends() {
        let vsys = Vsys::builder()
            .fs(Arc::new(MemoryFs::new()))
            .build()
            .unwrap();
        let worker = vsys.clone_for_worker();
        assert!(worker.permissions().same_store(vsys.permissions()));
        assert!(worker.fs().same_backend(vsys.fs()));
        assert_eq!(worker.context().kind(), ContextKind::Worker);
        assert_ne!(worker.context().id(), vsys.context().id());

        worker.terminate();
        assert!(worker.context().is_terminated());
        assert!(!vsys.context().is_terminated());
    }

    #[tokio::test]
    async fn test_import() {
        let vsys = Vsys::builder()
            .fs(Arc::new(MemoryFs::new().with_file("/app/dep.mjs", "export {}")))
            .cwd("/app")
            .build()
            .unwrap();
        vsys.permissions()
            .grant(CapabilityKind::FsRead, ScopePattern::path("/app"))
            .unwrap();

        let (resolved, source) = vsys.import("./dep", "/app/main.js", true).await.unwrap();
        assert_eq!(resolved.path, "/app/dep.mjs");
        assert_eq!(source.unwrap().source, b"export {}");

        let (resolved, source) = vsys.import("fs", "/app/main.js", true).await.unwrap();
        assert!(resolved.is_builtin);
        assert!(source.is_none());
    }
}
