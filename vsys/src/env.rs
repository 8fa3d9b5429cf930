//! Environment variable virtual table for vsys

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{VsysError, VsysResult};
use crate::gate::PermissionGate;
use crate::permissions::{CapabilityKind, CapabilityRequest};

pub trait EnvBackend: Send + Sync {
    fn get(&self, name: &str) -> VsysResult<Option<String>>;
    fn set(&self, name: &str, value: &str) -> VsysResult<()>;
    fn remove(&self, name: &str) -> VsysResult<()>;
    fn vars(&self) -> VsysResult<Vec<(String, String)>>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct RealEnv;

impl EnvBackend for RealEnv {
    fn get(&self, name: &str) -> VsysResult<Option<String>> {
        match std::env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(VsysError::InvalidArgument(format!("{name}: {e}"))),
        }
    }

    fn set(&self, name: &str, value: &str) -> VsysResult<()> {
        if value.contains('\0') {
            return Err(VsysError::InvalidArgument(format!(
                "value of {name} contains a NUL byte"
            )));
        }
        std::env::set_var(name, value);
        Ok(())
    }

    fn remove(&self, name: &str) -> VsysResult<()> {
        std::env::remove_var(name);
        Ok(())
    }

    fn vars(&self) -> VsysResult<Vec<(String, String)>> {
        Ok(std::env::vars().collect())
    }
}

/// In-memory environment
#[derive(Debug, Default)]
pub struct MockEnv {
    vars: RwLock<HashMap<String, String>>,
}

impl MockEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value.into());
        self
    }
}

impl EnvBackend for MockEnv {
    fn get(&self, name: &str) -> VsysResult<Option<String>> {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
        Ok(vars.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> VsysResult<()> {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> VsysResult<()> {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.remove(name);
        Ok(())
    }

    fn vars(&self) -> VsysResult<Vec<(String, String)>> {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
        Ok(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Backend that refuses every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedEnv;

impl EnvBackend for DeniedEnv {
    fn get(&self, name: &str) -> VsysResult<Option<String>> {
        Err(VsysError::denied(CapabilityKind::EnvRead, name))
    }

    fn set(&self, name: &str, _: &str) -> VsysResult<()> {
        Err(VsysError::denied(CapabilityKind::EnvWrite, name))
    }

    fn remove(&self, name: &str) -> VsysResult<()> {
        Err(VsysError::denied(CapabilityKind::EnvWrite, name))
    }

    fn vars(&self) -> VsysResult<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

// Names std::env would panic on
fn validate_name(name: &str) -> VsysResult<()> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(VsysError::InvalidArgument(format!(
            "invalid environment variable name {name:?}"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct EnvVTable {
    backend: Arc<dyn EnvBackend>,
    gate: PermissionGate,
}

impl std::fmt::Debug for EnvVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvVTable")
            .field("context", self.gate.context())
            .finish_non_exhaustive()
    }
}

impl EnvVTable {
    pub fn new(backend: Arc<dyn EnvBackend>, gate: PermissionGate) -> Self {
        Self { backend, gate }
    }

    pub fn with_gate(&self, gate: PermissionGate) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            gate,
        }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn same_backend(&self, other: &EnvVTable) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    pub fn get_sync(&self, name: &str) -> VsysResult<Option<String>> {
        validate_name(name)?;
        self.gate
            .authorize_sync(&CapabilityRequest::env(CapabilityKind::EnvRead, name))?;
        self.backend.get(name)
    }

    pub async fn get(&self, name: &str) -> VsysResult<Option<String>> {
        validate_name(name)?;
        self.gate
            .authorize(&CapabilityRequest::env(CapabilityKind::EnvRead, name))
            .await?;
        self.backend.get(name)
    }

    pub fn set_sync(&self, name: &str, value: &str) -> VsysResult<()> {
        validate_name(name)?;
        self.gate
            .authorize_sync(&CapabilityRequest::env(CapabilityKind::EnvWrite, name))?;
        tracing::debug!(name, "setting environment variable");
        self.backend.set(name, value)
    }

    pub async fn set(&self, name: &str, value: &str) -> VsysResult<()> {
        validate_name(name)?;
        self.gate
            .authorize(&CapabilityRequest::env(CapabilityKind::EnvWrite, name))
            .await?;
        tracing::debug!(name, "setting environment variable");
        self.backend.set(name, value)
    }

    pub fn remove_sync(&self, name: &str) -> VsysResult<()> {
        validate_name(name)?;
        self.gate
            .authorize_sync(&CapabilityRequest::env(CapabilityKind::EnvWrite, name))?;
        self.backend.remove(name)
    }

    pub async fn remove(&self, name: &str) -> VsysResult<()> {
        validate_name(name)?;
        self.gate
            .authorize(&CapabilityRequest::env(CapabilityKind::EnvWrite, name))
            .await?;
        self.backend.remove(name)
    }

    /// Variables whose read is granted; the rest are silently left out
    pub fn vars(&self) -> VsysResult<Vec<(String, String)>> {
        let mut visible = Vec::new();
        for (name, value) in self.backend.vars()? {
            if self
                .gate
                .is_granted(&CapabilityRequest::env(CapabilityKind::EnvRead, &name))?
            {
                visible.push((name, value));
            }
        }
        visible.sort();
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ExecutionContext;
    use crate::permissions::{PermissionStore, ScopePattern};

    fn vtable(backend: Arc<dyn EnvBackend>) -> EnvVTable {
        EnvVTable::new(
            backend,
            PermissionGate::new(PermissionStore::default(), ExecutionContext::main()),
        )
    }

    #[test]
    fn test_reads_are_gated() {
        let env = vtable(Arc::new(
            MockEnv::new()
                .with_var("HOME", "/home/me")
                .with_var("APP_MODE", "dev")
                .with_var("APP_KEY", "k")
                .with_var("SECRET", "s"),
        ));
        assert!(env.get_sync("HOME").unwrap_err().is_permission_denied());

        let store = env.gate().store();
        store
            .grant(CapabilityKind::EnvRead, ScopePattern::name("HOME"))
            .unwrap();
        store
            .grant(CapabilityKind::EnvRead, ScopePattern::name("APP_*"))
            .unwrap();
        store
            .deny(CapabilityKind::EnvRead, ScopePattern::name("APP_KEY"))
            .unwrap();

        assert_eq!(env.get_sync("HOME").unwrap().as_deref(), Some("/home/me"));
        assert_eq!(env.get_sync("APP_MISSING").unwrap(), None);
        assert_eq!(
            env.vars().unwrap(),
            vec![
                ("APP_MODE".to_string(), "dev".to_string()),
                ("HOME".to_string(), "/home/me".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_writes_need_env_write() {
        let mock = Arc::new(MockEnv::new());
        let env = vtable(mock.clone());
        env.gate()
            .store()
            .grant(CapabilityKind::EnvRead, ScopePattern::Any)
            .unwrap();
        assert!(env.set("X", "1").await.unwrap_err().is_permission_denied());
        assert_eq!(mock.get("X").unwrap(), None);

        env.gate()
            .store()
            .grant(CapabilityKind::EnvWrite, ScopePattern::name("X"))
            .unwrap();
        env.set("X", "1").await.unwrap();
        assert_eq!(env.get("X").await.unwrap().as_deref(), Some("1"));
        env.remove("X").await.unwrap();
        assert_eq!(env.get_sync("X").unwrap(), None);
    }

    #[test]
    fn test_invalid_names_and_denied_backend() {
        let env = vtable(Arc::new(DeniedEnv));
        env.gate()
            .store()
            .grant(CapabilityKind::EnvRead, ScopePattern::Any)
            .unwrap();
        assert!(matches!(env.get_sync("A=B"), Err(VsysError::InvalidArgument(_))));
        assert!(matches!(env.get_sync(""), Err(VsysError::InvalidArgument(_))));
        assert!(env.get_sync("PATH").unwrap_err().is_permission_denied());
        assert!(env.vars().unwrap().is_empty());
    }
}
