//! Execution contexts and the permission checkpoint shared by all vtables.

use std::fmt;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{VsysError, VsysResult};
use crate::permissions::{CapabilityRequest, Decision, PermissionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Main,
    Worker,
}

/// Identity and lifetime of one script execution unit.
///
/// Cancelling a context resolves its pending permission prompts to denied.
/// A worker's token is a child of its parent's, so terminating the main
/// context also cancels every worker spawned from it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: Uuid,
    kind: ContextKind,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn main() -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ContextKind::Main,
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn_worker(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ContextKind::Worker,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn terminate(&self) {
        tracing::debug!(context = %self, "terminating context");
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ContextKind::Main => "main",
            ContextKind::Worker => "worker",
        };
        write!(f, "{}:{}", kind, self.id.simple())
    }
}

/// The single checkpoint every vtable operation goes through
#[derive(Debug, Clone)]
pub struct PermissionGate {
    store: PermissionStore,
    context: ExecutionContext,
}

impl PermissionGate {
    pub fn new(store: PermissionStore, context: ExecutionContext) -> Self {
        Self { store, context }
    }

    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Same store, different context
    pub fn for_context(&self, context: ExecutionContext) -> Self {
        Self {
            store: self.store.clone(),
            context,
        }
    }

    /// Non-suspending check: `PromptRequired` counts as denied
    pub fn authorize_sync(&self, request: &CapabilityRequest) -> VsysResult<()> {
        match self.store.check(request)? {
            Decision::Granted => Ok(()),
            Decision::Denied | Decision::PromptRequired => Err(self.denied(request)),
        }
    }

    /// Check, suspending on a host prompt if the rules ask for one
    pub async fn authorize(&self, request: &CapabilityRequest) -> VsysResult<()> {
        match self
            .store
            .request_interactive(request, &self.context.cancel)
            .await?
        {
            Decision::Granted => Ok(()),
            Decision::Denied | Decision::PromptRequired => Err(self.denied(request)),
        }
    }

    pub fn is_granted(&self, request: &CapabilityRequest) -> VsysResult<bool> {
        Ok(self.store.check(request)? == Decision::Granted)
    }

    fn denied(&self, request: &CapabilityRequest) -> VsysError {
        tracing::warn!(context = %self.context, %request, "permission denied");
        VsysError::denied(request.kind, request.scope.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{CapabilityKind, ScopePattern};

    #[test]
    fn test_worker_token_is_child() {
        let main = ExecutionContext::main();
        let worker = main.spawn_worker();
        assert_eq!(worker.kind(), ContextKind::Worker);
        assert_ne!(main.id(), worker.id());

        worker.terminate();
        assert!(worker.is_terminated());
        assert!(!main.is_terminated());

        let other = main.spawn_worker();
        main.terminate();
        assert!(other.is_terminated());
    }

    #[test]
    fn test_authorize_sync() {
        let gate = PermissionGate::new(PermissionStore::default(), ExecutionContext::main());
        let req = CapabilityRequest::env(CapabilityKind::EnvRead, "HOME");
        let err = gate.authorize_sync(&req).unwrap_err();
        assert!(matches!(
            err,
            VsysError::PermissionDenied { capability: CapabilityKind::EnvRead, ref scope } if scope == "HOME"
        ));

        gate.store()
            .grant(CapabilityKind::EnvRead, ScopePattern::name("HOME"))
            .unwrap();
        gate.authorize_sync(&req).unwrap();
        assert!(gate.is_granted(&req).unwrap());
    }
}
