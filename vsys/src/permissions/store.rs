//! The shared permission store
//!
//! One [`PermissionStore`] exists per runtime. Every clone is a handle to
//! the same rule set, so a grant made from a worker context is visible to
//! the main context and to every other worker.
//!
//! Readers take a snapshot (`Arc<RuleSet>`) under a short read lock and
//! evaluate without holding it. Writers copy-on-write under the write lock,
//! so a check never observes a half-applied mutation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::capability::{CapabilityKind, CapabilityRequest, Domain};
use super::policy::Permissions;
use super::prompt::{PromptAnswer, PromptHandler};
use super::rule::{Decision, DefaultPosture, PermissionRule, RuleDecision, RuleSet, ScopePattern};
use crate::error::{VsysError, VsysResult};

struct StoreInner {
    rules: RwLock<Arc<RuleSet>>,
    prompt: Option<Arc<dyn PromptHandler>>,
    prompt_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStore")
            .field("rules", &self.snapshot().map(|r| r.len()))
            .field("interactive", &self.inner.prompt.is_some())
            .field("prompt_timeout", &self.inner.prompt_timeout)
            .finish()
    }
}

impl Default for PermissionStore {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

impl PermissionStore {
    pub fn new(rules: RuleSet) -> Self {
        Self::with_prompt(rules, None, None)
    }

    pub fn with_prompt(
        rules: RuleSet,
        prompt: Option<Arc<dyn PromptHandler>>,
        prompt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                rules: RwLock::new(Arc::new(rules)),
                prompt,
                prompt_timeout,
            }),
        }
    }

    /// Compile the host policy; relative fs entries resolve against `base`.
    pub fn from_permissions(
        permissions: &Permissions,
        base: &std::path::Path,
    ) -> VsysResult<Self> {
        Ok(Self::new(permissions.to_rule_set(base)?))
    }

    /// Whether two handles refer to the same store
    pub fn same_store(&self, other: &PermissionStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_interactive(&self) -> bool {
        self.inner.prompt.is_some()
    }

    /// Current rule set. The snapshot does not change when the store does.
    pub fn snapshot(&self) -> VsysResult<Arc<RuleSet>> {
        self.inner
            .rules
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| corrupted())
    }

    pub fn rules(&self) -> VsysResult<Vec<PermissionRule>> {
        Ok(self.snapshot()?.iter().cloned().collect())
    }

    pub fn check(&self, request: &CapabilityRequest) -> VsysResult<Decision> {
        let decision = self.snapshot()?.decide(request);
        tracing::trace!(%request, ?decision, "permission check");
        Ok(decision)
    }

    pub fn grant(&self, kind: CapabilityKind, pattern: ScopePattern) -> VsysResult<()> {
        self.insert(PermissionRule::new(kind, pattern, RuleDecision::Allow))
    }

    pub fn deny(&self, kind: CapabilityKind, pattern: ScopePattern) -> VsysResult<()> {
        self.insert(PermissionRule::new(kind, pattern, RuleDecision::Deny))
    }

    /// Ask the host whenever `pattern` governs a request
    pub fn set_prompt(&self, kind: CapabilityKind, pattern: ScopePattern) -> VsysResult<()> {
        self.insert(PermissionRule::new(kind, pattern, RuleDecision::Prompt))
    }

    pub fn insert(&self, rule: PermissionRule) -> VsysResult<()> {
        self.mutate(|rules| {
            if rules.insert(rule.clone()) {
                tracing::debug!(kind = %rule.kind, pattern = %rule.pattern, decision = ?rule.decision, "permission rule set");
            }
        })
    }

    /// Remove a rule; returns whether one existed
    pub fn revoke(&self, kind: CapabilityKind, pattern: &ScopePattern) -> VsysResult<bool> {
        let mut removed = false;
        self.mutate(|rules| {
            removed = rules.remove(kind, pattern);
        })?;
        if removed {
            tracing::debug!(%kind, %pattern, "permission rule revoked");
        }
        Ok(removed)
    }

    pub fn set_default(&self, domain: Domain, posture: DefaultPosture) -> VsysResult<()> {
        self.mutate(|rules| rules.set_default(domain, posture))?;
        tracing::debug!(%domain, ?posture, "default posture changed");
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut RuleSet)) -> VsysResult<()> {
        let mut guard = self.inner.rules.write().map_err(|_| corrupted())?;
        f(Arc::make_mut(&mut guard));
        Ok(())
    }

    /// Check, asking the host when the rules say so.
    ///
    /// The host's answer is recorded as a rule before returning, so the same
    /// request does not prompt twice. Cancelling `cancel` (the asking
    /// context was torn down) or hitting the configured prompt timeout
    /// resolves to [`Decision::Denied`] without recording anything.
    #[tracing::instrument(level = "debug", skip(self, request, cancel), fields(request = %request))]
    pub async fn request_interactive(
        &self,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
    ) -> VsysResult<Decision> {
        let decision = self.check(request)?;
        if decision != Decision::PromptRequired {
            return Ok(decision);
        }
        let Some(handler) = self.inner.prompt.as_ref() else {
            tracing::debug!("no prompt handler configured, denying");
            return Ok(Decision::Denied);
        };

        let asked = handler.prompt(request);
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("prompt cancelled, context terminated");
                None
            }
            answer = async {
                match self.inner.prompt_timeout {
                    Some(limit) => tokio::time::timeout(limit, asked).await.ok(),
                    None => Some(asked.await),
                }
            } => {
                if answer.is_none() {
                    tracing::warn!("prompt timed out");
                }
                answer
            }
        };

        let Some(answer) = answer else {
            return Ok(Decision::Denied);
        };
        let (pattern, decision) = match answer {
            PromptAnswer::Grant => (ScopePattern::exact(&request.scope), RuleDecision::Allow),
            PromptAnswer::GrantAll => (ScopePattern::Any, RuleDecision::Allow),
            PromptAnswer::Deny => (ScopePattern::exact(&request.scope), RuleDecision::Deny),
        };
        self.insert(PermissionRule::new(request.kind, pattern, decision))?;

        // Re-evaluate: a more specific rule may still govern this request
        let decision = match self.check(request)? {
            Decision::PromptRequired => decision.into(),
            settled => settled,
        };
        Ok(decision)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let store = self.clone();
        let _ = std::thread::spawn(move || {
            let _guard = store.inner.rules.write();
            panic!("poisoning permission store");
        })
        .join();
    }
}

fn corrupted() -> VsysError {
    tracing::error!("permission store lock poisoned");
    VsysError::StoreCorruption("rule set lock poisoned".into())
}
