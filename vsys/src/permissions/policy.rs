//! Initial permission policy supplied by the host
//!
//! A [`Permissions`] value is the configuration-side description of what a
//! runtime may do. It is compiled into a [`RuleSet`] once, when the
//! [`PermissionStore`](super::PermissionStore) is created.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::capability::{CapabilityKind, Domain};
use super::rule::{DefaultPosture, PermissionRule, RuleDecision, RuleSet, ScopePattern};
use crate::error::{VsysError, VsysResult};

/// Black or white list for one capability
#[derive(Debug, PartialEq, Clone, Hash, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "items")]
pub enum BlackOrWhiteList {
    /// Allow all except items in the list
    #[serde(rename = "blacklist")]
    BlackList(Vec<String>),
    /// Deny all except items in the list (default: empty = deny all)
    #[serde(rename = "whitelist")]
    WhiteList(Vec<String>),
}

impl Default for BlackOrWhiteList {
    fn default() -> Self {
        // Default to deny all (empty whitelist)
        Self::WhiteList(vec![])
    }
}

impl BlackOrWhiteList {
    /// Create a blacklist (allow all except listed)
    pub fn blacklist<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
        Self::BlackList(items.into_iter().map(Into::into).collect())
    }

    /// Create a whitelist (deny all except listed)
    pub fn whitelist<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
        Self::WhiteList(items.into_iter().map(Into::into).collect())
    }

    /// Allow all (empty blacklist)
    pub fn allow_all() -> Self {
        Self::BlackList(vec![])
    }

    /// Deny all (empty whitelist)
    pub fn deny_all() -> Self {
        Self::WhiteList(vec![])
    }

    fn items(&self) -> &[String] {
        match self {
            BlackOrWhiteList::BlackList(items) | BlackOrWhiteList::WhiteList(items) => items,
        }
    }
}

/// An explicit ordered rule in configuration form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub kind: CapabilityKind,
    pub scope: String,
    pub decision: RuleDecision,
}

/// Struct representing permissions for filesystem, network, environment and
/// process access.
///
/// **WARNING**: by default, no permissions are granted (all whitelists are
/// empty), including network access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    /// Filesystem read access
    pub fs_read: BlackOrWhiteList,
    /// Filesystem write access
    pub fs_write: BlackOrWhiteList,
    /// Network access permissions
    pub net: BlackOrWhiteList,
    /// Environment variable read access
    pub env: BlackOrWhiteList,
    /// Environment variable write access
    pub env_write: BlackOrWhiteList,
    /// Process spawning
    pub process: BlackOrWhiteList,
    /// Ask the host instead of denying when a whitelist does not match
    pub prompt: bool,
    /// Explicit rules, applied after the lists
    pub rules: Vec<RuleConfig>,
}

impl Permissions {
    /// Create permissions that allow everything
    pub fn allow_all() -> Self {
        Self {
            fs_read: BlackOrWhiteList::allow_all(),
            fs_write: BlackOrWhiteList::allow_all(),
            net: BlackOrWhiteList::allow_all(),
            env: BlackOrWhiteList::allow_all(),
            env_write: BlackOrWhiteList::allow_all(),
            process: BlackOrWhiteList::allow_all(),
            prompt: false,
            rules: vec![],
        }
    }

    /// Create permissions that deny everything (default)
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Deny everything that is not listed, but ask the host first
    pub fn prompt_all() -> Self {
        Self {
            prompt: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> VsysResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| VsysError::InvalidArgument(format!("invalid permissions JSON: {}", e)))
    }

    pub fn from_toml_str(s: &str) -> VsysResult<Self> {
        toml::from_str(s)
            .map_err(|e| VsysError::InvalidArgument(format!("invalid permissions TOML: {}", e)))
    }

    fn list(&self, kind: CapabilityKind) -> &BlackOrWhiteList {
        match kind {
            CapabilityKind::FsRead => &self.fs_read,
            CapabilityKind::FsWrite => &self.fs_write,
            CapabilityKind::NetConnect => &self.net,
            CapabilityKind::EnvRead => &self.env,
            CapabilityKind::EnvWrite => &self.env_write,
            CapabilityKind::ProcessSpawn => &self.process,
        }
    }

    /// Compile into a rule set. Relative fs entries resolve against `base`.
    ///
    /// Blacklists become deny rules over an allowing posture and whitelists
    /// become allow rules over a denying (or prompting) posture. Kinds of one
    /// domain that disagree on the list mode keep their own posture through a
    /// catch-all rule.
    pub fn to_rule_set(&self, base: &Path) -> VsysResult<RuleSet> {
        let miss = if self.prompt {
            RuleDecision::Prompt
        } else {
            RuleDecision::Deny
        };
        let mut rules = RuleSet::new();

        for domain in Domain::ALL {
            let kinds = kinds_of(domain);
            let posture = |kind: CapabilityKind| -> DefaultPosture {
                match self.list(kind) {
                    BlackOrWhiteList::BlackList(_) => RuleDecision::Allow,
                    BlackOrWhiteList::WhiteList(_) => miss,
                }
            };
            let domain_default = posture(kinds[0]);
            rules.set_default(domain, domain_default);

            for &kind in kinds {
                let kind_default = posture(kind);
                if kind_default != domain_default {
                    rules.insert(PermissionRule::new(kind, ScopePattern::Any, kind_default));
                }
                let decision = match self.list(kind) {
                    BlackOrWhiteList::BlackList(_) => RuleDecision::Deny,
                    BlackOrWhiteList::WhiteList(_) => RuleDecision::Allow,
                };
                for item in self.list(kind).items() {
                    let pattern = ScopePattern::parse(kind, item, base)?;
                    rules.insert(PermissionRule::new(kind, pattern, decision));
                }
            }
        }

        for rule in &self.rules {
            let pattern = ScopePattern::parse(rule.kind, &rule.scope, base)?;
            rules.insert(PermissionRule::new(rule.kind, pattern, rule.decision));
        }

        Ok(rules)
    }
}

fn kinds_of(domain: Domain) -> &'static [CapabilityKind] {
    match domain {
        Domain::Fs => &[CapabilityKind::FsRead, CapabilityKind::FsWrite],
        Domain::Net => &[CapabilityKind::NetConnect],
        Domain::Env => &[CapabilityKind::EnvRead, CapabilityKind::EnvWrite],
        Domain::Process => &[CapabilityKind::ProcessSpawn],
    }
}
