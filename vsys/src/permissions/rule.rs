//! Permission rules, scope patterns and the matching algorithm.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::capability::{normalize_program, CapabilityKind, CapabilityRequest, Domain, Scope};
use crate::error::{VsysError, VsysResult};
use crate::path;

/// Outcome of checking a request against the rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Granted,
    Denied,
    PromptRequired,
}

/// What a rule (or a domain default) says about matching requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDecision {
    Allow,
    Deny,
    Prompt,
}

/// Posture applied when no rule matches
pub type DefaultPosture = RuleDecision;

impl RuleDecision {
    // Tie-breaker between rules of equal specificity
    fn precedence(self) -> u8 {
        match self {
            RuleDecision::Allow => 0,
            RuleDecision::Prompt => 1,
            RuleDecision::Deny => 2,
        }
    }
}

impl From<RuleDecision> for Decision {
    fn from(d: RuleDecision) -> Self {
        match d {
            RuleDecision::Allow => Decision::Granted,
            RuleDecision::Deny => Decision::Denied,
            RuleDecision::Prompt => Decision::PromptRequired,
        }
    }
}

/// Host side of a net pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostPattern {
    /// `example.com`
    Exact(String),
    /// `*.example.com`, stored without the `*.`; also matches `example.com`
    Wildcard(String),
}

impl HostPattern {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(h) => h == host,
            HostPattern::Wildcard(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
        }
    }

    fn labels(&self) -> u32 {
        let (HostPattern::Exact(h) | HostPattern::Wildcard(h)) = self;
        h.split('.').filter(|l| !l.is_empty()).count() as u32
    }
}

/// The resource pattern a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopePattern {
    /// Every resource of the kind
    Any,
    /// Component-wise path prefix, absolute and normalized
    PathPrefix(PathBuf),
    /// Exactly one path, none of its children
    Path(PathBuf),
    Host {
        pattern: HostPattern,
        port: Option<u16>,
    },
    /// Exact variable name, or a prefix when it ends with `*`
    Name(String),
    /// A bare program name, or an absolute program path. Each only
    /// matches a request spelled the same way.
    Command(String),
}

/// Ordering key: higher wins. `(tier, length, names a port)`
pub type Specificity = (u8, u32, u8);

impl ScopePattern {
    pub fn path(p: impl AsRef<Path>) -> Self {
        ScopePattern::PathPrefix(path::normalize_absolute(p.as_ref()))
    }

    pub fn host(pattern: &str) -> VsysResult<Self> {
        let (host, port) = split_host_port(pattern)?;
        let host = host.to_ascii_lowercase();
        let pattern = match host.strip_prefix("*.") {
            Some(suffix) => HostPattern::Wildcard(suffix.to_string()),
            None => HostPattern::Exact(host),
        };
        Ok(ScopePattern::Host { pattern, port })
    }

    pub fn name(name: impl Into<String>) -> Self {
        ScopePattern::Name(name.into())
    }

    /// Only this path, not its children
    pub fn exact_path(p: impl AsRef<Path>) -> Self {
        ScopePattern::Path(path::normalize_absolute(p.as_ref()))
    }

    pub fn command(program: impl AsRef<str>) -> Self {
        ScopePattern::Command(normalize_program(program.as_ref()))
    }

    /// Parse a configuration entry for `kind`. Relative fs entries are
    /// resolved against `base`; `*` alone means every resource and a trailing
    /// `*` on a path is accepted as a prefix marker.
    pub fn parse(kind: CapabilityKind, entry: &str, base: &Path) -> VsysResult<Self> {
        let entry = entry.trim();
        if entry == "*" {
            return Ok(ScopePattern::Any);
        }
        if entry.is_empty() {
            return Err(VsysError::InvalidArgument(format!(
                "empty {} pattern",
                kind
            )));
        }
        match kind.domain() {
            Domain::Fs => {
                let trimmed = entry.strip_suffix('*').unwrap_or(entry);
                Ok(ScopePattern::PathPrefix(path::normalize(
                    base,
                    Path::new(trimmed),
                )))
            }
            Domain::Net => Self::host(entry),
            Domain::Env => Ok(Self::name(entry)),
            Domain::Process => Ok(Self::command(entry)),
        }
    }

    /// The narrowest pattern covering exactly `scope`
    pub fn exact(scope: &Scope) -> Self {
        match scope {
            Scope::Path(p) => ScopePattern::Path(p.clone()),
            Scope::Host { host, port } => ScopePattern::Host {
                pattern: HostPattern::Exact(host.clone()),
                port: *port,
            },
            Scope::Name(n) => ScopePattern::Name(n.clone()),
            Scope::Command(c) => ScopePattern::Command(c.clone()),
        }
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        match (self, scope) {
            (ScopePattern::Any, _) => true,
            (ScopePattern::PathPrefix(prefix), Scope::Path(p)) => p.starts_with(prefix),
            (ScopePattern::Path(exact), Scope::Path(p)) => p == exact,
            (
                ScopePattern::Host { pattern, port },
                Scope::Host {
                    host,
                    port: requested,
                },
            ) => pattern.matches(host) && port.map_or(true, |p| Some(p) == *requested),
            (ScopePattern::Name(n), Scope::Name(name)) => match n.strip_suffix('*') {
                Some(prefix) => name.starts_with(prefix),
                None => n == name,
            },
            (ScopePattern::Command(c), Scope::Command(cmd)) => c == cmd,
            _ => false,
        }
    }

    pub fn specificity(&self) -> Specificity {
        match self {
            ScopePattern::Any => (0, 0, 0),
            ScopePattern::PathPrefix(p) => (1, path::depth(p), 0),
            ScopePattern::Path(p) => (2, path::depth(p), 0),
            ScopePattern::Host { pattern, port } => {
                let tier = match pattern {
                    HostPattern::Exact(_) => 2,
                    HostPattern::Wildcard(_) => 1,
                };
                (tier, pattern.labels(), port.is_some() as u8)
            }
            ScopePattern::Name(n) => match n.strip_suffix('*') {
                Some(prefix) => (1, prefix.len() as u32, 0),
                None => (2, n.len() as u32, 0),
            },
            ScopePattern::Command(_) => (2, 0, 0),
        }
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePattern::Any => f.write_str("*"),
            ScopePattern::PathPrefix(p) | ScopePattern::Path(p) => write!(f, "{}", p.display()),
            ScopePattern::Host { pattern, port } => {
                match pattern {
                    HostPattern::Exact(h) if h.contains(':') => write!(f, "[{}]", h)?,
                    HostPattern::Exact(h) => f.write_str(h)?,
                    HostPattern::Wildcard(s) => write!(f, "*.{}", s)?,
                }
                match port {
                    Some(port) => write!(f, ":{}", port),
                    None => Ok(()),
                }
            }
            ScopePattern::Name(n) => f.write_str(n),
            ScopePattern::Command(c) => f.write_str(c),
        }
    }
}

// "host", "host:port", "[v6]", "[v6]:port", bare v6
fn split_host_port(entry: &str) -> VsysResult<(&str, Option<u16>)> {
    let invalid = || VsysError::InvalidArgument(format!("invalid host pattern '{}'", entry));
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port.parse().map_err(|_| invalid())?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(invalid()),
        };
    }
    match entry.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((entry, None)),
        Some((host, port)) if !host.is_empty() => {
            Ok((host, Some(port.parse().map_err(|_| invalid())?)))
        }
        Some(_) => Err(invalid()),
        None => Ok((entry, None)),
    }
}

/// A single `(kind, pattern, decision)` entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRule {
    pub kind: CapabilityKind,
    pub pattern: ScopePattern,
    pub decision: RuleDecision,
}

impl PermissionRule {
    pub fn new(kind: CapabilityKind, pattern: ScopePattern, decision: RuleDecision) -> Self {
        Self {
            kind,
            pattern,
            decision,
        }
    }
}

/// Ordered rules plus the per-domain default posture.
///
/// Rules are keyed by `(kind, pattern)`; inserting an existing key replaces
/// its decision in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<PermissionRule>,
    defaults: [DefaultPosture; 4],
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            defaults: [RuleDecision::Deny; 4],
        }
    }
}

fn domain_index(domain: Domain) -> usize {
    match domain {
        Domain::Fs => 0,
        Domain::Net => 1,
        Domain::Env => 2,
        Domain::Process => 3,
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_for(&self, domain: Domain) -> DefaultPosture {
        self.defaults[domain_index(domain)]
    }

    pub fn set_default(&mut self, domain: Domain, posture: DefaultPosture) {
        self.defaults[domain_index(domain)] = posture;
    }

    /// Insert or replace. Returns `false` when the rule was already present
    /// with the same decision.
    pub fn insert(&mut self, rule: PermissionRule) -> bool {
        match self
            .rules
            .iter_mut()
            .find(|r| r.kind == rule.kind && r.pattern == rule.pattern)
        {
            Some(existing) if existing.decision == rule.decision => false,
            Some(existing) => {
                existing.decision = rule.decision;
                true
            }
            None => {
                self.rules.push(rule);
                true
            }
        }
    }

    pub fn remove(&mut self, kind: CapabilityKind, pattern: &ScopePattern) -> bool {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.kind == kind && &r.pattern == pattern));
        self.rules.len() != before
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionRule> {
        self.rules.iter()
    }

    /// The most specific matching rule governs; at equal specificity deny
    /// beats prompt beats allow. Falls back to the domain default.
    pub fn decide(&self, request: &CapabilityRequest) -> Decision {
        let mut best: Option<((Specificity, u8), RuleDecision)> = None;
        for rule in self
            .rules
            .iter()
            .filter(|r| r.kind == request.kind && r.pattern.matches(&request.scope))
        {
            let key = (rule.pattern.specificity(), rule.decision.precedence());
            if best.as_ref().map_or(true, |(k, _)| key > *k) {
                best = Some((key, rule.decision));
            }
        }
        match best {
            Some((_, decision)) => decision.into(),
            None => self.default_for(request.domain()).into(),
        }
    }
}
