//! Capability kinds and concrete capability requests.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resource domain a capability belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Fs,
    Net,
    Env,
    Process,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Fs, Domain::Net, Domain::Env, Domain::Process];
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Fs => "fs",
            Domain::Net => "net",
            Domain::Env => "env",
            Domain::Process => "process",
        })
    }
}

/// Operation class a rule or request refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityKind {
    FsRead,
    FsWrite,
    NetConnect,
    EnvRead,
    EnvWrite,
    ProcessSpawn,
}

impl CapabilityKind {
    pub fn domain(self) -> Domain {
        match self {
            CapabilityKind::FsRead | CapabilityKind::FsWrite => Domain::Fs,
            CapabilityKind::NetConnect => Domain::Net,
            CapabilityKind::EnvRead | CapabilityKind::EnvWrite => Domain::Env,
            CapabilityKind::ProcessSpawn => Domain::Process,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The concrete resource a request targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Absolute, lexically normalized path
    Path(PathBuf),
    /// Lower-cased host name or IP literal, with the target port if known
    Host { host: String, port: Option<u16> },
    /// Environment variable name
    Name(String),
    /// Program passed to spawn
    Command(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Path(path) => write!(f, "{}", path.display()),
            Scope::Host { host, port: Some(port) } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            Scope::Host { host, port: Some(port) } => write!(f, "{}:{}", host, port),
            Scope::Host { host, port: None } => f.write_str(host),
            Scope::Name(name) => f.write_str(name),
            Scope::Command(cmd) => f.write_str(cmd),
        }
    }
}

/// A capability instance: "may I do `kind` to `scope`?"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityRequest {
    pub kind: CapabilityKind,
    pub scope: Scope,
}

impl CapabilityRequest {
    pub fn new(kind: CapabilityKind, scope: Scope) -> Self {
        Self { kind, scope }
    }

    /// Path request; `path` is normalized but not made absolute here.
    pub fn path(kind: CapabilityKind, path: &Path) -> Self {
        Self::new(kind, Scope::Path(crate::path::normalize_absolute(path)))
    }

    pub fn net(host: &str, port: Option<u16>) -> Self {
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        Self::new(CapabilityKind::NetConnect, Scope::Host { host, port })
    }

    pub fn env(kind: CapabilityKind, name: &str) -> Self {
        Self::new(kind, Scope::Name(name.to_string()))
    }

    pub fn spawn(program: &str) -> Self {
        Self::new(
            CapabilityKind::ProcessSpawn,
            Scope::Command(normalize_program(program)),
        )
    }

    pub fn domain(&self) -> Domain {
        self.kind.domain()
    }
}

/// Absolute program paths are normalized; bare names and relative paths
/// are kept as written.
pub(crate) fn normalize_program(program: &str) -> String {
    if program.starts_with('/') {
        crate::path::normalize_absolute(Path::new(program))
            .to_string_lossy()
            .into_owned()
    } else {
        program.to_string()
    }
}

impl fmt::Display for CapabilityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.kind, self.scope)
    }
}
