//! Subprocess virtual table for vsys

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{VsysError, VsysResult};
use crate::gate::PermissionGate;
use crate::permissions::{CapabilityKind, CapabilityRequest, Domain};

/// What to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added to the inherited environment
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

/// Result of a process run to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn spawn(&self, command: &CommandSpec) -> VsysResult<ProcessOutput>;
}

/// Host processes through `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct RealProcess;

#[async_trait]
impl ProcessBackend for RealProcess {
    async fn spawn(&self, command: &CommandSpec) -> VsysResult<ProcessOutput> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| VsysError::io(Domain::Process, e))?;
        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Scripted processes for tests.
///
/// Programs without a scripted output exit with status 0 and no output.
/// Every spawn that reaches the backend is recorded.
#[derive(Debug, Default)]
pub struct MockProcess {
    outputs: Mutex<HashMap<String, ProcessOutput>>,
    invocations: Mutex<Vec<CommandSpec>>,
}

impl MockProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, program: impl Into<String>, output: ProcessOutput) -> Self {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(program.into(), output);
        self
    }

    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProcessBackend for MockProcess {
    async fn spawn(&self, command: &CommandSpec) -> VsysResult<ProcessOutput> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());
        let outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(outputs.get(&command.program).cloned().unwrap_or(ProcessOutput {
            status: Some(0),
            ..Default::default()
        }))
    }
}

/// Backend that refuses every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedProcess;

#[async_trait]
impl ProcessBackend for DeniedProcess {
    async fn spawn(&self, command: &CommandSpec) -> VsysResult<ProcessOutput> {
        Err(VsysError::denied(
            CapabilityKind::ProcessSpawn,
            command.program.as_str(),
        ))
    }
}

#[derive(Clone)]
pub struct ProcessVTable {
    backend: Arc<dyn ProcessBackend>,
    gate: PermissionGate,
}

impl std::fmt::Debug for ProcessVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessVTable")
            .field("context", self.gate.context())
            .finish_non_exhaustive()
    }
}

impl ProcessVTable {
    pub fn new(backend: Arc<dyn ProcessBackend>, gate: PermissionGate) -> Self {
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

    pub fn same_backend(&self, other: &ProcessVTable) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    /// Run `command` to completion
    pub async fn spawn(&self, command: &CommandSpec) -> VsysResult<ProcessOutput> {
        if command.program.is_empty() {
            return Err(VsysError::InvalidArgument("empty program name".into()));
        }
        self.gate
            .authorize(&CapabilityRequest::spawn(&command.program))
            .await?;
        tracing::debug!(program = %command.program, args = ?command.args, "spawning process");
        self.backend.spawn(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ExecutionContext;
    use crate::permissions::{PermissionStore, ScopePattern};

    fn vtable(backend: Arc<dyn ProcessBackend>) -> ProcessVTable {
        ProcessVTable::new(
            backend,
            PermissionGate::new(PermissionStore::default(), ExecutionContext::main()),
        )
    }

    #[tokio::test]
    async fn test_denied_spawn_never_runs() {
        let mock = Arc::new(MockProcess::new());
        let process = vtable(mock.clone());
        let err = process
            .spawn(&CommandSpec::new("rm").args(["-rf", "/"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VsysError::PermissionDenied { capability: CapabilityKind::ProcessSpawn, ref scope }
                if scope == "rm"
        ));
        assert!(mock.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_output() {
        let mock = Arc::new(MockProcess::new().with_output(
            "/usr/bin/git",
            ProcessOutput {
                status: Some(0),
                stdout: b"main\n".to_vec(),
                stderr: Vec::new(),
            },
        ));
        let process = vtable(mock.clone());
        process
            .gate()
            .store()
            .grant(CapabilityKind::ProcessSpawn, ScopePattern::command("/usr/bin/git"))
            .unwrap();

        let command = CommandSpec::new("/usr/bin/git").arg("branch").cwd("/repo");
        let output = process.spawn(&command).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"main\n");
        assert_eq!(mock.invocations(), vec![command]);
    }

    #[tokio::test]
    async fn test_bare_name_grant_does_not_cover_other_paths() {
        let mock = Arc::new(MockProcess::new());
        let process = vtable(mock.clone());
        process
            .gate()
            .store()
            .grant(CapabilityKind::ProcessSpawn, ScopePattern::command("git"))
            .unwrap();

        for program in ["/tmp/attacker/git", "./git", "/usr/bin/git"] {
            let err = process.spawn(&CommandSpec::new(program)).await.unwrap_err();
            assert!(matches!(
                err,
                VsysError::PermissionDenied { capability: CapabilityKind::ProcessSpawn, ref scope }
                    if scope == program
            ));
        }
        assert!(mock.invocations().is_empty());

        process.spawn(&CommandSpec::new("git")).await.unwrap();
        assert_eq!(mock.invocations().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process() {
        let process = vtable(Arc::new(RealProcess));
        process
            .gate()
            .store()
            .grant(CapabilityKind::ProcessSpawn, ScopePattern::command("sh"))
            .unwrap();
        let output = process
            .spawn(&CommandSpec::new("sh").args(["-c", "echo $GREETING; exit 3"]).env("GREETING", "hi"))
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, b"hi\n");
    }
}
