//! Shaping backend seam
//!
//! The engine never talks to the kernel directly; it hands command strings
//! to a backend and inspects the exit status and raw text that come back.
//! Keeping this a trait lets the reconciliation tests drive the engine
//! against a scripted backend instead of a privileged system.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, ShaperError};

/// Fixed stderr substring the backend emits for an identity conflict.
const ALREADY_EXISTS_MARKER: &str = "File exists";

/// Captured result of one backend invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Soft conflict: the object we tried to create is already there.
    pub fn already_exists(&self) -> bool {
        self.stderr.contains(ALREADY_EXISTS_MARKER)
    }
}

#[async_trait]
pub trait ShapingBackend: Send + Sync {
    /// Execute one command string, returning its exit status and captured
    /// output. Implementations must not retry or reorder.
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// Real backend: whitespace-split argv handed to the system tools.
#[derive(Debug, Default)]
pub struct TcBackend;

#[async_trait]
impl ShapingBackend for TcBackend {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ShaperError::parameter(command, "empty command"))?;

        debug!("exec: {}", command);
        let output = Command::new(program).args(parts).output().await?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and require a clean exit.
pub(crate) async fn run_ok(backend: &dyn ShapingBackend, command: &str) -> Result<CommandOutput> {
    let output = backend.run(command).await?;
    if !output.success() {
        return Err(ShaperError::Backend {
            command: command.to_string(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Run a listing command, tolerating failure by returning empty text. The
/// parsers are tolerant of format drift; an unavailable listing tool is
/// treated the same way as an unrecognized format.
pub(crate) async fn run_listing(backend: &dyn ShapingBackend, command: &str) -> Result<String> {
    let output = backend.run(command).await?;
    if !output.success() {
        warn!(
            "listing command failed, treating as empty: {} ({})",
            command,
            output.stderr.trim()
        );
        return Ok(String::new());
    }
    Ok(output.stdout)
}

/// Check whether a kernel module is loaded. Absence is a warning, not an
/// error: some environments lack the module listing itself and still work.
pub async fn warn_if_module_missing(name: &str) {
    match tokio::fs::read_to_string("/proc/modules").await {
        Ok(text) => {
            let loaded = text
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name));
            if !loaded {
                warn!("kernel module {} not loaded, proceeding anyway", name);
            }
        }
        Err(error) => {
            debug!("module listing unavailable ({}), proceeding", error);
        }
    }
}
