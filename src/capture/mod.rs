//! Packet capture around iterations.
//!
//! The controller capture is a local `tcpdump` child process. Border router
//! captures run elsewhere and are driven through [`CaptureAgent`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::OtbrConfig;

/// Grace period for each escalation step when stopping a capture.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Survived SIGKILL within the grace period.
    StillAlive,
}

/// A background capture process, started and stopped around an iteration.
pub struct PacketCapture {
    program: String,
    args: Vec<String>,
    output: Option<PathBuf>,
    grace: Duration,
    child: Option<Child>,
}

impl PacketCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output: None,
            grace: STOP_GRACE,
            child: None,
        }
    }

    /// `tcpdump -i <interface> -w <output>`.
    pub fn tcpdump(interface: &str, output: &Path) -> Self {
        let mut capture = Self::new(
            "tcpdump",
            vec![
                "-i".into(),
                interface.into(),
                "-w".into(),
                output.display().to_string(),
            ],
        );
        capture.output = Some(output.to_path_buf());
        capture
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;
        info!(program = %self.program, pid = child.id(), "capture started");
        self.child = Some(child);
        Ok(())
    }

    /// Stop the capture: SIGTERM, wait, SIGKILL, wait.
    pub async fn stop(&mut self) -> StopOutcome {
        match self.child.take() {
            Some(mut child) => {
                let outcome = terminate_child(&mut child, self.grace).await;
                debug!(program = %self.program, ?outcome, "capture stopped");
                outcome
            }
            None => StopOutcome::NotRunning,
        }
    }
}

/// Escalating shutdown of a child process. Logs when the child survives.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> StopOutcome {
    if let Ok(Some(_)) = child.try_wait() {
        return StopOutcome::NotRunning;
    }

    // Try SIGTERM first (Unix only).
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
            return StopOutcome::Terminated;
        }
        Ok(Err(e)) => warn!(error = %e, "error waiting for child after SIGTERM"),
        Err(_) => warn!("child did not exit after SIGTERM, sending SIGKILL"),
    }

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to SIGKILL child");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => StopOutcome::Killed,
        _ => {
            warn!(pid = child.id(), "child still alive after SIGKILL");
            StopOutcome::StillAlive
        }
    }
}

// ---------------------------------------------------------------------------
// Border router capture
// ---------------------------------------------------------------------------

/// Packet capture on a remote border router.
#[async_trait::async_trait]
pub trait CaptureAgent: Send + Sync {
    async fn start_capture(&self) -> Result<()>;
    async fn stop_capture(&self) -> Result<()>;
    /// Fetch the capture into `destination`.
    async fn save_capture(&self, destination: &Path) -> Result<()>;
}

/// Border router capture driven by configured shell commands.
pub struct CommandCaptureAgent {
    config: OtbrConfig,
}

impl CommandCaptureAgent {
    pub fn new(config: OtbrConfig) -> Self {
        Self { config }
    }

    async fn run(&self, what: &str, command: Option<&String>) -> Result<()> {
        let Some(command) = command else {
            return Ok(());
        };
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .with_context(|| format!("failed to run border router {what} command"))?;
        anyhow::ensure!(status.success(), "border router {what} command exited with {status}");
        Ok(())
    }
}

#[async_trait::async_trait]
impl CaptureAgent for CommandCaptureAgent {
    async fn start_capture(&self) -> Result<()> {
        self.run("start", self.config.start_capture.as_ref()).await
    }

    async fn stop_capture(&self) -> Result<()> {
        self.run("stop", self.config.stop_capture.as_ref()).await
    }

    async fn save_capture(&self, destination: &Path) -> Result<()> {
        let command = self
            .config
            .save_capture
            .as_ref()
            .map(|c| c.replace("{path}", &destination.display().to_string()));
        self.run("save", command.as_ref()).await
    }
}
