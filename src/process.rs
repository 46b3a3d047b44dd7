use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::FORCE_UPDATE_EXIT_CODE;

const STDERR_TAIL_BYTES: usize = 500;

/// How a main-process run ended, decoded once at the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Normal,
    ForceUpdate,
    Crash(i32),
}

impl RunOutcome {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => RunOutcome::Normal,
            FORCE_UPDATE_EXIT_CODE => RunOutcome::ForceUpdate,
            other => RunOutcome::Crash(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            RunOutcome::Normal => 0,
            RunOutcome::ForceUpdate => FORCE_UPDATE_EXIT_CODE,
            RunOutcome::Crash(code) => code,
        }
    }
}

impl From<RunOutcome> for ExitCode {
    fn from(outcome: RunOutcome) -> Self {
        let code = u8::try_from(outcome.code()).unwrap_or(1);
        ExitCode::from(code)
    }
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub capture_stderr: bool,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, launch: &Launch) -> Result<Box<dyn ChildProcess>>;
}

#[async_trait]
pub trait ChildProcess: Send {
    /// Exit code if the process has already finished.
    fn try_exit_code(&mut self) -> Result<Option<i32>>;
    async fn wait(&mut self) -> Result<i32>;
    /// Forced termination; an unhealthy process is not trusted to stop on its own.
    async fn kill(&mut self) -> Result<()>;

    async fn stderr_tail(&mut self) -> Option<String> {
        None
    }
}

pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, launch: &Launch) -> Result<Box<dyn ChildProcess>> {
        let mut command = Command::new(&launch.program);
        command.args(&launch.args).current_dir(&launch.cwd).kill_on_drop(true);
        if launch.capture_stderr {
            command.stdout(Stdio::null()).stderr(Stdio::piped());
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {}", launch.program.display()))?;

        // Drained concurrently so a chatty child cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });
        Ok(Box::new(TokioChild { child, stderr }))
    }
}

struct TokioChild {
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    // Killed by a signal.
    status.code().unwrap_or(-1)
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(status_code))
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(status_code(self.child.wait().await?))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn stderr_tail(&mut self) -> Option<String> {
        let handle = self.stderr.take()?;
        let buf = tokio::time::timeout(Duration::from_secs(1), handle).await.ok()?.ok()?;
        let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        let text = String::from_utf8_lossy(&buf[start..]).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Runs a shell command in `cwd`, bounded by `timeout`.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning `{command}`"))?;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            child.kill().await?;
            anyhow::bail!("`{command}` timed out after {timeout:?}");
        }
    };
    if !status.success() {
        anyhow::bail!("`{command}` exited with {status}");
    }
    Ok(())
}
