//! Invocation of external disk tools.
//!
//! Every tool runs as a child process with stdout and stderr captured line by
//! line (both `\n` and `\r` end a line, since progress meters redraw with
//! carriage returns). Lines are handed to a callback as they arrive and the
//! tail of the output is kept for error reports. Cancellation sends SIGTERM,
//! which `sudo` forwards to the tool, and escalates to SIGKILL after a grace
//! period.

pub mod dd;
pub mod parted;
pub mod ventoy;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, Uid};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ElevationMode, PrivilegeConfig};
use crate::core::error::OperationError;

/// Lines of tool output kept for diagnostics
const TRANSCRIPT_LINES: usize = 200;

/// Time a tool gets to exit after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A fully described tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub stdin: Option<Vec<u8>>,
    pub current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Bytes written to the tool's stdin, which is then closed.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Tail of the combined stdout/stderr.
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String, output: String },
}

/// Runs tools with the configured privilege escalation.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    mode: ElevationMode,
    escalate_with: Vec<String>,
    is_root: bool,
}

impl ToolRunner {
    pub fn new(privileges: &PrivilegeConfig) -> Self {
        Self {
            mode: privileges.mode,
            escalate_with: privileges.escalate_with.clone(),
            is_root: Uid::effective().is_root(),
        }
    }

    /// Fail fast when a privileged tool could not possibly succeed.
    pub fn ensure_privileges(&self) -> Result<(), OperationError> {
        match self.mode {
            ElevationMode::Never => Ok(()),
            ElevationMode::Auto if self.is_root || !self.escalate_with.is_empty() => Ok(()),
            ElevationMode::Auto => Err(OperationError::permission(
                "not running as root and no privilege escalation command is configured",
            )),
        }
    }

    /// Whether privileged tools go through the escalation command.
    pub fn escalates(&self) -> bool {
        self.escalation_prefix().is_some()
    }

    fn escalation_prefix(&self) -> Option<(&str, &[String])> {
        match self.mode {
            ElevationMode::Auto if !self.is_root => self
                .escalate_with
                .split_first()
                .map(|(program, rest)| (program.as_str(), rest)),
            _ => None,
        }
    }

    fn build(&self, tool: &ToolCommand) -> Command {
        let mut cmd = match self.escalation_prefix() {
            Some((program, prefix_args)) => {
                let mut cmd = Command::new(program);
                cmd.args(prefix_args).arg(&tool.program);
                cmd
            }
            None => Command::new(&tool.program),
        };
        cmd.args(&tool.args)
            .stdin(if tool.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &tool.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run a tool that needs device access, escalating if configured.
    pub async fn run_privileged<F>(
        &self,
        tool: &ToolCommand,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<ToolOutput, RunError>
    where
        F: FnMut(&str),
    {
        let program = tool.program_name();
        debug!(command = %tool, escalated = self.escalates(), "Running tool");

        let mut child = self.build(tool).spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RunError::NotFound {
                    program: program.clone(),
                }
            } else {
                RunError::Spawn {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (tool.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut transcript = Transcript::default();

        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        on_line(&line);
                        transcript.push(line);
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    terminate(&mut child, &program).await;
                    return Err(RunError::Cancelled { program, output: transcript.finish() });
                }
            }
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(|e| RunError::Spawn {
                program: program.clone(),
                source: e,
            })?,
            None => {
                terminate(&mut child, &program).await;
                return Err(RunError::Cancelled {
                    program,
                    output: transcript.finish(),
                });
            }
        };

        debug!(program = %program, status = %status, "Tool exited");

        Ok(ToolOutput {
            status,
            output: transcript.finish(),
        })
    }
}

async fn terminate(child: &mut Child, program: &str) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(program = %program, error = %e, "SIGTERM failed");
        }
    }

    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        warn!(program = %program, "Tool ignored SIGTERM, killing it");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Split a stream on `\r` and `\n`, forwarding non-empty lines.
async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line_buffer = Vec::new();
    let mut byte_buffer = [0u8; 1];

    while let Ok(n) = reader.read(&mut byte_buffer).await {
        if n == 0 {
            break;
        }

        let b = byte_buffer[0];

        if b == b'\r' || b == b'\n' {
            if !line_buffer.is_empty() {
                let line = String::from_utf8_lossy(&line_buffer).trim_end().to_string();
                line_buffer.clear();
                if tx.send(line).is_err() {
                    return;
                }
            }
        } else {
            line_buffer.push(b);
        }
    }

    if !line_buffer.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line_buffer).trim_end().to_string());
    }
}

/// Bounded tail of a tool's output.
#[derive(Default)]
struct Transcript {
    lines: VecDeque<String>,
}

impl Transcript {
    fn push(&mut self, line: String) {
        if self.lines.len() == TRANSCRIPT_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn finish(&mut self) -> String {
        std::mem::take(&mut self.lines)
            .into_iter()
            .collect::<Vec<_>>()
            .join("\n")
    }
}
