//! Child process supervision
//!
//! Spawns deployment commands through a shell and owns the resulting OS
//! process: line-by-line output capture, a single exit notification, and
//! idempotent termination.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::AgentError;

/// Which pipe a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child process output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Terminal notification for a supervised process
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    /// Exit code; None when the process was terminated by a signal
    pub code: Option<i32>,

    /// Whether the exit was requested through `kill`
    pub killed: bool,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code),
            None => write!(f, "signal"),
        }
    }
}

/// Ownership token for a running OS process.
///
/// Cloneable so the registry can keep one while the follow task streams the
/// output. Killing an already-exited process is a no-op.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Idempotent; harmless after exit.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

/// A freshly spawned process: the handle plus its one-shot consumables.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,

    /// Stdout and stderr lines in arrival order; closes when both pipes
    /// reach EOF
    pub output: mpsc::UnboundedReceiver<OutputLine>,

    /// Exactly one terminal notification, whichever of kill or natural
    /// exit happened first
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Spawns and supervises deployment child processes
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    shell: PathBuf,
}

impl ProcessSupervisor {
    /// Create a supervisor using the system shell
    pub fn new() -> Self {
        // Detect available shell
        let shell = if Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        };

        Self {
            shell: PathBuf::from(shell),
        }
    }

    /// Start `command` via the shell with `workdir` as cwd and `env`
    /// applied over the agent's own environment. Returns as soon as the
    /// process exists; output and exit are consumed asynchronously.
    pub fn spawn(
        &self,
        command: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, AgentError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::SpawnError(format!("failed to start `{}`: {}", command, e))
            })?;

        let pid = child.id();
        debug!("Spawned `{}` (pid {:?}) in {}", command, pid, workdir.display());

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, out_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, out_tx.clone());
        }
        drop(out_tx);

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        let token = kill.clone();
        tokio::spawn(async move {
            // Resolve the kill-vs-natural-exit race: whichever happens
            // first decides the notification, the loser is discarded.
            let waited = tokio::select! {
                res = child.wait() => Some(res),
                _ = token.cancelled() => None,
            };

            let exit = match waited {
                Some(Ok(status)) => ProcessExit {
                    code: status.code(),
                    killed: false,
                },
                Some(Err(e)) => {
                    warn!("Failed to await child process: {}", e);
                    ProcessExit {
                        code: None,
                        killed: false,
                    }
                }
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill on exited process ignored: {}", e);
                    }
                    match child.wait().await {
                        Ok(status) => ProcessExit {
                            code: status.code(),
                            killed: true,
                        },
                        Err(e) => {
                            warn!("Failed to await killed child: {}", e);
                            ProcessExit {
                                code: None,
                                killed: true,
                            }
                        }
                    }
                }
            };

            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedProcess {
            handle: ProcessHandle { pid, kill },
            output: out_rx,
            exit: exit_rx,
        })
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward every line from one pipe into the shared output channel.
fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading child output: {}", e);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_output(mut spawned: SpawnedProcess) -> (Vec<OutputLine>, ProcessExit) {
        let mut lines = Vec::new();
        while let Some(line) = spawned.output.recv().await {
            lines.push(line);
        }
        let exit = spawned.exit.await.unwrap();
        (lines, exit)
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_exit() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor
            .spawn("echo hello", Path::new("/tmp"), &HashMap::new())
            .unwrap();

        let (lines, exit) = collect_output(spawned).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "hello");
        assert_eq!(lines[0].stream, OutputStream::Stdout);
        assert_eq!(exit.code, Some(0));
        assert!(!exit.killed);
    }

    #[tokio::test]
    async fn test_spawn_captures_stderr() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor
            .spawn("echo oops >&2", Path::new("/tmp"), &HashMap::new())
            .unwrap();

        let (lines, _) = collect_output(spawned).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "oops");
        assert_eq!(lines[0].stream, OutputStream::Stderr);
    }

    #[tokio::test]
    async fn test_spawn_applies_env_overrides() {
        let supervisor = ProcessSupervisor::new();
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "12345".to_string());
        let spawned = supervisor
            .spawn("echo $PORT", Path::new("/tmp"), &env)
            .unwrap();

        let (lines, _) = collect_output(spawned).await;
        assert_eq!(lines[0].text, "12345");
    }

    #[tokio::test]
    async fn test_spawn_reports_nonzero_exit_code() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor
            .spawn("exit 3", Path::new("/tmp"), &HashMap::new())
            .unwrap();

        let (_, exit) = collect_output(spawned).await;
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor
            .spawn("sleep 30", Path::new("/tmp"), &HashMap::new())
            .unwrap();

        let handle = spawned.handle.clone();
        handle.kill();
        handle.kill();

        let (_, exit) = collect_output(spawned).await;
        assert!(exit.killed);

        // Killing after exit is still a no-op
        handle.kill();
    }
}
