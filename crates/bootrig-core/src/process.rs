//! Hypervisor process launching and termination.
//!
//! The launcher spawns the hypervisor with piped stdin/stdout/stderr so the
//! guest's serial console can be consumed as a line stream and input can be
//! injected from test code. Termination is graceful (SIGTERM, short grace
//! period, then SIGKILL) and safe to invoke repeatedly.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Writable handle to the guest console's input stream.
///
/// Writes are forwarded over a channel to a dedicated writer task, so trigger
/// callbacks can inject input without blocking on pipe I/O.
#[derive(Clone, Debug)]
pub struct ConsoleWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl ConsoleWriter {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue one line (a trailing newline is appended) for the guest's input.
    pub fn write_line(&self, line: &str) -> Result<()> {
        self.tx.send(line.to_owned()).map_err(|_| {
            HarnessError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "console input channel closed",
            ))
        })
    }
}

/// Clonable handle that can force-kill the process outside the boot cycle.
///
/// Used by `clean()` for best-effort teardown of a cycle that was abandoned
/// mid-flight. Kills are skipped once the process has been reaped.
#[derive(Clone, Debug)]
pub struct TerminateHandle {
    pid: Option<u32>,
    reaped: Arc<AtomicBool>,
}

impl TerminateHandle {
    /// Force-kill the process if it has not been reaped yet. Idempotent.
    pub fn kill(&self) {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

/// A running hypervisor/emulator process.
#[derive(Debug)]
pub struct HypervisorProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    writer: ConsoleWriter,
    reaped: Arc<AtomicBool>,
}

impl HypervisorProcess {
    /// Spawn the hypervisor with its console piped.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Launch`] when the executable cannot be found
    /// or the OS refuses to spawn it.
    pub fn launch(program: &Path, args: &[String]) -> Result<Self> {
        let resolved = which::which(program).map_err(|_| {
            HarnessError::Launch(format!(
                "hypervisor executable not found: {}",
                program.display()
            ))
        })?;

        debug!(program = %resolved.display(), ?args, "spawning hypervisor");

        let mut child = Command::new(&resolved)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Last-resort orphan guard: if the boot future is dropped
            // (panic, ctrl-c), the runtime reaps the child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::Launch(format!("failed to spawn {}: {e}", resolved.display()))
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let Some(mut stdin) = stdin else { return };
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            writer: ConsoleWriter { tx },
            reaped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The OS process id, if the process has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Take the console output stream. Single consumption; restartable only
    /// by re-launching.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the process's stderr stream (emulator diagnostics).
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// A writable handle to the guest's input stream.
    pub fn console_writer(&self) -> ConsoleWriter {
        self.writer.clone()
    }

    /// A detached handle that can force-kill this process.
    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle {
            pid: self.pid,
            reaped: Arc::clone(&self.reaped),
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await;
        if status.is_ok() {
            self.reaped.store(true, Ordering::SeqCst);
        }
        status
    }

    /// The exit status, if the process has already exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Terminate the process: SIGTERM, a short grace period, then SIGKILL.
    /// Safe to call multiple times and after the process has exited.
    pub async fn terminate(&mut self) {
        if self.reaped.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(Some(_)) = self.child.try_wait() {
            self.reaped.store(true, Ordering::SeqCst);
            return;
        }

        if let Some(pid) = self.pid {
            debug!(pid, "sending SIGTERM to hypervisor");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(pid = ?self.pid, "hypervisor ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
        self.reaped.store(true, Ordering::SeqCst);
    }
}
