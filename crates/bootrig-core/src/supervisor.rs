//! Boot-cycle supervision: the race between process exit, trigger verdicts,
//! and the timeout.
//!
//! The first condition to occur wins and cancels the other two: termination
//! closes the console stream (stopping the readers), and returning from the
//! race abandons the countdown. Exactly one [`BootResult`] is produced per
//! cycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};
use crate::monitor::{self, TriggerSet, TriggerVerdict};
use crate::process::HypervisorProcess;

/// Terminal outcome of one boot cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BootOutcome {
    /// The process exited cleanly or a trigger signalled success.
    Success,
    /// Non-zero exit, failure verdict, or a failing trigger callback.
    Failure(String),
    /// No terminal condition within the bound; the process was killed.
    Timeout { secs: u64 },
}

impl std::fmt::Display for BootOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootOutcome::Success => write!(f, "success"),
            BootOutcome::Failure(reason) => write!(f, "failure: {reason}"),
            BootOutcome::Timeout { secs } => write!(f, "timeout after {secs}s"),
        }
    }
}

/// Immutable record of one boot cycle.
#[derive(Debug, Clone, Serialize)]
pub struct BootResult {
    pub outcome: BootOutcome,
    /// Exit code of the hypervisor, when it exited on its own with one.
    pub exit_code: Option<i32>,
    /// Captured console output in stream order.
    pub transcript: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BootResult {
    pub fn is_success(&self) -> bool {
        self.outcome == BootOutcome::Success
    }

    /// Wall-clock duration of the cycle.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Map the outcome onto the error taxonomy for `?`-style assertions.
    pub fn ok(&self) -> Result<()> {
        match &self.outcome {
            BootOutcome::Success => Ok(()),
            BootOutcome::Failure(reason) => Err(HarnessError::BootFailed(reason.clone())),
            BootOutcome::Timeout { secs } => Err(HarnessError::BootTimeout { secs: *secs }),
        }
    }
}

enum RaceWinner {
    Exited(std::io::Result<std::process::ExitStatus>),
    Verdict(TriggerVerdict),
    TimedOut,
}

/// How long the dispatcher may drain buffered console output after the race
/// resolves, before the readers are cancelled outright.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Supervise one boot cycle and produce its [`BootResult`].
///
/// Runs the output monitor and the countdown concurrently with the process,
/// terminates it on an early verdict or timeout, and hands the trigger set
/// back for re-arming.
pub async fn supervise(
    mut process: HypervisorProcess,
    triggers: TriggerSet,
    transcript: Arc<Mutex<Vec<String>>>,
    timeout: Duration,
) -> (BootResult, TriggerSet) {
    let started_at = Utc::now();
    let cancel = CancellationToken::new();

    let lines = monitor::spawn_readers(
        process.take_stdout(),
        process.take_stderr(),
        cancel.clone(),
    );
    let (verdict_tx, mut verdict_rx) = mpsc::channel(4);
    let mut dispatcher = tokio::spawn(monitor::dispatch(
        lines,
        triggers,
        Arc::clone(&transcript),
        process.console_writer(),
        verdict_tx,
    ));

    let winner = tokio::select! {
        status = process.wait() => RaceWinner::Exited(status),
        Some(verdict) = verdict_rx.recv() => RaceWinner::Verdict(verdict),
        _ = tokio::time::sleep(timeout) => RaceWinner::TimedOut,
    };

    let outcome = match winner {
        RaceWinner::Exited(Ok(status)) if status.success() => BootOutcome::Success,
        RaceWinner::Exited(Ok(status)) => {
            BootOutcome::Failure(format!("hypervisor exited with {status}"))
        }
        RaceWinner::Exited(Err(e)) => {
            BootOutcome::Failure(format!("failed waiting for hypervisor: {e}"))
        }
        RaceWinner::Verdict(verdict) => {
            debug!(?verdict, "terminal trigger verdict, terminating hypervisor");
            process.terminate().await;
            match verdict {
                TriggerVerdict::Success => BootOutcome::Success,
                TriggerVerdict::Failure(reason) => BootOutcome::Failure(reason),
                // The dispatcher never forwards Continue.
                TriggerVerdict::Continue => {
                    BootOutcome::Failure("spurious non-terminal verdict".into())
                }
            }
        }
        RaceWinner::TimedOut => {
            warn!(secs = timeout.as_secs(), "boot timed out, terminating hypervisor");
            process.terminate().await;
            BootOutcome::Timeout {
                secs: timeout.as_secs(),
            }
        }
    };

    // Let the dispatcher drain any console output still buffered in the
    // pipes, so lines emitted before the terminal condition stay in the
    // transcript. A grandchild of the hypervisor can keep the pipe open
    // past the kill, so cancel the readers once the grace period runs out.
    let triggers = match tokio::time::timeout(DRAIN_GRACE, &mut dispatcher).await {
        Ok(joined) => joined.unwrap_or_else(|e| {
            warn!(error = %e, "output dispatcher task failed");
            TriggerSet::new()
        }),
        Err(_) => {
            cancel.cancel();
            dispatcher.await.unwrap_or_else(|e| {
                warn!(error = %e, "output dispatcher task failed");
                TriggerSet::new()
            })
        }
    };

    let exit_code = process.exit_status().and_then(|s| s.code());
    let result = BootResult {
        outcome,
        exit_code,
        transcript: transcript.lock().unwrap().clone(),
        started_at,
        finished_at: Utc::now(),
    };

    (result, triggers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(BootOutcome::Success.to_string(), "success");
        assert_eq!(
            BootOutcome::Failure("exit 1".into()).to_string(),
            "failure: exit 1"
        );
        assert_eq!(
            BootOutcome::Timeout { secs: 20 }.to_string(),
            "timeout after 20s"
        );
    }

    #[test]
    fn test_result_ok_maps_onto_error_taxonomy() {
        let base = BootResult {
            outcome: BootOutcome::Success,
            exit_code: Some(0),
            transcript: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert!(base.ok().is_ok());

        let timeout = BootResult {
            outcome: BootOutcome::Timeout { secs: 20 },
            ..base.clone()
        };
        assert!(matches!(
            timeout.ok().unwrap_err(),
            HarnessError::BootTimeout { secs: 20 }
        ));

        let failed = BootResult {
            outcome: BootOutcome::Failure("boom".into()),
            ..base
        };
        assert!(matches!(failed.ok().unwrap_err(), HarnessError::BootFailed(_)));
    }
}
