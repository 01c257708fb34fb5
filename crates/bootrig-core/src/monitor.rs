//! Console output monitoring and trigger dispatch.
//!
//! Reader tasks consume the hypervisor's output streams line by line and
//! forward them over a bounded channel to a dispatcher task, so a slow
//! trigger callback never stalls stream consumption. The dispatcher appends
//! every line to the shared transcript in stream order, matches the ordered
//! trigger table, and forwards terminal verdicts to the supervisor.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::error::{HarnessError, Result};
use crate::process::ConsoleWriter;

/// Line channel depth between readers and the dispatcher.
const LINE_BUFFER: usize = 64;

/// What a trigger callback tells the boot cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerVerdict {
    /// Keep monitoring.
    Continue,
    /// End the boot cycle successfully; the process is then terminated.
    Success,
    /// End the boot cycle as failed; the process is then terminated.
    Failure(String),
}

/// Callback invoked with the matched line and a writable console handle.
pub type TriggerCallback =
    Box<dyn FnMut(&str, &ConsoleWriter) -> Result<TriggerVerdict> + Send>;

struct Trigger {
    pattern: String,
    fired: bool,
    callback: TriggerCallback,
}

/// Built-in marker trigger derived from configuration.
struct Marker {
    pattern: String,
    fired: bool,
    pass: bool,
}

/// Ordered trigger table for one VM.
///
/// Matching is literal substring containment. Insertion order is priority:
/// when several patterns match one line, the first registered unfired one
/// wins. Each trigger fires at most once per boot cycle until [`rearm`]ed.
/// Configured pass/fail markers rank below every user trigger.
///
/// [`rearm`]: TriggerSet::rearm
#[derive(Default)]
pub struct TriggerSet {
    triggers: Vec<Trigger>,
    markers: Vec<Marker>,
}

impl std::fmt::Debug for TriggerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSet")
            .field("triggers", &self.triggers.len())
            .field("markers", &self.markers.len())
            .finish()
    }
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern → callback binding. Patterns are unique per VM.
    pub fn register(&mut self, pattern: String, callback: TriggerCallback) -> Result<()> {
        if self.triggers.iter().any(|t| t.pattern == pattern) {
            return Err(HarnessError::DuplicateTrigger(pattern));
        }
        self.triggers.push(Trigger {
            pattern,
            fired: false,
            callback,
        });
        Ok(())
    }

    /// Replace the built-in marker patterns for the next cycle.
    pub fn set_markers(&mut self, pass: &[String], fail: &[String]) {
        self.markers = pass
            .iter()
            .map(|p| (p, true))
            .chain(fail.iter().map(|p| (p, false)))
            .map(|(pattern, pass)| Marker {
                pattern: pattern.clone(),
                fired: false,
                pass,
            })
            .collect();
    }

    /// Reset fired flags so every trigger can fire again in a new cycle.
    pub fn rearm(&mut self) {
        for trigger in &mut self.triggers {
            trigger.fired = false;
        }
        for marker in &mut self.markers {
            marker.fired = false;
        }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Match `line` against the table and fire at most one trigger.
    ///
    /// Returns `Ok(None)` when nothing matched, otherwise the fired
    /// trigger's verdict. Callback errors propagate as [`HarnessError`].
    pub fn dispatch_line(
        &mut self,
        line: &str,
        writer: &ConsoleWriter,
    ) -> Result<Option<TriggerVerdict>> {
        if let Some(trigger) = self
            .triggers
            .iter_mut()
            .find(|t| !t.fired && line.contains(&t.pattern))
        {
            trigger.fired = true;
            trace!(pattern = %trigger.pattern, "trigger matched");
            return (trigger.callback)(line, writer).map(Some);
        }

        if let Some(marker) = self
            .markers
            .iter_mut()
            .find(|m| !m.fired && line.contains(&m.pattern))
        {
            marker.fired = true;
            let verdict = if marker.pass {
                TriggerVerdict::Success
            } else {
                TriggerVerdict::Failure(format!(
                    "failure marker '{}' seen in console output",
                    marker.pattern
                ))
            };
            return Ok(Some(verdict));
        }

        Ok(None)
    }
}

/// Spawn reader tasks for the given streams, feeding one line channel.
pub(crate) fn spawn_readers<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    cancel: CancellationToken,
) -> mpsc::Receiver<String>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);

    if let Some(stream) = stdout {
        tokio::spawn(read_stream(
            BufReader::new(stream),
            tx.clone(),
            cancel.clone(),
        ));
    }
    if let Some(stream) = stderr {
        tokio::spawn(read_stream(BufReader::new(stream), tx, cancel));
    }

    rx
}

/// Consume one stream line by line until EOF or cancellation.
///
/// Lines are decoded lossily; a serial console is not guaranteed to emit
/// valid UTF-8.
async fn read_stream<R>(mut reader: R, tx: mpsc::Sender<String>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                trace!(error = %e, "console stream read failed");
                break;
            }
        }
    }
}

/// Dispatcher: transcript capture and trigger execution for one boot cycle.
///
/// Runs until the line channel closes (stream EOF or reader cancellation).
/// After the first terminal verdict the remaining lines are still appended
/// to the transcript, but no further trigger fires. Returns the trigger set
/// so the VM can re-arm it for a later cycle.
pub(crate) async fn dispatch(
    mut lines: mpsc::Receiver<String>,
    mut triggers: TriggerSet,
    transcript: Arc<Mutex<Vec<String>>>,
    writer: ConsoleWriter,
    verdicts: mpsc::Sender<TriggerVerdict>,
) -> TriggerSet {
    let mut terminal = false;

    while let Some(line) = lines.recv().await {
        trace!(line = %line, "console");
        transcript.lock().unwrap().push(line.clone());

        if terminal {
            continue;
        }

        match triggers.dispatch_line(&line, &writer) {
            Ok(None) | Ok(Some(TriggerVerdict::Continue)) => {}
            Ok(Some(verdict)) => {
                terminal = true;
                let _ = verdicts.send(verdict).await;
            }
            Err(e) => {
                // A failing callback marks the cycle failed without
                // crashing the monitor loop.
                error!(error = %e, "trigger callback failed");
                terminal = true;
                let _ = verdicts.send(TriggerVerdict::Failure(e.to_string())).await;
            }
        }
    }

    triggers
}
