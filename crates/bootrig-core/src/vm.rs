//! The VM handle: one configured test subject and its lifecycle.
//!
//! A [`Vm`] moves through an explicit phase machine — `Unbuilt → Built →
//! Booting → Terminal` — and every operation validates the phase it is
//! called in, so a misordered script fails with a descriptive error instead
//! of undefined behaviour.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builder::ImageBuilder;
use crate::config::{BuildConfig, DefaultsConfig, HarnessConfig, HypervisorConfig, VmConfig};
use crate::error::{HarnessError, Result};
use crate::monitor::{TriggerSet, TriggerVerdict};
use crate::process::{ConsoleWriter, HypervisorProcess, TerminateHandle};
use crate::supervisor::{self, BootResult};

/// Lifecycle phase of a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    /// No image built yet (one may still be supplied pre-built).
    Unbuilt,
    /// An image is available; ready to boot.
    Built,
    /// A boot cycle is in flight.
    Booting,
    /// The lifecycle ended; the boot result (if any) is cached.
    Terminal,
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmPhase::Unbuilt => write!(f, "unbuilt"),
            VmPhase::Built => write!(f, "built"),
            VmPhase::Booting => write!(f, "booting"),
            VmPhase::Terminal => write!(f, "terminal"),
        }
    }
}

/// One configured virtual machine under test.
#[derive(Debug)]
pub struct Vm {
    name: String,
    config: VmConfig,
    build: BuildConfig,
    hypervisor: HypervisorConfig,
    defaults: DefaultsConfig,
    phase: VmPhase,
    /// `None` only while a boot cycle owns the table.
    triggers: Option<TriggerSet>,
    transcript: Arc<Mutex<Vec<String>>>,
    /// Present only while a hypervisor process is alive.
    writer: Option<ConsoleWriter>,
    terminate: Option<TerminateHandle>,
    result: Option<BootResult>,
}

impl Vm {
    /// Create a VM from its entry plus the harness-wide sections.
    pub fn new(mut config: VmConfig, harness: &HarnessConfig) -> Self {
        if config.name.is_empty() {
            config.name = format!("vm-{}", &Uuid::new_v4().to_string()[..8]);
        }
        let phase = if config.image.is_some() || !config.command.is_empty() {
            VmPhase::Built
        } else {
            VmPhase::Unbuilt
        };

        Self {
            name: config.name.clone(),
            config,
            build: harness.build.clone(),
            hypervisor: harness.hypervisor.clone(),
            defaults: harness.defaults.clone(),
            phase,
            triggers: Some(TriggerSet::new()),
            transcript: Arc::new(Mutex::new(Vec::new())),
            writer: None,
            terminate: None,
            result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> VmPhase {
        self.phase
    }

    /// Snapshot of the captured console output for the current cycle.
    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().unwrap().clone()
    }

    /// The cached result of the last boot cycle, if one finished.
    pub fn result(&self) -> Option<&BootResult> {
        self.result.as_ref()
    }

    /// Register an output trigger: when `pattern` appears as a substring of
    /// a console line, `callback` runs with the line and a writable console
    /// handle. Registration is rejected while a boot cycle is in flight;
    /// lines consumed before a later registration are not replayed.
    pub fn on_output<F>(&mut self, pattern: impl Into<String>, callback: F) -> Result<&mut Self>
    where
        F: FnMut(&str, &ConsoleWriter) -> Result<TriggerVerdict> + Send + 'static,
    {
        let Some(triggers) = self.triggers.as_mut() else {
            return Err(HarnessError::WrongState {
                expected: "not booting".into(),
                actual: self.phase.to_string(),
            });
        };
        triggers.register(pattern.into(), Box::new(callback))?;
        Ok(self)
    }

    /// Build the image with the configured external tool.
    ///
    /// # Errors
    ///
    /// Fails from any phase but `Unbuilt`, when the VM names no image
    /// artifact, or when the build itself fails.
    pub async fn build(&mut self) -> Result<&mut Self> {
        if self.phase != VmPhase::Unbuilt {
            return Err(HarnessError::WrongState {
                expected: VmPhase::Unbuilt.to_string(),
                actual: self.phase.to_string(),
            });
        }
        let image = self.config.image.clone().ok_or_else(|| {
            HarnessError::Config(format!("VM '{}' has no image path to build", self.name))
        })?;

        let built = ImageBuilder::new(self.build.clone()).build(&image).await?;
        self.config.image = Some(built);
        self.phase = VmPhase::Built;
        Ok(self)
    }

    /// Run one boot cycle and return its result.
    ///
    /// Permitted from `Unbuilt` (with a pre-built image or command override)
    /// and `Built`. The call blocks until a terminal condition — process
    /// exit, trigger verdict, or timeout — is reached; launcher, monitor and
    /// countdown run concurrently underneath. `timeout` falls back to
    /// `defaults.timeout_secs` when `None`.
    pub async fn boot(&mut self, timeout: Option<Duration>) -> Result<BootResult> {
        match self.phase {
            VmPhase::Unbuilt | VmPhase::Built => {}
            other => {
                return Err(HarnessError::WrongState {
                    expected: "unbuilt or built".into(),
                    actual: other.to_string(),
                });
            }
        }
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.defaults.timeout_secs));
        let (program, args) = self.config.command_line(&self.hypervisor, &self.defaults)?;

        let mut triggers = self.triggers.take().ok_or_else(|| HarnessError::WrongState {
            expected: "idle trigger table".into(),
            actual: "booting".into(),
        })?;
        triggers.set_markers(&self.defaults.pass_patterns, &self.defaults.fail_patterns);
        self.transcript = Arc::new(Mutex::new(Vec::new()));

        info!(
            vm = %self.name,
            program = %program.display(),
            timeout_secs = timeout.as_secs(),
            "booting VM"
        );
        self.phase = VmPhase::Booting;

        let process = match HypervisorProcess::launch(&program, &args) {
            Ok(process) => process,
            Err(e) => {
                self.triggers = Some(triggers);
                self.phase = VmPhase::Terminal;
                return Err(e);
            }
        };
        self.writer = Some(process.console_writer());
        self.terminate = Some(process.terminate_handle());

        let (result, triggers) =
            supervisor::supervise(process, triggers, Arc::clone(&self.transcript), timeout)
                .await;

        self.triggers = Some(triggers);
        self.writer = None;
        self.terminate = None;
        self.phase = VmPhase::Terminal;

        info!(vm = %self.name, outcome = %result.outcome, "boot cycle finished");
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Inject a line into the guest's console input. Only valid while a
    /// boot cycle is in flight (typically from a trigger callback).
    pub fn write_line(&self, line: &str) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.write_line(line),
            None => Err(HarnessError::WrongState {
                expected: VmPhase::Booting.to_string(),
                actual: self.phase.to_string(),
            }),
        }
    }

    /// Reset fired triggers and clear the cached result, returning the VM
    /// to `Built` for another boot cycle.
    pub fn rearm(&mut self) -> Result<&mut Self> {
        if self.phase != VmPhase::Terminal {
            return Err(HarnessError::WrongState {
                expected: VmPhase::Terminal.to_string(),
                actual: self.phase.to_string(),
            });
        }
        if let Some(triggers) = self.triggers.as_mut() {
            triggers.rearm();
        }
        self.result = None;
        self.phase = if self.config.image.is_some() || !self.config.command.is_empty() {
            VmPhase::Built
        } else {
            VmPhase::Unbuilt
        };
        Ok(self)
    }

    /// Tear the VM down. Idempotent: terminates a live hypervisor process
    /// if one exists, releases the console handle, and is safe to call even
    /// if boot failed or was never invoked. Cleanup problems are logged,
    /// never escalated.
    pub fn clean(&mut self) {
        if let Some(handle) = self.terminate.take() {
            warn!(vm = %self.name, "cleaning VM with a live hypervisor process");
            handle.kill();
        }
        self.writer = None;
        if self.phase != VmPhase::Terminal {
            debug!(vm = %self.name, "VM cleaned");
        }
        self.phase = VmPhase::Terminal;
    }
}
