use thiserror::Error;

/// Core harness error type.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The external build tool failed or produced no image artifact.
    /// Build failures are fatal to the current run; the captured build log
    /// is reported verbatim and no retry is attempted.
    #[error("image build failed (exit code {})", .exit_code.map_or(-1, |c| c))]
    Build {
        exit_code: Option<i32>,
        log: String,
    },

    /// The hypervisor process could not be started.
    #[error("failed to launch hypervisor: {0}")]
    Launch(String),

    /// No terminal condition was reached within the boot timeout.
    /// Always a test failure; the transcript up to this point is preserved
    /// in the accompanying [`BootResult`](crate::BootResult).
    #[error("boot cycle timed out after {secs}s")]
    BootTimeout { secs: u64 },

    /// The boot cycle ended in failure (non-zero exit or failure verdict).
    #[error("boot cycle failed: {0}")]
    BootFailed(String),

    /// A trigger callback reported an error. Returned by callbacks to mark
    /// the boot cycle failed without aborting the monitor loop.
    #[error("trigger callback error: {0}")]
    Trigger(String),

    /// A trigger pattern was registered twice on the same VM.
    #[error("trigger pattern already registered: {0}")]
    DuplicateTrigger(String),

    /// The operation is not valid in the VM's current lifecycle phase.
    #[error("invalid lifecycle phase: expected {expected}, got {actual}")]
    WrongState { expected: String, actual: String },

    /// The requested VM was not found in the registry.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (pipes, files, process spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, HarnessError>;
