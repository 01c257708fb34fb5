//! `bootrig-core` — boot-cycle test orchestration for unikernel images.
//!
//! The harness drives a hypervisor/emulator around a bootable image: build
//! it, boot it with a bounded timeout, watch its serial console for trigger
//! patterns, and tear everything down without leaking processes. It exposes:
//!
//! - [`Harness`] — configuration-initialised VM registry
//! - [`Vm`] / [`VmPhase`] — per-VM lifecycle facade
//! - [`BootResult`] / [`BootOutcome`] — terminal record of one boot cycle
//! - [`TriggerSet`] / [`TriggerVerdict`] — console pattern → callback table
//! - [`ImageBuilder`] / [`BuildTool`] — external build-tool adapter
//! - [`HypervisorProcess`] / [`ConsoleWriter`] — process launch & console I/O
//! - [`HarnessConfig`] and friends — `bootrig.toml` configuration types
//!
//! A boot cycle races process exit, trigger verdicts and the timeout; the
//! first to occur wins and cancels the others. The `boot` call itself is a
//! synchronous interface over that internally concurrent implementation.

pub mod builder;
pub mod config;
pub mod error;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod vm;

pub use builder::ImageBuilder;
pub use config::{
    BuildConfig, BuildTool, DEFAULT_CONFIG_FILE, DefaultsConfig, HarnessConfig, HypervisorConfig,
    SOURCE_ROOT_ENV, VmConfig,
};
pub use error::{HarnessError, Result};
pub use monitor::{TriggerCallback, TriggerSet, TriggerVerdict};
pub use process::{ConsoleWriter, HypervisorProcess, TerminateHandle};
pub use registry::Harness;
pub use supervisor::{BootOutcome, BootResult, supervise};
pub use vm::{Vm, VmPhase};
