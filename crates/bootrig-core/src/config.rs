use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Environment variable naming the root source tree. When set it overrides
/// `build.source_root` from the config file.
pub const SOURCE_ROOT_ENV: &str = "BOOTRIG_SRC";

/// Conventional config file name looked up in the source root.
pub const DEFAULT_CONFIG_FILE: &str = "bootrig.toml";

/// Top-level harness configuration (maps to `bootrig.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub build: BuildConfig,
    pub hypervisor: HypervisorConfig,
    pub defaults: DefaultsConfig,
    /// Per-VM entries (`[[vm]]` tables). An empty list yields one default VM.
    #[serde(rename = "vm")]
    pub vms: Vec<VmConfig>,
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(HarnessError::Io)?;
        toml::from_str(&content).map_err(|e| HarnessError::Config(e.to_string()))
    }
}

/// External build tool used to produce the image artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    Make,
    Cmake,
}

impl std::fmt::Display for BuildTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildTool::Make => write!(f, "make"),
            BuildTool::Cmake => write!(f, "cmake"),
        }
    }
}

impl FromStr for BuildTool {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "make" => Ok(BuildTool::Make),
            "cmake" => Ok(BuildTool::Cmake),
            other => Err(HarnessError::Config(format!(
                "unknown build tool '{other}' (expected 'make' or 'cmake')"
            ))),
        }
    }
}

/// Image build settings. Tool selection is configuration, not a code branch
/// per test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Which build tool drives the image build.
    pub tool: BuildTool,
    /// Root of the source tree the build runs in. Overridden by
    /// [`SOURCE_ROOT_ENV`] when that variable is set.
    pub source_root: PathBuf,
    /// Optional build-tool target name.
    pub target: Option<String>,
    /// Parallel build jobs. `0` leaves the tool's default in place.
    pub jobs: u32,
    /// Override the build tool executable (e.g. a wrapper script).
    pub program: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: BuildTool::Make,
            source_root: PathBuf::from("."),
            target: None,
            jobs: 0,
            program: None,
        }
    }
}

impl BuildConfig {
    /// The effective source root: the environment variable wins, then the
    /// configured path.
    pub fn resolved_source_root(&self) -> PathBuf {
        std::env::var(SOURCE_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.source_root.clone())
    }
}

/// Hypervisor binary and arguments shared by every VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Path or name of the hypervisor executable.
    pub binary: PathBuf,
    /// Arguments prepended to every synthesised invocation.
    pub default_args: Vec<String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-x86_64"),
            default_args: vec!["-nographic".into()],
        }
    }
}

/// Values used when a boot call or VM entry omits a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Boot timeout fallback when a script passes none.
    pub timeout_secs: u64,
    /// Guest memory in MiB.
    pub memory_mib: u64,
    /// Console substrings that mark the cycle successful. Registered as
    /// built-in triggers after user triggers, pass before fail.
    pub pass_patterns: Vec<String>,
    /// Console substrings that mark the cycle failed.
    pub fail_patterns: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            memory_mib: 128,
            pass_patterns: Vec::new(),
            fail_patterns: Vec::new(),
        }
    }
}

/// One VM entry supplied at registry initialisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Human-readable name (generated when empty).
    pub name: String,
    /// Bootable image path, relative to the source root unless absolute.
    /// May be absent when the image is produced by `build()` later or when
    /// `command` overrides the invocation entirely.
    pub image: Option<PathBuf>,
    /// Guest memory in MiB; falls back to `defaults.memory_mib`.
    pub memory_mib: Option<u64>,
    /// Extra block devices attached as virtio drives.
    pub drives: Vec<PathBuf>,
    /// Extra hypervisor arguments appended to the synthesised invocation.
    pub extra_args: Vec<String>,
    /// Full hypervisor command override (program followed by its args).
    /// When non-empty the standard invocation is not synthesised.
    pub command: Vec<String>,
}

impl VmConfig {
    /// Resolve the hypervisor program and argument list for this VM.
    pub fn command_line(
        &self,
        hypervisor: &HypervisorConfig,
        defaults: &DefaultsConfig,
    ) -> Result<(PathBuf, Vec<String>)> {
        if let Some((program, args)) = self.command.split_first() {
            return Ok((PathBuf::from(program), args.to_vec()));
        }

        let image = self.image.as_ref().ok_or_else(|| {
            HarnessError::Config(format!(
                "VM '{}' has neither an image nor a command override",
                self.name
            ))
        })?;

        let mut args = hypervisor.default_args.clone();
        args.push("-m".into());
        args.push(self.memory_mib.unwrap_or(defaults.memory_mib).to_string());
        args.push("-kernel".into());
        args.push(image.display().to_string());
        for drive in &self.drives {
            args.push("-drive".into());
            args.push(format!("file={},format=raw,if=virtio", drive.display()));
        }
        args.extend(self.extra_args.iter().cloned());

        Ok((hypervisor.binary.clone(), args))
    }
}
