//! Image builds via the external build toolchain.
//!
//! The builder shells out to `make` or `cmake` in the configured source root
//! and verifies that the expected image artifact exists afterwards. A build
//! failure is fatal to the current run and carries the captured build log;
//! there are no retries.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{BuildConfig, BuildTool};
use crate::error::{HarnessError, Result};

/// Adapter around the external build tool.
pub struct ImageBuilder {
    config: BuildConfig,
}

impl ImageBuilder {
    /// Creates a builder from the given build settings.
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    /// Build the image and return its absolute path.
    ///
    /// `image` names the expected artifact, relative to the source root
    /// unless absolute. The build blocks the calling lifecycle step until the
    /// tool exits.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Build`] when the tool is missing, exits
    /// non-zero, or completes without producing the artifact.
    pub async fn build(&self, image: &Path) -> Result<PathBuf> {
        let root = self.config.resolved_source_root();
        let expected = if image.is_absolute() {
            image.to_path_buf()
        } else {
            root.join(image)
        };

        match self.config.tool {
            BuildTool::Make => {
                let mut args: Vec<String> = Vec::new();
                if self.config.jobs > 0 {
                    args.push(format!("-j{}", self.config.jobs));
                }
                if let Some(target) = &self.config.target {
                    args.push(target.clone());
                }
                self.run_tool("make", &args, &root).await?;
            }
            BuildTool::Cmake => {
                // Configure into build/, then build; the conventional
                // two-step cmake flow.
                let configure = ["-S".to_string(), ".".into(), "-B".into(), "build".into()];
                self.run_tool("cmake", &configure, &root).await?;

                let mut args = vec!["--build".to_string(), "build".into()];
                if let Some(target) = &self.config.target {
                    args.push("--target".into());
                    args.push(target.clone());
                }
                if self.config.jobs > 0 {
                    args.push("-j".into());
                    args.push(self.config.jobs.to_string());
                }
                self.run_tool("cmake", &args, &root).await?;
            }
        }

        if !expected.exists() {
            return Err(HarnessError::Build {
                exit_code: None,
                log: format!(
                    "build completed but image {} was not produced",
                    expected.display()
                ),
            });
        }

        info!(image = %expected.display(), tool = %self.config.tool, "image built");
        Ok(expected)
    }

    async fn run_tool(&self, default_program: &str, args: &[String], cwd: &Path) -> Result<()> {
        let program = self
            .config
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_program));
        let program = which::which(&program).map_err(|_| HarnessError::Build {
            exit_code: None,
            log: format!("build tool not found: {}", program.display()),
        })?;

        debug!(program = %program.display(), ?args, cwd = %cwd.display(), "running build tool");

        let output = Command::new(&program)
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(HarnessError::Io)?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(HarnessError::Build {
                exit_code: output.status.code(),
                log,
            });
        }

        Ok(())
    }
}
