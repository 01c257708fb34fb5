use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use bootrig_core::{Harness, HarnessConfig, TriggerVerdict, VmConfig};

/// bootrig — boot-cycle test runner for unikernel images.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "bootrig.toml")]
    config: PathBuf,

    /// Bootable image to test (overrides the first VM entry).
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Build the image with the configured tool before booting.
    #[arg(long)]
    build: bool,

    /// Override the build tool from config (make, cmake).
    #[arg(long)]
    build_tool: Option<String>,

    /// Override the source root from config.
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Boot timeout in seconds (falls back to `defaults.timeout_secs`).
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Console substring that marks the boot successful (repeatable).
    #[arg(short, long)]
    expect: Vec<String>,

    /// Guest memory in MiB (overrides the first VM entry).
    #[arg(long)]
    memory: Option<u64>,

    /// Output format for the boot result.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Structured logging on stderr; stdout carries the boot result.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "bootrig starting");

    // Load configuration.
    let mut config = if args.config.exists() {
        HarnessConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        HarnessConfig::default()
    };

    // Apply CLI overrides.
    if let Some(tool) = &args.build_tool {
        config.build.tool = tool.parse()?;
    }
    if let Some(root) = args.source_root {
        config.build.source_root = root;
    }
    if config.vms.is_empty() {
        config.vms.push(VmConfig::default());
    }
    if let Some(image) = args.image {
        config.vms[0].image = Some(image);
    }
    if let Some(memory) = args.memory {
        config.vms[0].memory_mib = Some(memory);
    }

    let mut harness = Harness::from_config(config);
    let vm = harness.vm(0)?;

    for pattern in &args.expect {
        vm.on_output(pattern.clone(), |_line, _console| {
            Ok(TriggerVerdict::Success)
        })?;
    }

    if args.build {
        vm.build().await?;
    }

    let result = vm.boot(args.timeout.map(Duration::from_secs)).await?;
    vm.clean();

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => {
            for line in &result.transcript {
                println!("{line}");
            }
            println!("outcome: {}", result.outcome);
        }
    }

    // Non-zero exit status unless the cycle succeeded.
    result.ok()?;
    Ok(())
}
