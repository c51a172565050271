//! The `check` command - validates a configuration file and runs a
//! backend's `init` with it.

use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};
use vmpod::{HypervisorConfig, HypervisorType, new_hypervisor};

#[derive(Args)]
pub struct CheckArgs {
    /// Path to a TOML hypervisor configuration
    #[arg(long, short)]
    config: PathBuf,

    /// Backend to initialize (qemu or mock)
    #[arg(long, default_value = "qemu")]
    backend: HypervisorType,
}

pub async fn run(args: CheckArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    config.validate()?;

    println!("{}", toml::to_string_pretty(&config)?);

    let hypervisor = new_hypervisor(args.backend)?;
    hypervisor
        .init(config)
        .await
        .with_context(|| format!("{} backend rejected the configuration", args.backend))?;

    println!("{}: init ok", hypervisor.name());
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<HypervisorConfig> {
    tracing::debug!(path = %path.display(), "loading hypervisor config");
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}
