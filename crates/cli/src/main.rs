mod commands;

use clap::{Parser, Subcommand};
use commands::backends::BackendsArgs;
use commands::check::CheckArgs;
use commands::host::HostArgs;
use commands::version::VersionArgs;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vmpod")]
#[command(about = "Diagnostics for the vmpod hypervisor abstraction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show host memory and nesting as seen by the backends
    Host(HostArgs),

    /// Show backends and their capabilities
    Backends(BackendsArgs),

    /// Validate a hypervisor configuration and initialize a backend with it
    Check(CheckArgs),

    /// Show version information
    Version(VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Host(args) => commands::host::run(args)?,
        Commands::Backends(args) => commands::backends::run(args)?,
        Commands::Check(args) => commands::check::run(args).await?,
        Commands::Version(args) => commands::version::run(args),
    }

    Ok(())
}
