//! The `host` command - runs the host probes the backends size VMs with.

use super::yes_no;
use clap::Args;
use std::path::PathBuf;
use vmpod::HostInfo;
use vmpod::host::{PROC_CPUINFO, PROC_MEMINFO};

#[derive(Args)]
pub struct HostArgs {
    /// Memory information source
    #[arg(long, default_value = PROC_MEMINFO)]
    meminfo: PathBuf,

    /// CPU information source
    #[arg(long, default_value = PROC_CPUINFO)]
    cpuinfo: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

pub fn run(args: HostArgs) -> anyhow::Result<()> {
    let info = HostInfo::probe(&args.meminfo, &args.cpuinfo)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "Memory: {} kB ({} MiB)",
            info.total_memory_kb,
            info.total_memory_mb()
        );
        println!("Running nested: {}", yes_no(info.nested));
    }

    Ok(())
}
