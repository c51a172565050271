//! The `backends` command - shows backends and their capabilities.

use super::yes_no;
use clap::Args;
use serde::Serialize;
use vmpod::{BackendCapabilities, HypervisorType, available_backends};

#[derive(Args)]
pub struct BackendsArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct BackendInfo {
    name: HypervisorType,
    available: bool,
    capabilities: BackendCapabilities,
}

#[derive(Serialize)]
struct BackendList {
    backends: Vec<BackendInfo>,
}

pub fn run(args: BackendsArgs) -> anyhow::Result<()> {
    let backends: Vec<BackendInfo> = available_backends()
        .into_iter()
        .map(|(kind, backend)| BackendInfo {
            name: kind,
            available: backend.is_available(),
            capabilities: backend.capabilities().clone(),
        })
        .collect();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&BackendList { backends })?
        );
    } else {
        print_text(&backends);
    }

    Ok(())
}

fn print_text(backends: &[BackendInfo]) {
    if backends.is_empty() {
        println!("No backends available.");
        return;
    }

    println!("Backends:");
    println!();

    for backend in backends {
        let caps = &backend.capabilities;
        let status = if backend.available {
            "Available"
        } else {
            "Not available"
        };

        println!("  {}", backend.name);
        println!("    Status: {status}");
        println!("    Block devices: {}", yes_no(caps.block_devices));
        println!(
            "    Hotplug: block={}, vfio={}, network={}",
            yes_no(caps.hotplug.block),
            yes_no(caps.hotplug.vfio),
            yes_no(caps.hotplug.network)
        );
        println!("    Pause/resume: {}", yes_no(caps.pause_resume));
        if caps.max_vcpus.is_some() || caps.max_memory_mb.is_some() {
            println!(
                "    Limits: vcpus={}, memory={}",
                caps.max_vcpus
                    .map_or("unlimited".to_string(), |n| n.to_string()),
                caps.max_memory_mb
                    .map_or("unlimited".to_string(), |n| format!("{n} MiB"))
            );
        }
        println!();
    }
}
