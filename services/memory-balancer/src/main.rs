//! virtbal memory balancer daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use virtbal_core::{driver, telemetry};
use virtbal_gateway::libvirt::LibvirtHypervisor;
use virtbal_gateway::QEMU_SYSTEM_URI;
use virtbal_mem::MemoryBalancer;

/// Flatten memory pressure by periodically resizing guest balloons.
#[derive(Debug, Parser)]
#[command(name = "memory-balancer")]
struct Args {
    /// Tick interval in milliseconds.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init();

    let hypervisor = LibvirtHypervisor::open(QEMU_SYSTEM_URI)
        .context("unable to connect to the system hypervisor")?;

    let interval = Duration::from_millis(args.interval_ms);
    let shutdown = driver::shutdown_signal();
    let mut balancer = MemoryBalancer::new(hypervisor, interval);
    driver::run(&mut balancer, interval, shutdown).await?;

    Ok(())
}
