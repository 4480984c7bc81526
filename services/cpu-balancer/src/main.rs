//! virtbal CPU balancer daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use virtbal_cpu::CpuBalancer;
use virtbal_core::{driver, telemetry};
use virtbal_gateway::libvirt::LibvirtHypervisor;
use virtbal_gateway::QEMU_SYSTEM_URI;

/// Flatten pCPU utilization by periodically repinning guest vCPUs.
#[derive(Debug, Parser)]
#[command(name = "cpu-balancer")]
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

    let shutdown = driver::shutdown_signal();
    let mut balancer = CpuBalancer::new(hypervisor);
    driver::run(
        &mut balancer,
        Duration::from_millis(args.interval_ms),
        shutdown,
    )
    .await?;

    Ok(())
}
