//! Per-tick pipeline and cross-tick state.

use std::collections::BTreeSet;
use std::time::Duration;

use virtbal_core::driver::{Balancer, TickError, TickReport};
use virtbal_gateway::Hypervisor;

use crate::{collect, scheduler};

/// The memory balancing pipeline.
///
/// Owns the set of UUIDs seen on the previous tick, which gates the
/// one-time statistics-period programming for newly appeared domains.
pub struct MemoryBalancer<H: Hypervisor> {
    hypervisor: H,
    interval: Duration,
    seen: BTreeSet<String>,
}

impl<H: Hypervisor> MemoryBalancer<H> {
    pub fn new(hypervisor: H, interval: Duration) -> Self {
        Self {
            hypervisor,
            interval,
            seen: BTreeSet::new(),
        }
    }
}

impl<H: Hypervisor> Balancer for MemoryBalancer<H> {
    fn name(&self) -> &'static str {
        "memory-balancer"
    }

    fn tick(&mut self) -> Result<TickReport, TickError> {
        let domains = collect::collect(&self.hypervisor, self.interval, &mut self.seen)?;
        let system_memory_limit = self.hypervisor.total_memory_bytes()?;

        let outcome = scheduler::schedule(domains, system_memory_limit)?;

        Ok(if outcome.commits() == 0 {
            TickReport::Held
        } else {
            TickReport::Balanced {
                commits: outcome.commits(),
            }
        })
    }
}
