//! Per-tick pipeline and cross-tick state.

use virtbal_core::driver::{Balancer, TickError, TickReport};
use virtbal_gateway::Hypervisor;

use crate::snapshot::{self, VcpuTable};
use crate::{data, delta, scheduler};

/// The CPU balancing pipeline.
///
/// Owns the previous tick's vCPU table. The first successful snapshot is
/// only stored: without a previous table there are no usage deltas to
/// schedule over. A failed tick leaves the stored table untouched, so the
/// next tick diffs against the last good snapshot.
pub struct CpuBalancer<H: Hypervisor> {
    hypervisor: H,
    previous: Option<VcpuTable>,
}

impl<H: Hypervisor> CpuBalancer<H> {
    pub fn new(hypervisor: H) -> Self {
        Self {
            hypervisor,
            previous: None,
        }
    }
}

impl<H: Hypervisor> Balancer for CpuBalancer<H> {
    fn name(&self) -> &'static str {
        "cpu-balancer"
    }

    fn tick(&mut self) -> Result<TickReport, TickError> {
        let snapshot = snapshot::collect(&self.hypervisor)?;

        let Some(previous) = &self.previous else {
            self.previous = Some(snapshot.table);
            return Ok(TickReport::Warmup);
        };

        let comparison = delta::compare(&snapshot.table, previous);
        if !comparison.comparable && comparison.skip.is_empty() {
            self.previous = Some(snapshot.table);
            return Ok(TickReport::Skipped);
        }

        let mut vcpus = data::vcpu_data(
            &snapshot.table,
            previous,
            &comparison.skip,
            snapshot.handles,
        );
        let pcpu_count = self.hypervisor.pcpu_count()?;
        let pcpus = data::pcpu_data(&vcpus, pcpu_count)?;

        let outcome = scheduler::schedule(&mut vcpus, &pcpus)?;

        self.previous = Some(snapshot.table);
        Ok(if outcome.committed {
            TickReport::Balanced {
                commits: outcome.pins_issued,
            }
        } else {
            TickReport::Held
        })
    }
}
