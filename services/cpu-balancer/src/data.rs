//! Scheduler input construction.
//!
//! Turns the raw cross-tick tables into the two flat views the scheduler
//! works with: one datum per vCPU carrying its usage delta, and one datum
//! per pCPU carrying the summed delta of the vCPUs currently pinned to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use virtbal_core::driver::TickError;
use virtbal_core::telemetry::{record, Severity};

use crate::snapshot::VcpuTable;

/// One schedulable vCPU.
///
/// The owning domain handle moves out of the snapshot into the datum; all
/// vCPUs of one domain share the single live handle through the `Arc`.
pub struct VcpuDatum<D> {
    pub vcpu: u32,
    pub current_pcpu: usize,
    pub target_pcpu: usize,
    pub uuid: String,
    pub domain: Arc<D>,
    pub delta_ns: u64,
}

/// Aggregate load on one pCPU over the last interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpuDatum {
    pub pcpu: usize,
    pub usage_ns: u64,
    pub vcpus: usize,
}

impl PcpuDatum {
    pub fn idle(pcpu: usize) -> Self {
        Self {
            pcpu,
            usage_ns: 0,
            vcpus: 0,
        }
    }
}

/// Build vCPU datums for every domain not in `skip`.
///
/// Usage deltas are clamped at zero: a cumulative counter moving backwards
/// is flagged and treated as no usage rather than poisoning the sort.
pub fn vcpu_data<D>(
    current: &VcpuTable,
    previous: &VcpuTable,
    skip: &BTreeSet<String>,
    mut handles: BTreeMap<String, D>,
) -> Vec<VcpuDatum<D>> {
    let mut data = Vec::new();

    for (uuid, vcpus) in current {
        if skip.contains(uuid) {
            continue;
        }
        let Some(previous_vcpus) = previous.get(uuid) else {
            // The delta stage guarantees presence; anything else is a race
            // worth flagging, not worth aborting.
            record(
                Severity::Flag,
                format!("domain {uuid} missing from previous interval; skipped"),
            );
            continue;
        };
        let Some(handle) = handles.remove(uuid) else {
            record(
                Severity::Flag,
                format!("domain {uuid} has no live handle; skipped"),
            );
            continue;
        };

        let domain = Arc::new(handle);
        for (info, previous_info) in vcpus.iter().zip(previous_vcpus) {
            let delta_ns = match info.usage_ns.checked_sub(previous_info.usage_ns) {
                Some(delta) => delta,
                None => {
                    record(
                        Severity::Flag,
                        format!(
                            "usage counter moved backwards for vCPU {} of domain {uuid}; using zero",
                            info.vcpu
                        ),
                    );
                    0
                }
            };

            data.push(VcpuDatum {
                vcpu: info.vcpu,
                current_pcpu: info.pcpu as usize,
                target_pcpu: info.pcpu as usize,
                uuid: uuid.clone(),
                domain: Arc::clone(&domain),
                delta_ns,
            });
        }
    }

    data
}

/// Sum vCPU deltas onto the pCPUs they are currently pinned to.
pub fn pcpu_data<D>(
    vcpus: &[VcpuDatum<D>],
    pcpu_count: usize,
) -> Result<Vec<PcpuDatum>, TickError> {
    if pcpu_count == 0 {
        return Err(TickError::Corrupt("host reports zero pCPUs".into()));
    }

    let mut data: Vec<PcpuDatum> = (0..pcpu_count).map(PcpuDatum::idle).collect();
    for datum in vcpus {
        if datum.current_pcpu >= pcpu_count {
            return Err(TickError::Corrupt(format!(
                "vCPU {} of domain {} pinned to pCPU {} on a {}-pCPU host",
                datum.vcpu, datum.uuid, datum.current_pcpu, pcpu_count
            )));
        }
        let pcpu = &mut data[datum.current_pcpu];
        pcpu.usage_ns += datum.delta_ns;
        pcpu.vcpus += 1;
    }

    Ok(data)
}
