//! Dispersion-gated greedy repinning.
//!
//! The scheduler predicts a flatter vCPU-to-pCPU assignment by walking the
//! vCPUs from heaviest to lightest and placing each on the least-loaded
//! predicted pCPU. The prediction is only committed when the current
//! pinning's dispersion is above an upper bound and the predicted one falls
//! at or below a lower bound; the gap between the two bounds is the
//! hysteresis that stops the balancer from oscillating.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use virtbal_core::driver::TickError;
use virtbal_core::stats;
use virtbal_core::telemetry::{record, Severity};
use virtbal_gateway::DomainHandle;

use crate::data::{PcpuDatum, VcpuDatum};

/// Above this pCPU count, finding the least-loaded pCPU uses a min-heap
/// instead of a linear scan.
pub const CPU_HEAP_THRESHOLD: usize = 1 << 10;

/// Dispersion of the current pinning must exceed this to repin at all.
pub const DISPERSION_UPPER_BOUND: f64 = 0.115;

/// Dispersion of the predicted pinning must not exceed this to repin.
pub const DISPERSION_LOWER_BOUND: f64 = 0.075;

/// What the scheduler did with one tick's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub committed: bool,
    pub pins_issued: usize,
    pub pin_failures: usize,
}

/// Source for the least-loaded predicted pCPU.
///
/// Ordering is total: summed usage, then vCPU count, then pCPU index. Both
/// implementations must hand out identical choices for identical inputs;
/// they differ only in how the minimum is found.
trait Picker {
    fn take_least_loaded(&mut self) -> PcpuDatum;
    fn restore(&mut self, datum: PcpuDatum);
    fn into_data(self: Box<Self>) -> Vec<PcpuDatum>;
}

struct LinearPicker {
    data: Vec<PcpuDatum>,
}

impl LinearPicker {
    fn new(pcpu_count: usize) -> Self {
        Self {
            data: (0..pcpu_count).map(PcpuDatum::idle).collect(),
        }
    }
}

impl Picker for LinearPicker {
    fn take_least_loaded(&mut self) -> PcpuDatum {
        *self
            .data
            .iter()
            .min_by_key(|datum| (datum.usage_ns, datum.vcpus, datum.pcpu))
            .expect("picker is never empty")
    }

    fn restore(&mut self, datum: PcpuDatum) {
        self.data[datum.pcpu] = datum;
    }

    fn into_data(self: Box<Self>) -> Vec<PcpuDatum> {
        self.data
    }
}

struct HeapPicker {
    heap: BinaryHeap<Reverse<(u64, usize, usize)>>,
}

impl HeapPicker {
    fn new(pcpu_count: usize) -> Self {
        Self {
            heap: (0..pcpu_count).map(|pcpu| Reverse((0, 0, pcpu))).collect(),
        }
    }
}

impl Picker for HeapPicker {
    fn take_least_loaded(&mut self) -> PcpuDatum {
        let Reverse((usage_ns, vcpus, pcpu)) = self.heap.pop().expect("picker is never empty");
        PcpuDatum {
            pcpu,
            usage_ns,
            vcpus,
        }
    }

    fn restore(&mut self, datum: PcpuDatum) {
        self.heap
            .push(Reverse((datum.usage_ns, datum.vcpus, datum.pcpu)));
    }

    fn into_data(self: Box<Self>) -> Vec<PcpuDatum> {
        self.heap
            .into_iter()
            .map(|Reverse((usage_ns, vcpus, pcpu))| PcpuDatum {
                pcpu,
                usage_ns,
                vcpus,
            })
            .collect()
    }
}

/// Greedily place each vCPU (heaviest first) on the least-loaded predicted
/// pCPU, recording the choice in `target_pcpu`. Returns the predicted pCPU
/// data in index order.
fn predict<D>(vcpus: &mut [VcpuDatum<D>], pcpu_count: usize) -> Vec<PcpuDatum> {
    let mut picker: Box<dyn Picker> = if pcpu_count > CPU_HEAP_THRESHOLD {
        Box::new(HeapPicker::new(pcpu_count))
    } else {
        Box::new(LinearPicker::new(pcpu_count))
    };

    for vcpu in vcpus.iter_mut() {
        let mut choice = picker.take_least_loaded();
        choice.usage_ns += vcpu.delta_ns;
        choice.vcpus += 1;
        vcpu.target_pcpu = choice.pcpu;
        picker.restore(choice);
    }

    let mut data = picker.into_data();
    data.sort_by_key(|datum| datum.pcpu);
    data
}

fn usage_column(data: &[PcpuDatum]) -> Vec<u64> {
    data.iter().map(|datum| datum.usage_ns).collect()
}

/// Decide whether the predicted pinning is worth committing.
fn favorable(current: &[PcpuDatum], predicted: &[PcpuDatum]) -> bool {
    let current_dispersion = stats::dispersion(&usage_column(current));
    let predicted_dispersion = stats::dispersion(&usage_column(predicted));

    current_dispersion > DISPERSION_UPPER_BOUND && predicted_dispersion <= DISPERSION_LOWER_BOUND
}

/// Run one scheduling pass over this tick's data.
///
/// Empty input on either side is a terminating error for the tick. A pin
/// failure during commit is flagged and the sweep continues; nothing is
/// retried within the tick.
pub fn schedule<D: DomainHandle>(
    vcpus: &mut Vec<VcpuDatum<D>>,
    current_pcpus: &[PcpuDatum],
) -> Result<Outcome, TickError> {
    if vcpus.is_empty() {
        return Err(TickError::EmptyInput("vCPU data"));
    }
    if current_pcpus.is_empty() {
        return Err(TickError::EmptyInput("pCPU data"));
    }

    // Heaviest vCPUs place first so the big movers land on idle pCPUs.
    vcpus.sort_by(|a, b| b.delta_ns.cmp(&a.delta_ns));

    let predicted = predict(vcpus, current_pcpus.len());

    if !favorable(current_pcpus, &predicted) {
        return Ok(Outcome {
            committed: false,
            pins_issued: 0,
            pin_failures: 0,
        });
    }

    let mut pins_issued = 0;
    let mut pin_failures = 0;
    for vcpu in vcpus.iter() {
        if vcpu.target_pcpu == vcpu.current_pcpu {
            continue;
        }
        match vcpu
            .domain
            .pin_vcpu(vcpu.vcpu, vcpu.target_pcpu, current_pcpus.len())
        {
            Ok(()) => pins_issued += 1,
            Err(err) => {
                pin_failures += 1;
                record(
                    Severity::Flag,
                    format!(
                        "unable to repin vCPU {} of domain {}: {err}; continuing sweep",
                        vcpu.vcpu, vcpu.uuid
                    ),
                );
            }
        }
    }

    Ok(Outcome {
        committed: true,
        pins_issued,
        pin_failures,
    })
}
