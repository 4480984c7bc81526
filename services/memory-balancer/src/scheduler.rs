//! Supplier/demander memory redistribution.
//!
//! Domains with plenty of unused balloon memory supply a fixed step back to
//! the host; domains running low demand one. Reclaim happens first so the
//! freed memory is part of the budget that provisioning hands out. The
//! running `available` counter must never go negative: the host reserve is
//! subtracted up front and every commit is feasibility-checked against the
//! counter before it is issued.

use virtbal_core::driver::TickError;
use virtbal_core::telemetry::{record, Severity};
use virtbal_gateway::DomainHandle;

use crate::collect::DomainDatum;

/// Memory the host keeps for itself, in bytes.
pub const MINIMUM_SYSTEM_MEMORY: i64 = 200 * 1024;

/// Floor for any domain's allotment, in bytes.
pub const MINIMUM_DOMAIN_MEMORY: i64 = 100 * 1024;

/// A domain with more than this fraction of its limit unused can supply.
pub const SUPPLY_COEFFICIENT: f64 = 0.115;

/// A domain with less than this fraction of its limit unused demands more.
pub const DEMAND_COEFFICIENT: f64 = 0.085;

/// Fraction of the domain floor moved per tick.
pub const CHANGE_COEFFICIENT: f64 = 0.200;

/// The per-tick adjustment quantum, in bytes.
pub const STEP: i64 = (MINIMUM_DOMAIN_MEMORY as f64 * CHANGE_COEFFICIENT) as i64;

/// What one scheduling pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub suppliers: usize,
    pub demanders: usize,
    pub reclaimed: usize,
    pub provisioned: usize,
}

impl Outcome {
    pub fn commits(&self) -> usize {
        self.reclaimed + self.provisioned
    }
}

/// Run one redistribution pass.
///
/// `domains` must arrive in a fixed order (the collector sorts by UUID):
/// the budget subtraction below consumes it in encounter order, so the
/// order is part of the algorithm's determinism.
pub fn schedule<D: DomainHandle>(
    domains: Vec<DomainDatum<D>>,
    system_memory_limit: i64,
) -> Result<Outcome, TickError> {
    if domains.is_empty() {
        return Err(TickError::EmptyInput("domain memory data"));
    }

    let mut outcome = Outcome::default();
    let mut available = system_memory_limit - MINIMUM_SYSTEM_MEMORY;

    // Classify; domains in neither class drop out here and their handles
    // release with them.
    let mut suppliers = Vec::new();
    let mut demanders = Vec::new();
    for mut datum in domains {
        available -= datum.balloon_bytes;
        if available < 0 {
            return Err(TickError::Corrupt(format!(
                "domain balloon allocations exceed the host budget at domain {}",
                datum.uuid
            )));
        }

        let limit = datum.limit_bytes as f64;
        let unused = datum.unused_bytes as f64;
        if unused > SUPPLY_COEFFICIENT * limit {
            datum.delta_bytes = -STEP;
            suppliers.push(datum);
        } else if unused < DEMAND_COEFFICIENT * limit {
            datum.delta_bytes = STEP;
            demanders.push(datum);
        }
    }
    outcome.suppliers = suppliers.len();
    outcome.demanders = demanders.len();

    // Reclaim from suppliers; a failed commit skips the domain and leaves
    // the budget untouched.
    for datum in &suppliers {
        let target = (datum.balloon_bytes + datum.delta_bytes).max(MINIMUM_DOMAIN_MEMORY);

        let resultant = available - target + datum.balloon_bytes;
        if resultant < 0 {
            return Err(TickError::Corrupt(format!(
                "reclaim from domain {} would overdraw the host budget",
                datum.uuid
            )));
        }

        match datum.domain.set_memory(target) {
            Ok(()) => {
                available = resultant;
                outcome.reclaimed += 1;
            }
            Err(err) => {
                record(
                    Severity::Flag,
                    format!(
                        "unable to set domain {} memory to {target} bytes: {err}",
                        datum.uuid
                    ),
                );
            }
        }
    }

    // Serve the domains with the highest per-vCPU pressure first. The sort
    // is stable: equal pressures keep their encounter order.
    demanders.sort_by(|a, b| {
        let pressure_a = a.delta_bytes as f64 / a.vcpus.max(1) as f64;
        let pressure_b = b.delta_bytes as f64 / b.vcpus.max(1) as f64;
        pressure_b
            .partial_cmp(&pressure_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut requesters_remaining = demanders.len() as i64;
    for datum in &demanders {
        let max_target = datum.limit_bytes;

        // The full step fits inside the remaining budget.
        if datum.delta_bytes.abs() < available {
            let target = (datum.balloon_bytes + datum.delta_bytes).min(max_target);

            let resultant = available - target + datum.balloon_bytes;
            if resultant < 0 || target < 0 {
                return Err(TickError::Corrupt(format!(
                    "provision of domain {} would overdraw the host budget",
                    datum.uuid
                )));
            }

            match datum.domain.set_memory(target) {
                Ok(()) => {
                    available = resultant;
                    outcome.provisioned += 1;
                }
                Err(err) => {
                    record(
                        Severity::Flag,
                        format!(
                            "unable to set domain {} memory to {target} bytes: {err}",
                            datum.uuid
                        ),
                    );
                    continue;
                }
            }

            if requesters_remaining > 1 {
                requesters_remaining -= 1;
            }
            continue;
        }

        // The budget is tight: split what is left evenly across the
        // requesters still waiting. The partition is recomputed from the
        // current budget every iteration.
        let partition = div_ceil(available, requesters_remaining.max(1));
        if requesters_remaining > 0 && partition < available {
            let target =
                (datum.balloon_bytes + datum.delta_bytes / requesters_remaining).min(max_target);

            let resultant = available - target + datum.balloon_bytes;
            if resultant < 0 || target < 0 {
                return Err(TickError::Corrupt(format!(
                    "partitioned provision of domain {} would overdraw the host budget",
                    datum.uuid
                )));
            }

            // Unlike the full-step path, the partition path is the last
            // resort; a commit failure here invalidates the tick.
            datum.domain.set_memory(target).map_err(|err| {
                record(
                    Severity::Error,
                    format!(
                        "unable to set domain {} memory to {target} bytes: {err}",
                        datum.uuid
                    ),
                );
                TickError::Gateway(err)
            })?;
            available = resultant;
            outcome.provisioned += 1;

            if requesters_remaining > 1 {
                requesters_remaining -= 1;
            }
        }
    }

    Ok(outcome)
}

fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use virtbal_gateway::fake::{FakeDomainSpec, FakeHypervisor};
    use virtbal_gateway::Hypervisor;

    use crate::collect;

    const MIB: i64 = 1 << 20;
    const GIB: i64 = 1 << 30;

    /// Collect datums for a host (sorted by UUID, like the pipeline does).
    fn datums(
        host: &FakeHypervisor,
    ) -> Vec<DomainDatum<<FakeHypervisor as Hypervisor>::Domain>> {
        let mut seen = BTreeSet::new();
        collect::collect(host, Duration::from_secs(1), &mut seen).unwrap()
    }

    #[test]
    fn step_is_a_fifth_of_the_domain_floor() {
        assert_eq!(STEP, 20480);
    }

    #[test]
    fn classification_splits_suppliers_demanders_and_dropped() {
        let host = FakeHypervisor::new(4, 16 * GIB);
        // unused 200 MiB > 11.5% of 1 GiB: supplier.
        host.add_domain(
            "dom-x",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 200 * MIB),
        );
        // unused 50 MiB < 8.5% of 1 GiB: demander.
        host.add_domain(
            "dom-y",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 50 * MIB),
        );
        // unused 100 MiB sits between the thresholds: dropped.
        host.add_domain(
            "dom-z",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 100 * MIB),
        );

        let outcome = schedule(datums(&host), 16 * GIB).unwrap();
        assert_eq!(outcome.suppliers, 1);
        assert_eq!(outcome.demanders, 1);
        assert_eq!(outcome.commits(), 2);

        let sets = host.memory_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0], ("dom-x".to_string(), GIB / 2 - STEP));
        assert_eq!(sets[1], ("dom-y".to_string(), GIB / 2 + STEP));
    }

    #[test]
    fn reclaim_never_goes_below_the_domain_floor() {
        let host = FakeHypervisor::new(4, 16 * GIB);
        // Supplier barely above the floor: balloon - STEP would undercut it.
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(MIB, MINIMUM_DOMAIN_MEMORY + 10_000, 200 * 1024),
        );

        schedule(datums(&host), 16 * GIB).unwrap();
        assert_eq!(
            host.memory_sets(),
            vec![("dom-a".to_string(), MINIMUM_DOMAIN_MEMORY)]
        );
    }

    #[test]
    fn provision_is_clamped_to_the_domain_limit() {
        let host = FakeHypervisor::new(4, 16 * GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB - 10_000, 10 * MIB),
        );

        schedule(datums(&host), 16 * GIB).unwrap();
        assert_eq!(host.memory_sets(), vec![("dom-a".to_string(), GIB)]);
    }

    #[test]
    fn demanders_are_served_by_per_vcpu_pressure() {
        let host = FakeHypervisor::new(8, 16 * GIB);
        // Same demand, different vCPU counts: fewer vCPUs means higher
        // per-vCPU pressure and earlier service.
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(4).memory(GIB, GIB / 2, 10 * MIB),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 10 * MIB),
        );

        schedule(datums(&host), 16 * GIB).unwrap();

        let sets = host.memory_sets();
        let order: Vec<&str> = sets.iter().map(|(uuid, _)| uuid.as_str()).collect();
        assert_eq!(order, vec!["dom-b", "dom-a"]);
    }

    #[test]
    fn equal_pressure_keeps_encounter_order() {
        let host = FakeHypervisor::new(8, 16 * GIB);
        for uuid in ["dom-a", "dom-b", "dom-c"] {
            host.add_domain(
                uuid,
                FakeDomainSpec::with_vcpus(2).memory(GIB, GIB / 2, 10 * MIB),
            );
        }

        schedule(datums(&host), 16 * GIB).unwrap();

        let sets = host.memory_sets();
        let order: Vec<&str> = sets.iter().map(|(uuid, _)| uuid.as_str()).collect();
        assert_eq!(order, vec!["dom-a", "dom-b", "dom-c"]);
    }

    #[test]
    fn tight_budget_partitions_the_remainder() {
        // Two demanders asking a full step each, but only 15 KiB of budget:
        // the first gets half a step, the refreshed partition no longer
        // fits for the second.
        let balloon = 500 * 1024;
        let system_limit = MINIMUM_SYSTEM_MEMORY + 2 * balloon + 15 * 1024;

        let host = FakeHypervisor::new(4, system_limit);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(MIB, balloon, 50_000),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(2).memory(MIB, balloon, 50_000),
        );

        let outcome = schedule(datums(&host), system_limit).unwrap();
        assert_eq!(outcome.demanders, 2);
        assert_eq!(outcome.provisioned, 1);
        assert_eq!(
            host.memory_sets(),
            vec![("dom-a".to_string(), balloon + STEP / 2)]
        );
    }

    #[test]
    fn overdrawn_host_budget_is_corruption() {
        let host = FakeHypervisor::new(4, GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 10 * MIB),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 10 * MIB),
        );

        // Balloons sum to the whole host; the reserve cannot fit.
        let result = schedule(datums(&host), GIB);
        assert!(matches!(result, Err(TickError::Corrupt(_))));
        assert!(host.memory_sets().is_empty());
    }

    #[test]
    fn failed_reclaim_is_flagged_and_skipped() {
        let host = FakeHypervisor::new(4, 16 * GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 200 * MIB),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 200 * MIB),
        );
        host.fail_set_memory("dom-a");

        let outcome = schedule(datums(&host), 16 * GIB).unwrap();
        assert_eq!(outcome.suppliers, 2);
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(
            host.memory_sets(),
            vec![("dom-b".to_string(), GIB / 2 - STEP)]
        );
    }

    #[test]
    fn failed_full_step_provision_is_recoverable() {
        let host = FakeHypervisor::new(4, 16 * GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 10 * MIB),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(2).memory(GIB, GIB / 2, 10 * MIB),
        );
        host.fail_set_memory("dom-a");

        let outcome = schedule(datums(&host), 16 * GIB).unwrap();
        assert_eq!(outcome.provisioned, 1);
        assert_eq!(
            host.memory_sets(),
            vec![("dom-b".to_string(), GIB / 2 + STEP)]
        );
    }

    #[test]
    fn failed_partition_provision_invalidates_the_tick() {
        let balloon = 500 * 1024;
        let system_limit = MINIMUM_SYSTEM_MEMORY + 2 * balloon + 15 * 1024;

        let host = FakeHypervisor::new(4, system_limit);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(MIB, balloon, 50_000),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(2).memory(MIB, balloon, 50_000),
        );
        host.fail_set_memory("dom-a");

        let result = schedule(datums(&host), system_limit);
        assert!(matches!(result, Err(TickError::Gateway(_))));
    }

    #[test]
    fn empty_domain_data_terminates_the_tick() {
        let domains: Vec<DomainDatum<<FakeHypervisor as Hypervisor>::Domain>> = Vec::new();
        assert!(matches!(
            schedule(domains, 16 * GIB),
            Err(TickError::EmptyInput(_))
        ));
    }

    #[test]
    fn committed_targets_respect_host_and_domain_bounds() {
        let host = FakeHypervisor::new(8, 16 * GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 2, 300 * MIB),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(2).memory(GIB, GIB / 2, 10 * MIB),
        );
        host.add_domain(
            "dom-c",
            FakeDomainSpec::with_vcpus(1).memory(2 * GIB, GIB, 20 * MIB),
        );

        schedule(datums(&host), 16 * GIB).unwrap();

        let sets = host.memory_sets();
        let total: i64 = sets.iter().map(|(_, bytes)| bytes).sum();
        assert!(total + MINIMUM_SYSTEM_MEMORY <= 16 * GIB);
        for (uuid, bytes) in &sets {
            let limit = match uuid.as_str() {
                "dom-c" => 2 * GIB,
                _ => GIB,
            };
            assert!(*bytes >= MINIMUM_DOMAIN_MEMORY, "{uuid} under the floor");
            assert!(*bytes <= limit, "{uuid} over its limit");
        }
    }
}
