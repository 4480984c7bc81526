//! Per-tick balloon statistics collection.

use std::collections::BTreeSet;
use std::time::Duration;

use virtbal_core::driver::TickError;
use virtbal_core::telemetry::{record, Severity};
use virtbal_gateway::{DomainHandle, Hypervisor, TAG_ACTUAL_BALLOON, TAG_UNUSED};

/// Everything the memory scheduler needs to know about one domain.
///
/// The datum owns the domain's live handle; it is released when the datum
/// drops at the end of scheduling.
pub struct DomainDatum<D> {
    pub uuid: String,
    pub domain: D,
    pub vcpus: u64,
    pub balloon_bytes: i64,
    pub unused_bytes: i64,
    pub limit_bytes: i64,

    /// Adjustment proposed by classification; zero until then.
    pub delta_bytes: i64,
}

/// Collect a datum for every active, running domain, sorted by UUID.
///
/// Domains never seen before get their balloon statistics collection period
/// programmed to the tick interval (whole seconds, at least one); domains
/// already seen are left alone. `seen` is then replaced with the current
/// tick's UUID set.
///
/// The balloon-actual and unused statistics are required: a domain that
/// does not report both leaves the scheduler unable to classify it safely,
/// which invalidates the whole tick.
pub fn collect<H: Hypervisor>(
    hypervisor: &H,
    interval: Duration,
    seen: &mut BTreeSet<String>,
) -> Result<Vec<DomainDatum<H::Domain>>, TickError> {
    let domains = hypervisor.list_running_domains()?;

    // Sorted map so classification consumes the budget in a fixed order.
    let mut by_uuid = std::collections::BTreeMap::new();
    for domain in domains {
        match domain.uuid() {
            Ok(uuid) => {
                by_uuid.insert(uuid, domain);
            }
            Err(err) => {
                record(Severity::Flag, format!("domain skipped, no UUID: {err}"));
            }
        }
    }

    let period_secs = interval.as_secs().max(1);
    for (uuid, domain) in &by_uuid {
        if seen.contains(uuid) {
            continue;
        }
        if let Err(err) = domain.set_memory_stats_period(period_secs) {
            record(
                Severity::Flag,
                format!("unable to set statistics period for domain {uuid}: {err}"),
            );
        }
    }
    *seen = by_uuid.keys().cloned().collect();

    let mut data = Vec::with_capacity(by_uuid.len());
    for (uuid, domain) in by_uuid {
        let info = domain.info()?;

        let stats = match domain.memory_stats() {
            Ok(stats) => stats,
            Err(err) => {
                record(
                    Severity::Flag,
                    format!("unable to read memory statistics for domain {uuid}: {err}"),
                );
                Vec::new()
            }
        };

        let mut balloon_bytes = None;
        let mut unused_bytes = None;
        for stat in stats {
            match stat.tag {
                TAG_ACTUAL_BALLOON => balloon_bytes = Some(stat.bytes),
                TAG_UNUSED => unused_bytes = Some(stat.bytes),
                _ => {}
            }
        }

        let Some(balloon_bytes) = balloon_bytes else {
            return Err(TickError::Corrupt(format!(
                "domain {uuid} reports no balloon allocation statistic"
            )));
        };
        let Some(unused_bytes) = unused_bytes else {
            return Err(TickError::Corrupt(format!(
                "domain {uuid} reports no unused memory statistic"
            )));
        };

        data.push(DomainDatum {
            uuid,
            domain,
            vcpus: info.vcpus,
            balloon_bytes,
            unused_bytes,
            limit_bytes: info.memory_limit_bytes,
            delta_bytes: 0,
        });
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtbal_gateway::fake::{FakeDomainSpec, FakeHypervisor};

    const GIB: i64 = 1 << 30;

    fn host() -> FakeHypervisor {
        let host = FakeHypervisor::new(4, 8 * GIB);
        host.add_domain(
            "dom-a",
            FakeDomainSpec::with_vcpus(2).memory(GIB, GIB / 2, 200 << 20),
        );
        host.add_domain(
            "dom-b",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 4, 50 << 20),
        );
        host
    }

    #[test]
    fn data_is_sorted_by_uuid_and_complete() {
        let mut seen = BTreeSet::new();
        let data = collect(&host(), Duration::from_millis(2500), &mut seen).unwrap();

        let uuids: Vec<&str> = data.iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["dom-a", "dom-b"]);
        assert_eq!(data[0].balloon_bytes, GIB / 2);
        assert_eq!(data[0].unused_bytes, 200 << 20);
        assert_eq!(data[0].limit_bytes, GIB);
        assert_eq!(data[0].vcpus, 2);
        assert_eq!(data[0].delta_bytes, 0);
    }

    #[test]
    fn stats_period_is_programmed_once_per_domain() {
        let host = host();
        let mut seen = BTreeSet::new();

        collect(&host, Duration::from_millis(2500), &mut seen).unwrap();
        assert_eq!(
            host.stats_periods(),
            vec![("dom-a".to_string(), 2), ("dom-b".to_string(), 2)]
        );
        assert_eq!(seen.len(), 2);

        // Second tick: both domains already seen, nothing reprogrammed.
        collect(&host, Duration::from_millis(2500), &mut seen).unwrap();
        assert_eq!(host.stats_periods().len(), 2);
    }

    #[test]
    fn sub_second_interval_still_programs_one_second() {
        let host = host();
        let mut seen = BTreeSet::new();

        collect(&host, Duration::from_millis(200), &mut seen).unwrap();
        assert!(host.stats_periods().iter().all(|(_, secs)| *secs == 1));
    }

    #[test]
    fn newly_appeared_domain_is_programmed_on_its_first_tick() {
        let host = host();
        let mut seen = BTreeSet::new();
        collect(&host, Duration::from_secs(1), &mut seen).unwrap();

        host.add_domain(
            "dom-c",
            FakeDomainSpec::with_vcpus(1).memory(GIB, GIB / 4, 10 << 20),
        );
        collect(&host, Duration::from_secs(1), &mut seen).unwrap();

        let periods = host.stats_periods();
        let programmed: Vec<&str> = periods.iter().map(|(uuid, _)| uuid.as_str()).collect();
        assert_eq!(programmed, vec!["dom-a", "dom-b", "dom-c"]);
        assert!(seen.contains("dom-c"));
    }

    #[test]
    fn departed_domain_is_forgotten() {
        let host = host();
        let mut seen = BTreeSet::new();
        collect(&host, Duration::from_secs(1), &mut seen).unwrap();

        host.remove_domain("dom-b");
        collect(&host, Duration::from_secs(1), &mut seen).unwrap();
        assert!(!seen.contains("dom-b"));
    }

    #[test]
    fn missing_required_statistic_invalidates_the_tick() {
        let host = host();
        host.omit_memory_tags("dom-a");
        let mut seen = BTreeSet::new();

        let result = collect(&host, Duration::from_secs(1), &mut seen);
        assert!(matches!(result, Err(TickError::Corrupt(_))));
    }

    #[test]
    fn stats_period_failure_is_flagged_not_fatal() {
        let host = host();
        host.fail_stats_period("dom-a");
        let mut seen = BTreeSet::new();

        let data = collect(&host, Duration::from_secs(1), &mut seen).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(host.stats_periods(), vec![("dom-b".to_string(), 1)]);
    }
}
