//! Per-tick vCPU snapshot collection.

use std::collections::BTreeMap;

use virtbal_core::driver::TickError;
use virtbal_core::telemetry::{record, Severity};
use virtbal_gateway::{DomainHandle, Hypervisor, VcpuInfo};

/// Mapping from domain UUID to its vCPU info records, ordered by vCPU index.
pub type VcpuTable = BTreeMap<String, Vec<VcpuInfo>>;

/// One tick's view of the host: the vCPU table and the live handle for
/// every domain that made it into the table.
pub struct Snapshot<D> {
    pub table: VcpuTable,
    pub handles: BTreeMap<String, D>,
}

/// Snapshot every active, running domain.
///
/// Domains without a retrievable UUID are flagged and skipped. Domains
/// reporting no vCPUs are noted and skipped; that is not an error. A failed
/// vCPU info read is logged and the domain's entry is still inserted with
/// whatever was retrieved (an empty list), so the delta stage sees the
/// inconsistency instead of silently losing the domain.
pub fn collect<H: Hypervisor>(hypervisor: &H) -> Result<Snapshot<H::Domain>, TickError> {
    let domains = hypervisor.list_running_domains()?;

    let mut table = VcpuTable::new();
    let mut handles = BTreeMap::new();

    for domain in domains {
        let uuid = match domain.uuid() {
            Ok(uuid) => uuid,
            Err(err) => {
                record(Severity::Flag, format!("domain skipped, no UUID: {err}"));
                continue;
            }
        };

        let vcpu_max = match domain.vcpu_max() {
            Ok(count) => count,
            Err(err) => {
                record(
                    Severity::Flag,
                    format!("domain {uuid} has no usable vCPUs: {err}"),
                );
                continue;
            }
        };

        let vcpus = match domain.vcpu_info(vcpu_max) {
            Ok(vcpus) => vcpus,
            Err(err) => {
                record(
                    Severity::Error,
                    format!("unable to read vCPU info for domain {uuid}: {err}"),
                );
                Vec::new()
            }
        };

        table.insert(uuid.clone(), vcpus);
        handles.insert(uuid, domain);
    }

    Ok(Snapshot { table, handles })
}
