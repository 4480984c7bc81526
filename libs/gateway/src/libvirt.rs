//! Real hypervisor backend over the `virt` crate.
//!
//! This is the only module that speaks libvirt's units: its memory APIs are
//! in KiB, so every value is converted at this edge and the rest of the
//! workspace deals in bytes.

use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::{
    DomainHandle, DomainInfo, GatewayError, Hypervisor, MemStat, VcpuInfo,
};

const KIB: i64 = 1024;

/// Owning connection to the local hypervisor.
pub struct LibvirtHypervisor {
    conn: Connect,
}

impl LibvirtHypervisor {
    /// Open a connection to `uri`, typically [`crate::QEMU_SYSTEM_URI`].
    pub fn open(uri: &str) -> Result<Self, GatewayError> {
        let conn = Connect::open(Some(uri)).map_err(|err| GatewayError::Connect {
            uri: uri.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Self { conn })
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        let _ = self.conn.close();
    }
}

impl Hypervisor for LibvirtHypervisor {
    type Domain = LibvirtDomain;

    fn list_running_domains(&self) -> Result<Vec<LibvirtDomain>, GatewayError> {
        let domains = self
            .conn
            .list_all_domains(
                sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_RUNNING,
            )
            .map_err(|err| GatewayError::call("virConnectListAllDomains", err))?;
        Ok(domains.into_iter().map(LibvirtDomain).collect())
    }

    fn pcpu_count(&self) -> Result<usize, GatewayError> {
        let node = self
            .conn
            .get_node_info()
            .map_err(|err| GatewayError::call("virNodeGetInfo", err))?;
        Ok(node.cpus as usize)
    }

    fn total_memory_bytes(&self) -> Result<i64, GatewayError> {
        let node = self
            .conn
            .get_node_info()
            .map_err(|err| GatewayError::call("virNodeGetInfo", err))?;
        Ok(node.memory as i64 * KIB)
    }
}

/// Owning reference to one live libvirt domain; freed on drop by the
/// underlying binding.
pub struct LibvirtDomain(Domain);

impl DomainHandle for LibvirtDomain {
    fn uuid(&self) -> Result<String, GatewayError> {
        self.0
            .get_uuid_string()
            .map_err(|err| GatewayError::call("virDomainGetUUIDString", err))
    }

    fn vcpu_max(&self) -> Result<usize, GatewayError> {
        let count = self
            .0
            .get_max_vcpus()
            .map_err(|err| GatewayError::call("virDomainGetMaxVcpus", err))?;
        if count < 1 {
            return Err(GatewayError::NoVcpus(count as i64));
        }
        Ok(count as usize)
    }

    fn vcpu_info(&self, count: usize) -> Result<Vec<VcpuInfo>, GatewayError> {
        let vcpus = self
            .0
            .get_vcpus()
            .map_err(|err| GatewayError::call("virDomainGetVcpus", err))?;
        Ok(vcpus
            .into_iter()
            .take(count)
            .map(|vcpu| VcpuInfo {
                vcpu: vcpu.number,
                pcpu: vcpu.cpu as u32,
                usage_ns: vcpu.cpu_time,
            })
            .collect())
    }

    fn pin_vcpu(&self, vcpu: u32, pcpu: usize, pcpu_total: usize) -> Result<(), GatewayError> {
        let bitmap = crate::pin_bitmap(pcpu, pcpu_total)?;
        self.0
            .pin_vcpu(vcpu, &bitmap)
            .map_err(|err| GatewayError::call("virDomainPinVcpu", err))
    }

    fn info(&self) -> Result<DomainInfo, GatewayError> {
        let info = self
            .0
            .get_info()
            .map_err(|err| GatewayError::call("virDomainGetInfo", err))?;
        Ok(DomainInfo {
            memory_limit_bytes: info.max_mem as i64 * KIB,
            vcpus: info.nr_virt_cpu as u64,
        })
    }

    fn memory_stats(&self) -> Result<Vec<MemStat>, GatewayError> {
        let stats = self
            .0
            .memory_stats(0)
            .map_err(|err| GatewayError::call("virDomainMemoryStats", err))?;
        Ok(stats
            .into_iter()
            .map(|stat| MemStat {
                tag: stat.tag as u32,
                bytes: stat.val as i64 * KIB,
            })
            .collect())
    }

    fn set_memory_stats_period(&self, seconds: u64) -> Result<(), GatewayError> {
        self.0
            .set_memory_stats_period(seconds as i32, sys::VIR_DOMAIN_AFFECT_CURRENT)
            .map_err(|err| GatewayError::call("virDomainSetMemoryStatsPeriod", err))
    }

    fn set_memory(&self, bytes: i64) -> Result<(), GatewayError> {
        self.0
            .set_memory((bytes / KIB) as u64)
            .map_err(|err| GatewayError::call("virDomainSetMemory", err))
    }
}
