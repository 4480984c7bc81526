//! Hypervisor gateway for the virtbal daemons.
//!
//! The balancers never talk to libvirt directly; they go through the two
//! traits defined here:
//!
//! - [`Hypervisor`]: node-level queries and the domain listing.
//! - [`DomainHandle`]: per-domain queries and commits. A handle owns the
//!   underlying domain reference and releases it on drop.
//!
//! Two backends exist. The `libvirt` feature provides `LibvirtHypervisor`
//! over the real control plane (KiB/byte conversion is confined there); the
//! `fake` feature provides `FakeHypervisor`, an in-memory host model used
//! by the service test suites.

mod error;

#[cfg(feature = "fake")]
pub mod fake;
#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use error::GatewayError;

/// Connection URI for the local system hypervisor.
pub const QEMU_SYSTEM_URI: &str = "qemu:///system";

/// Memory statistic tag for the balloon's current allocation
/// (`VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON`).
pub const TAG_ACTUAL_BALLOON: u32 = 6;

/// Memory statistic tag for memory left unused by the guest
/// (`VIR_DOMAIN_MEMORY_STAT_UNUSED`).
pub const TAG_UNUSED: u32 = 4;

/// State of one vCPU of one domain at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuInfo {
    /// vCPU index within the domain.
    pub vcpu: u32,

    /// pCPU the vCPU is currently pinned (or scheduled) to.
    pub pcpu: u32,

    /// Cumulative CPU time consumed, in nanoseconds. Monotone
    /// non-decreasing for the lifetime of the vCPU.
    pub usage_ns: u64,
}

/// Static domain facts needed by the memory balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    /// Configured maximum memory, in bytes.
    pub memory_limit_bytes: i64,

    /// Number of vCPUs assigned to the domain.
    pub vcpus: u64,
}

/// One tagged memory statistic reported by the balloon driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStat {
    pub tag: u32,
    pub bytes: i64,
}

/// Node-level view of the hypervisor.
pub trait Hypervisor {
    type Domain: DomainHandle;

    /// List domains that are both active and running. Each returned handle
    /// is the single live handle for its domain until dropped.
    fn list_running_domains(&self) -> Result<Vec<Self::Domain>, GatewayError>;

    /// Number of pCPUs on the host, at least one.
    fn pcpu_count(&self) -> Result<usize, GatewayError>;

    /// Total host memory, in bytes.
    fn total_memory_bytes(&self) -> Result<i64, GatewayError>;
}

/// Owning reference to one live domain.
pub trait DomainHandle {
    fn uuid(&self) -> Result<String, GatewayError>;

    /// Maximum vCPU count; an underlying report below one is an error.
    fn vcpu_max(&self) -> Result<usize, GatewayError>;

    /// Per-vCPU state for the first `count` vCPUs.
    fn vcpu_info(&self, count: usize) -> Result<Vec<VcpuInfo>, GatewayError>;

    /// Pin one vCPU to exactly one pCPU.
    fn pin_vcpu(&self, vcpu: u32, pcpu: usize, pcpu_total: usize) -> Result<(), GatewayError>;

    fn info(&self) -> Result<DomainInfo, GatewayError>;

    fn memory_stats(&self) -> Result<Vec<MemStat>, GatewayError>;

    /// Enable or refresh periodic balloon statistics collection.
    /// `seconds` must be at least one.
    fn set_memory_stats_period(&self, seconds: u64) -> Result<(), GatewayError>;

    /// Set the domain's current memory allotment, in bytes.
    fn set_memory(&self, bytes: i64) -> Result<(), GatewayError>;
}

/// Encode a single-pCPU pin bitmap.
///
/// The bitmap is `ceil(pcpu_total / 8)` bytes with only bit `pcpu` set
/// (byte `pcpu / 8`, bit `pcpu % 8`). The length is never derived from a
/// zero count: `pcpu_total == 0` and out-of-range indices are rejected.
pub fn pin_bitmap(pcpu: usize, pcpu_total: usize) -> Result<Vec<u8>, GatewayError> {
    if pcpu_total == 0 {
        return Err(GatewayError::ZeroPcpuCount);
    }
    if pcpu >= pcpu_total {
        return Err(GatewayError::PcpuOutOfRange {
            pcpu,
            total: pcpu_total,
        });
    }

    let mut bitmap = vec![0u8; pcpu_total.div_ceil(8)];
    bitmap[pcpu / 8] |= 1 << (pcpu % 8);
    Ok(bitmap)
}

/// Decode the set of pCPU indices present in a pin bitmap.
pub fn decode_bitmap(bitmap: &[u8]) -> Vec<usize> {
    let mut set = Vec::new();
    for (byte_index, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                set.push(byte_index * 8 + bit);
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_sets_exactly_the_requested_bit() {
        for total in 1..=70usize {
            for rank in 0..total {
                let bitmap = pin_bitmap(rank, total).unwrap();
                assert_eq!(bitmap.len(), total.div_ceil(8));
                assert_eq!(decode_bitmap(&bitmap), vec![rank], "rank {rank} of {total}");
            }
        }
    }

    #[test]
    fn bitmap_rejects_zero_pcpu_count() {
        assert!(matches!(
            pin_bitmap(0, 0),
            Err(GatewayError::ZeroPcpuCount)
        ));
    }

    #[test]
    fn bitmap_rejects_out_of_range_index() {
        assert!(matches!(
            pin_bitmap(8, 8),
            Err(GatewayError::PcpuOutOfRange { pcpu: 8, total: 8 })
        ));
    }
}
