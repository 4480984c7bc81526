//! In-memory hypervisor for tests.
//!
//! Models a host with a fixed pCPU count, a total memory size, and a set of
//! domains with per-vCPU usage counters and balloon statistics. Commits
//! (pins, memory sets, stats periods) are recorded and applied to the model
//! so multi-tick tests observe their own effects. Individual calls can be
//! scripted to fail per domain.
//!
//! The model also counts live handles per domain so tests can assert the
//! one-handle-per-domain discipline the balancers are expected to keep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    decode_bitmap, pin_bitmap, DomainHandle, DomainInfo, GatewayError, Hypervisor, MemStat,
    VcpuInfo, TAG_ACTUAL_BALLOON, TAG_UNUSED,
};

/// One modeled vCPU: its current pin and cumulative usage counter.
#[derive(Debug, Clone, Copy)]
pub struct FakeVcpu {
    pub pinned: u32,
    pub usage_ns: u64,
}

/// Modeled per-domain state.
#[derive(Debug, Clone, Default)]
pub struct FakeDomainSpec {
    pub vcpus: Vec<FakeVcpu>,
    pub memory_limit_bytes: i64,
    pub balloon_bytes: i64,
    pub unused_bytes: i64,
}

impl FakeDomainSpec {
    /// Domain with `vcpus` vCPUs, all pinned to pCPU 0 with zero usage.
    pub fn with_vcpus(vcpus: usize) -> Self {
        Self {
            vcpus: vec![
                FakeVcpu {
                    pinned: 0,
                    usage_ns: 0,
                };
                vcpus
            ],
            ..Self::default()
        }
    }

    pub fn memory(mut self, limit: i64, balloon: i64, unused: i64) -> Self {
        self.memory_limit_bytes = limit;
        self.balloon_bytes = balloon;
        self.unused_bytes = unused;
        self
    }
}

#[derive(Debug, Default)]
struct Faults {
    list_domains: bool,
    uuid: BTreeSet<String>,
    vcpu_info: BTreeSet<String>,
    pin: BTreeSet<String>,
    set_memory: BTreeSet<String>,
    stats_period: BTreeSet<String>,
    omit_memory_tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct HostState {
    pcpus: usize,
    total_memory_bytes: i64,
    domains: BTreeMap<String, FakeDomainSpec>,
    live_handles: BTreeMap<String, usize>,
    peak_live_handles: BTreeMap<String, usize>,
    pins: Vec<(String, u32, usize)>,
    memory_sets: Vec<(String, i64)>,
    stats_periods: Vec<(String, u64)>,
    faults: Faults,
}

/// Shared in-memory host model.
#[derive(Clone)]
pub struct FakeHypervisor {
    state: Arc<Mutex<HostState>>,
}

impl FakeHypervisor {
    pub fn new(pcpus: usize, total_memory_bytes: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                pcpus,
                total_memory_bytes,
                ..HostState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host lock poisoned")
    }

    pub fn add_domain(&self, uuid: &str, spec: FakeDomainSpec) {
        self.lock().domains.insert(uuid.to_string(), spec);
    }

    pub fn remove_domain(&self, uuid: &str) {
        self.lock().domains.remove(uuid);
    }

    /// Advance one vCPU's cumulative usage counter.
    pub fn bump_usage(&self, uuid: &str, vcpu: usize, delta_ns: u64) {
        let mut state = self.lock();
        let spec = state.domains.get_mut(uuid).expect("unknown domain");
        spec.vcpus[vcpu].usage_ns += delta_ns;
    }

    pub fn set_unused(&self, uuid: &str, bytes: i64) {
        self.lock().domains.get_mut(uuid).expect("unknown domain").unused_bytes = bytes;
    }

    pub fn set_vcpu_count(&self, uuid: &str, vcpus: usize) {
        let mut state = self.lock();
        let spec = state.domains.get_mut(uuid).expect("unknown domain");
        spec.vcpus.resize(
            vcpus,
            FakeVcpu {
                pinned: 0,
                usage_ns: 0,
            },
        );
    }

    pub fn fail_list_domains(&self, fail: bool) {
        self.lock().faults.list_domains = fail;
    }

    pub fn fail_uuid(&self, uuid: &str) {
        self.lock().faults.uuid.insert(uuid.to_string());
    }

    pub fn fail_vcpu_info(&self, uuid: &str) {
        self.lock().faults.vcpu_info.insert(uuid.to_string());
    }

    pub fn fail_pin(&self, uuid: &str) {
        self.lock().faults.pin.insert(uuid.to_string());
    }

    pub fn fail_set_memory(&self, uuid: &str) {
        self.lock().faults.set_memory.insert(uuid.to_string());
    }

    pub fn fail_stats_period(&self, uuid: &str) {
        self.lock().faults.stats_period.insert(uuid.to_string());
    }

    /// Make `memory_stats` omit the balloon and unused tags for a domain.
    pub fn omit_memory_tags(&self, uuid: &str) {
        self.lock().faults.omit_memory_tags.insert(uuid.to_string());
    }

    /// Pins committed so far, as `(uuid, vcpu, pcpu)` in commit order.
    pub fn pins(&self) -> Vec<(String, u32, usize)> {
        self.lock().pins.clone()
    }

    /// Memory allotments committed so far, as `(uuid, bytes)` in commit order.
    pub fn memory_sets(&self) -> Vec<(String, i64)> {
        self.lock().memory_sets.clone()
    }

    /// Stats-period commits so far, as `(uuid, seconds)` in commit order.
    pub fn stats_periods(&self) -> Vec<(String, u64)> {
        self.lock().stats_periods.clone()
    }

    pub fn pinned_pcpu(&self, uuid: &str, vcpu: usize) -> u32 {
        self.lock().domains[uuid].vcpus[vcpu].pinned
    }

    pub fn balloon_bytes(&self, uuid: &str) -> i64 {
        self.lock().domains[uuid].balloon_bytes
    }

    /// Highest number of simultaneously live handles observed for a domain.
    pub fn peak_live_handles(&self, uuid: &str) -> usize {
        self.lock().peak_live_handles.get(uuid).copied().unwrap_or(0)
    }
}

impl Hypervisor for FakeHypervisor {
    type Domain = FakeDomain;

    fn list_running_domains(&self) -> Result<Vec<FakeDomain>, GatewayError> {
        let mut state = self.lock();
        if state.faults.list_domains {
            return Err(GatewayError::call("virConnectListAllDomains", "injected"));
        }

        let uuids: Vec<String> = state.domains.keys().cloned().collect();
        for uuid in &uuids {
            let live = state.live_handles.entry(uuid.clone()).or_insert(0);
            *live += 1;
            let live = *live;
            let peak = state.peak_live_handles.entry(uuid.clone()).or_insert(0);
            *peak = (*peak).max(live);
        }
        drop(state);

        Ok(uuids
            .into_iter()
            .map(|uuid| FakeDomain {
                uuid,
                state: Arc::clone(&self.state),
            })
            .collect())
    }

    fn pcpu_count(&self) -> Result<usize, GatewayError> {
        Ok(self.lock().pcpus)
    }

    fn total_memory_bytes(&self) -> Result<i64, GatewayError> {
        Ok(self.lock().total_memory_bytes)
    }
}

/// Handle to one modeled domain; decrements the live-handle count on drop.
pub struct FakeDomain {
    uuid: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeDomain {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host lock poisoned")
    }
}

impl Drop for FakeDomain {
    fn drop(&mut self) {
        let mut state = self.lock();
        if let Some(live) = state.live_handles.get_mut(&self.uuid) {
            *live = live.saturating_sub(1);
        }
    }
}

impl DomainHandle for FakeDomain {
    fn uuid(&self) -> Result<String, GatewayError> {
        let state = self.lock();
        if state.faults.uuid.contains(&self.uuid) {
            return Err(GatewayError::call("virDomainGetUUIDString", "injected"));
        }
        Ok(self.uuid.clone())
    }

    fn vcpu_max(&self) -> Result<usize, GatewayError> {
        let count = self.lock().domains[&self.uuid].vcpus.len();
        if count < 1 {
            return Err(GatewayError::NoVcpus(count as i64));
        }
        Ok(count)
    }

    fn vcpu_info(&self, count: usize) -> Result<Vec<VcpuInfo>, GatewayError> {
        let state = self.lock();
        if state.faults.vcpu_info.contains(&self.uuid) {
            return Err(GatewayError::call("virDomainGetVcpus", "injected"));
        }
        Ok(state.domains[&self.uuid]
            .vcpus
            .iter()
            .take(count)
            .enumerate()
            .map(|(rank, vcpu)| VcpuInfo {
                vcpu: rank as u32,
                pcpu: vcpu.pinned,
                usage_ns: vcpu.usage_ns,
            })
            .collect())
    }

    fn pin_vcpu(&self, vcpu: u32, pcpu: usize, pcpu_total: usize) -> Result<(), GatewayError> {
        // Run the commit through the real bitmap encoding so its round-trip
        // is exercised on every pin.
        let bitmap = pin_bitmap(pcpu, pcpu_total)?;
        let decoded = decode_bitmap(&bitmap);
        assert_eq!(decoded, vec![pcpu], "pin bitmap must select one pCPU");

        let mut state = self.lock();
        if state.faults.pin.contains(&self.uuid) {
            return Err(GatewayError::call("virDomainPinVcpu", "injected"));
        }
        let spec = state
            .domains
            .get_mut(&self.uuid)
            .ok_or_else(|| GatewayError::call("virDomainPinVcpu", "domain gone"))?;
        spec.vcpus[vcpu as usize].pinned = pcpu as u32;
        state.pins.push((self.uuid.clone(), vcpu, pcpu));
        Ok(())
    }

    fn info(&self) -> Result<DomainInfo, GatewayError> {
        let state = self.lock();
        let spec = &state.domains[&self.uuid];
        Ok(DomainInfo {
            memory_limit_bytes: spec.memory_limit_bytes,
            vcpus: spec.vcpus.len() as u64,
        })
    }

    fn memory_stats(&self) -> Result<Vec<MemStat>, GatewayError> {
        let state = self.lock();
        let spec = &state.domains[&self.uuid];

        // Tags the balancer must ignore are always present.
        let mut stats = vec![
            MemStat { tag: 0, bytes: 0 },
            MemStat {
                tag: 7,
                bytes: spec.balloon_bytes / 2,
            },
        ];
        if !state.faults.omit_memory_tags.contains(&self.uuid) {
            stats.push(MemStat {
                tag: TAG_UNUSED,
                bytes: spec.unused_bytes,
            });
            stats.push(MemStat {
                tag: TAG_ACTUAL_BALLOON,
                bytes: spec.balloon_bytes,
            });
        }
        Ok(stats)
    }

    fn set_memory_stats_period(&self, seconds: u64) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if seconds < 1 {
            return Err(GatewayError::call(
                "virDomainSetMemoryStatsPeriod",
                "period below one second",
            ));
        }
        if state.faults.stats_period.contains(&self.uuid) {
            return Err(GatewayError::call("virDomainSetMemoryStatsPeriod", "injected"));
        }
        state.stats_periods.push((self.uuid.clone(), seconds));
        Ok(())
    }

    fn set_memory(&self, bytes: i64) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if state.faults.set_memory.contains(&self.uuid) {
            return Err(GatewayError::call("virDomainSetMemory", "injected"));
        }
        let spec = state
            .domains
            .get_mut(&self.uuid)
            .ok_or_else(|| GatewayError::call("virDomainSetMemory", "domain gone"))?;
        spec.balloon_bytes = bytes;
        state.memory_sets.push((self.uuid.clone(), bytes));
        Ok(())
    }
}
