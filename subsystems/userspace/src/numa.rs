//! # NUMA Affinity Library
//!
//! Thread placement on top of the NUMA syscalls: bind a thread to a
//! domain, pick its memory policy, move it with or without its pages.
//!
//! Nothing here panics or returns an error type. Calls report `bool` (or
//! a [`MigrateOutcome`]) and log why they failed.

use alloc::vec;
use alloc::vec::Vec;

use helix_numa::topology::Weight;
use helix_numa::types::ObjectId;
use helix_numa::{
    CpuLevel, CpuSet, CpuWhich, DomainId, DomainMask, MemoryPolicy, MigrateOutcome, MoveFlags,
    Pid,
};
use spin::Once;

use crate::syscalls::NumaSyscalls;

/// Bytes in the memory affinity mask handed to the kernel
const MASK_SETSIZE: usize = core::mem::size_of::<u64>();

/// What happens to a thread's resident pages when it moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MemFlag {
    /// Leave pages where they are; only new allocations follow the thread
    Leave   = 1,
    /// Migrate every page onto the new domain
    Migrate = 2,
}

impl TryFrom<i32> for MemFlag {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        match value {
            1 => Ok(Self::Leave),
            2 => Ok(Self::Migrate),
            other => Err(other),
        }
    }
}

// ============================================================================
// TOPOLOGY CACHE
// ============================================================================

/// Topology snapshot taken on first use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyCache {
    cpus: Vec<CpuSet>,
    weights: Vec<Weight>,
}

impl TopologyCache {
    fn load<S: NumaSyscalls>(sys: &S) -> Result<Self, isize> {
        let count = sys.get_numa_cpus(None);
        if count <= 0 {
            return Err(count);
        }
        let n = count as usize;

        let mut cpus = vec![CpuSet::new(); n];
        let got = sys.get_numa_cpus(Some(cpus.as_mut_slice()));
        if got != count {
            return Err(got);
        }
        let mut weights: Vec<Weight> = vec![0; n * n];
        let got = sys.get_numa_weights(Some(weights.as_mut_slice()));
        if got != count {
            return Err(got);
        }

        log::info!("NUMA: library sees {} domain(s)", n);
        Ok(Self { cpus, weights })
    }

    /// Number of domains
    pub fn domain_count(&self) -> usize {
        self.cpus.len()
    }

    /// CPUs of a domain
    pub fn cpus(&self, domain: DomainId) -> Option<&CpuSet> {
        self.cpus.get(domain as usize)
    }

    /// Weight between two domains
    pub fn weight(&self, a: DomainId, b: DomainId) -> Option<Weight> {
        let n = self.domain_count();
        if (a as usize) < n && (b as usize) < n {
            Some(self.weights[a as usize * n + b as usize])
        } else {
            None
        }
    }

    /// Domain whose CPUs contain every CPU of `cpus`
    pub fn domain_holding(&self, cpus: &CpuSet) -> Option<DomainId> {
        if cpus.is_empty() {
            return None;
        }
        self.cpus
            .iter()
            .position(|set| set.union(cpus) == *set)
            .map(|d| d as DomainId)
    }
}

// ============================================================================
// LIBRARY HANDLE
// ============================================================================

/// Userspace NUMA library bound to one syscall backend.
///
/// The topology is fetched on the first successful
/// [`is_numa_available`](Self::is_numa_available) and never refreshed.
#[derive(Debug)]
pub struct NumaLibrary<S> {
    sys: S,
    topology: Once<TopologyCache>,
}

impl<S: NumaSyscalls> NumaLibrary<S> {
    /// Wrap a syscall backend
    pub const fn new(sys: S) -> Self {
        Self {
            sys,
            topology: Once::new(),
        }
    }

    /// The syscall backend
    pub fn syscalls(&self) -> &S {
        &self.sys
    }

    /// Cached topology, loading it if needed
    pub fn topology(&self) -> Option<&TopologyCache> {
        self.topology
            .try_call_once(|| TopologyCache::load(&self.sys))
            .ok()
    }

    /// Domain count, `0` when NUMA is unavailable.
    ///
    /// Callers must not use the rest of the library after a `0`.
    pub fn is_numa_available(&self) -> usize {
        self.topology().map_or(0, TopologyCache::domain_count)
    }

    /// CPUs belonging to a domain
    pub fn cpus_in_domain(&self, domain: DomainId) -> Option<CpuSet> {
        self.topology()?.cpus(domain).copied()
    }

    /// Topology, if `pid` names a live thread the library may touch
    fn check_thread(&self, pid: Pid) -> Option<&TopologyCache> {
        let Some(topology) = self.topology() else {
            log::debug!("NUMA: not available");
            return None;
        };
        if pid < self.sys.reserved_pid_floor() {
            log::debug!("NUMA: refusing reserved pid {}", pid);
            return None;
        }
        let rc = self.sys.probe_process(pid);
        if rc < 0 {
            log::debug!("NUMA: pid {} not found ({})", pid, rc);
            return None;
        }
        Some(topology)
    }

    fn check_domain(topology: &TopologyCache, domain: i32) -> Option<DomainId> {
        match DomainId::try_from(domain) {
            Ok(d) if (d as usize) < topology.domain_count() => Some(d),
            _ => {
                log::debug!("NUMA: domain {} out of range", domain);
                None
            },
        }
    }

    fn memory_affinity(&self, pid: Pid) -> Option<(DomainMask, MemoryPolicy)> {
        let mut words = [0u64; 1];
        let mut policy = 0;
        let rc = self.sys.cpuset_get_memory_affinity(
            CpuLevel::Which as i32,
            CpuWhich::Tid as i32,
            pid as ObjectId,
            MASK_SETSIZE,
            &mut words,
            &mut policy,
        );
        if rc < 0 {
            log::debug!("NUMA: reading memory affinity of {} failed ({})", pid, rc);
            return None;
        }
        let policy = MemoryPolicy::try_from(policy).ok()?;
        Some((DomainMask::from_bits(words[0]), policy))
    }

    fn set_memory_affinity(&self, pid: Pid, mask: DomainMask, policy: MemoryPolicy) -> bool {
        let mut words = [0u64; 1];
        mask.to_words(&mut words);
        let rc = self.sys.cpuset_set_memory_affinity(
            CpuLevel::Which as i32,
            CpuWhich::Tid as i32,
            pid as ObjectId,
            MASK_SETSIZE,
            &words,
            policy as i32,
        );
        if rc < 0 {
            log::debug!("NUMA: setting memory affinity of {} failed ({})", pid, rc);
        }
        rc == 0
    }

    fn cpu_affinity(&self, pid: Pid) -> Option<CpuSet> {
        let mut cpus = CpuSet::new();
        let rc = self.sys.cpuset_getaffinity(
            CpuLevel::Which as i32,
            CpuWhich::Tid as i32,
            pid as ObjectId,
            &mut cpus,
        );
        (rc == 0).then_some(cpus)
    }

    fn set_cpu_affinity(&self, pid: Pid, cpus: &CpuSet) -> bool {
        let rc = self.sys.cpuset_setaffinity(
            CpuLevel::Which as i32,
            CpuWhich::Tid as i32,
            pid as ObjectId,
            cpus,
        );
        if rc < 0 {
            log::debug!("NUMA: setting cpu affinity of {} failed ({})", pid, rc);
        }
        rc == 0
    }

    /// Run thread `pid` on the CPUs of `domain` and allocate its memory there.
    ///
    /// If the memory step fails the previous CPU affinity is put back.
    pub fn set_thread_on_domain(&self, pid: Pid, domain: i32) -> bool {
        let Some(topology) = self.check_thread(pid) else {
            return false;
        };
        let Some(domain) = Self::check_domain(topology, domain) else {
            return false;
        };
        let Some(cpus) = topology.cpus(domain) else {
            return false;
        };
        let Some(previous) = self.cpu_affinity(pid) else {
            return false;
        };

        if !self.set_cpu_affinity(pid, cpus) {
            return false;
        }
        let applied = self
            .memory_affinity(pid)
            .is_some_and(|(_, policy)| {
                self.set_memory_affinity(pid, DomainMask::single(domain), policy)
            });
        if !applied {
            if !self.set_cpu_affinity(pid, &previous) {
                log::warn!(
                    "NUMA: pid {} left on domain {} cpus after failed bind",
                    pid,
                    domain
                );
            }
            return false;
        }

        log::debug!("NUMA: pid {} bound to domain {}", pid, domain);
        true
    }

    /// Change only the policy of thread `pid`, keeping its mask
    pub fn set_memory_policy(&self, pid: Pid, policy: MemoryPolicy) -> bool {
        if self.check_thread(pid).is_none() {
            return false;
        }
        match self.memory_affinity(pid) {
            Some((mask, _)) => self.set_memory_affinity(pid, mask, policy),
            None => false,
        }
    }

    /// Bind thread `pid` to `domain`, then migrate its pages there if asked
    pub fn move_thread(&self, pid: Pid, domain: i32, mem_flag: MemFlag) -> bool {
        self.move_thread_report(pid, domain, mem_flag)
            .is_some_and(MigrateOutcome::is_success)
    }

    /// [`move_thread`](Self::move_thread) with the migration outcome.
    ///
    /// `None` when the thread could not be bound or its pages could not be
    /// migrated; in the latter case the previous binding is put back. With
    /// [`MemFlag::Leave`] the outcome is always `NoPagesMoved`.
    pub fn move_thread_report(
        &self,
        pid: Pid,
        domain: i32,
        mem_flag: MemFlag,
    ) -> Option<MigrateOutcome> {
        if mem_flag == MemFlag::Leave {
            return self
                .set_thread_on_domain(pid, domain)
                .then_some(MigrateOutcome::NoPagesMoved);
        }

        self.check_thread(pid)?;
        let previous_cpus = self.cpu_affinity(pid)?;
        let (previous_mask, previous_policy) = self.memory_affinity(pid)?;
        if !self.set_thread_on_domain(pid, domain) {
            return None;
        }

        let n = self.is_numa_available();
        let mut old = DomainMask::first_n(n);
        old.remove(domain as DomainId);
        let outcome = self.migrate(pid, old, DomainMask::single(domain as DomainId));
        if outcome.is_none() {
            let restored = self.set_cpu_affinity(pid, &previous_cpus)
                && self.set_memory_affinity(pid, previous_mask, previous_policy);
            if !restored {
                log::warn!(
                    "NUMA: pid {} left bound to domain {} after failed migration",
                    pid,
                    domain
                );
            }
        }
        outcome
    }

    /// Domain whose CPUs hold the whole CPU affinity of thread `pid`
    pub fn current_domain(&self, pid: Pid) -> Option<DomainId> {
        let topology = self.check_thread(pid)?;
        topology.domain_holding(&self.cpu_affinity(pid)?)
    }

    /// Pull pages that live off the thread's current domain back onto it
    pub fn migrate_estranged_pages(&self, pid: Pid) -> Option<MigrateOutcome> {
        let domain = self.current_domain(pid)?;
        let mut old = DomainMask::first_n(self.is_numa_available());
        old.remove(domain);
        self.migrate(pid, old, DomainMask::single(domain))
    }

    fn migrate(&self, pid: Pid, old: DomainMask, new: DomainMask) -> Option<MigrateOutcome> {
        let maxnode = u64::BITS as usize;
        let rc = self
            .sys
            .migrate_pages(pid, maxnode, &[old.bits()], &[new.bits()]);
        let outcome = MigrateOutcome::from_code(rc);
        if outcome.is_none() {
            log::debug!("NUMA: migrate_pages for {} failed ({})", pid, rc);
        }
        outcome
    }

    /// Domain each address of process `pid` resides on, `None` if unmapped
    pub fn page_domains(&self, pid: Pid, addresses: &[u64]) -> Option<Vec<Option<DomainId>>> {
        let mut status = vec![0i32; addresses.len()];
        let rc = self.sys.move_pages(
            pid,
            addresses.len(),
            addresses,
            None,
            &mut status,
            MoveFlags::MOVE_PRIVATE_ONLY.bits() as i32,
        );
        if rc < 0 {
            return None;
        }
        Some(
            status
                .into_iter()
                .map(|code| DomainId::try_from(code).ok())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use helix_numa::{NumaConfig, NumaKernel, ObjectTable, TopologyRegistry};

    use super::*;
    use crate::syscalls::KernelGate;

    const PAGE: u64 = 4096;
    const PID: Pid = 40;

    fn two_domains() -> (Arc<ObjectTable>, NumaKernel) {
        let topology = TopologyRegistry::builder(2)
            .with_cpus(0, &[0, 1])
            .with_cpus(1, &[2, 3])
            .with_memory(0, 0, 32)
            .with_memory(1, 32, 32)
            .with_weight_matrix(&[0, 10, 10, 0])
            .build()
            .unwrap();
        let table = Arc::new(ObjectTable::new(topology.all_cpus()));
        table.spawn_process(PID, 0).unwrap();
        let kernel = NumaKernel::new(NumaConfig::default(), topology, table.clone());
        (table, kernel)
    }

    fn library(kernel: &NumaKernel) -> NumaLibrary<KernelGate<'_>> {
        NumaLibrary::new(KernelGate::new(kernel, PID, PID))
    }

    /// Backend that can be told to fail memory affinity writes or
    /// `migrate_pages`
    #[derive(Debug)]
    struct FaultyBackend<'k> {
        gate: KernelGate<'k>,
        fail_memory_writes: bool,
        fail_migrate: bool,
    }

    impl<'k> FaultyBackend<'k> {
        fn new(kernel: &'k NumaKernel, tid: Pid) -> Self {
            Self {
                gate: KernelGate::new(kernel, PID, tid),
                fail_memory_writes: false,
                fail_migrate: false,
            }
        }
    }

    impl NumaSyscalls for FaultyBackend<'_> {
        fn get_numa_cpus(&self, out: Option<&mut [CpuSet]>) -> isize {
            self.gate.get_numa_cpus(out)
        }

        fn get_numa_weights(&self, out: Option<&mut [Weight]>) -> isize {
            self.gate.get_numa_weights(out)
        }

        fn probe_process(&self, pid: Pid) -> i32 {
            self.gate.probe_process(pid)
        }

        fn cpuset_setaffinity(&self, level: i32, which: i32, id: ObjectId, cpus: &CpuSet) -> i32 {
            self.gate.cpuset_setaffinity(level, which, id, cpus)
        }

        fn cpuset_getaffinity(
            &self,
            level: i32,
            which: i32,
            id: ObjectId,
            cpus: &mut CpuSet,
        ) -> i32 {
            self.gate.cpuset_getaffinity(level, which, id, cpus)
        }

        fn cpuset_get_memory_affinity(
            &self,
            level: i32,
            which: i32,
            id: ObjectId,
            setsize: usize,
            mask: &mut [u64],
            policy: &mut i32,
        ) -> i32 {
            self.gate
                .cpuset_get_memory_affinity(level, which, id, setsize, mask, policy)
        }

        fn cpuset_set_memory_affinity(
            &self,
            level: i32,
            which: i32,
            id: ObjectId,
            setsize: usize,
            mask: &[u64],
            policy: i32,
        ) -> i32 {
            if self.fail_memory_writes {
                return -12;
            }
            self.gate
                .cpuset_set_memory_affinity(level, which, id, setsize, mask, policy)
        }

        fn move_pages(
            &self,
            pid: Pid,
            count: usize,
            pages: &[u64],
            nodes: Option<&[i32]>,
            status: &mut [i32],
            flags: i32,
        ) -> isize {
            self.gate.move_pages(pid, count, pages, nodes, status, flags)
        }

        fn migrate_pages(&self, pid: Pid, maxnode: usize, old: &[u64], new: &[u64]) -> i32 {
            if self.fail_migrate {
                return -12;
            }
            self.gate.migrate_pages(pid, maxnode, old, new)
        }
    }

    #[test]
    fn test_single_domain_bind() {
        let topology = TopologyRegistry::builder(1)
            .with_cpus(0, &[0, 1])
            .with_memory(0, 0, 4)
            .build()
            .unwrap();
        let table = Arc::new(ObjectTable::new(topology.all_cpus()));
        table.spawn_process(PID, 1).unwrap();
        let kernel = NumaKernel::new(NumaConfig::default(), topology, table);
        let lib = library(&kernel);

        assert_eq!(lib.is_numa_available(), 1);
        assert!(lib.set_thread_on_domain(PID, 0));
        let (mask, policy) = lib.memory_affinity(PID).unwrap();
        assert_eq!(mask, DomainMask::single(0));
        assert_eq!(policy, MemoryPolicy::Nearest);
    }

    #[test]
    fn test_no_numa_touches_nothing() {
        let table = Arc::new(ObjectTable::new(CpuSet::first_n(2)));
        table.spawn_process(PID, 1).unwrap();
        let kernel = NumaKernel::new(
            NumaConfig::default(),
            TopologyRegistry::unavailable(),
            table.clone(),
        );
        let lib = library(&kernel);

        assert_eq!(lib.is_numa_available(), 0);
        assert!(lib.topology().is_none());
        assert!(!lib.set_thread_on_domain(PID, 0));
        assert!(!lib.set_memory_policy(PID, MemoryPolicy::Interleave));
        assert!(!lib.move_thread(PID, 0, MemFlag::Leave));
        assert!(kernel.affinity().is_empty());
        assert_eq!(lib.cpu_affinity(PID), Some(CpuSet::first_n(2)));
    }

    #[test]
    fn test_reserved_and_unknown_pids_rejected() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        for pid in [-1, 0, 1, 1_000_000_000] {
            assert!(!lib.set_thread_on_domain(pid, 0));
            assert!(!lib.set_memory_policy(pid, MemoryPolicy::Nearest));
            assert!(!lib.move_thread(pid, 0, MemFlag::Migrate));
        }
        assert!(kernel.affinity().is_empty());
    }

    #[test]
    fn test_bad_domain_keeps_prior_record() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        assert!(lib.set_thread_on_domain(PID, 1));
        let before = lib.memory_affinity(PID).unwrap();
        let cpus_before = lib.cpu_affinity(PID).unwrap();

        for domain in [-1, 2, 1000] {
            assert!(!lib.set_thread_on_domain(PID, domain));
        }
        assert_eq!(lib.memory_affinity(PID).unwrap(), before);
        assert_eq!(lib.cpu_affinity(PID).unwrap(), cpus_before);
        assert_eq!(lib.current_domain(PID), Some(1));
    }

    #[test]
    fn test_failed_memory_step_restores_cpus() {
        let (_, kernel) = two_domains();
        let mut backend = FaultyBackend::new(&kernel, PID);
        backend.fail_memory_writes = true;
        let lib = NumaLibrary::new(backend);

        assert!(!lib.set_thread_on_domain(PID, 1));
        assert_eq!(lib.cpu_affinity(PID), Some(CpuSet::first_n(4)));
        assert_eq!(lib.memory_affinity(PID).unwrap().0, DomainMask::first_n(2));
    }

    #[test]
    fn test_move_thread_migrates_pages() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        let addrs: Vec<u64> = (0..6).map(|p| p * PAGE).collect();
        for &addr in &addrs {
            assert_eq!(kernel.fault_in(PID, addr), Ok(0));
        }
        assert_eq!(lib.page_domains(PID, &addrs).unwrap(), vec![Some(0); 6]);

        assert!(lib.move_thread(PID, 1, MemFlag::Migrate));
        assert_eq!(lib.page_domains(PID, &addrs).unwrap(), vec![Some(1); 6]);
        assert_eq!(kernel.process_residency(PID), [0, 6]);
        assert_eq!(lib.current_domain(PID), Some(1));
    }

    #[test]
    fn test_move_secondary_thread_migrates_process_pages() {
        let (table, kernel) = two_domains();
        table.spawn_thread(PID, 41, 0).unwrap();
        let lib = NumaLibrary::new(KernelGate::new(&kernel, PID, 41));
        for p in 0..3 {
            assert_eq!(kernel.fault_in(41, p * PAGE), Ok(0));
        }

        assert!(lib.move_thread(41, 1, MemFlag::Migrate));
        assert_eq!(kernel.process_residency(PID), [0, 3]);
        assert_eq!(lib.cpu_affinity(41), Some([2, 3].into_iter().collect::<CpuSet>()));
        assert_eq!(lib.current_domain(41), Some(1));
        // The main thread was not rebound
        assert_eq!(lib.cpu_affinity(PID), Some(CpuSet::first_n(4)));
    }

    #[test]
    fn test_failed_migration_restores_binding() {
        let (table, kernel) = two_domains();
        table.spawn_thread(PID, 41, 0).unwrap();
        let mut backend = FaultyBackend::new(&kernel, 41);
        backend.fail_migrate = true;
        let lib = NumaLibrary::new(backend);
        for p in 0..2 {
            kernel.fault_in(41, p * PAGE).unwrap();
        }
        let memory_before = lib.memory_affinity(41).unwrap();

        assert!(!lib.move_thread(41, 1, MemFlag::Migrate));
        assert_eq!(lib.move_thread_report(41, 1, MemFlag::Migrate), None);
        assert_eq!(lib.cpu_affinity(41), Some(CpuSet::first_n(4)));
        assert_eq!(lib.memory_affinity(41).unwrap(), memory_before);
        assert_eq!(kernel.process_residency(PID), [2, 0]);
    }

    #[test]
    fn test_pid_floor_follows_kernel_config() {
        let topology = TopologyRegistry::builder(1)
            .with_cpus(0, &[0])
            .with_memory(0, 0, 4)
            .build()
            .unwrap();
        let table = Arc::new(ObjectTable::new(topology.all_cpus()));
        table.spawn_process(PID, 0).unwrap();
        table.spawn_process(60, 0).unwrap();
        let config = NumaConfig::builder().reserved_pid_floor(50).build();
        let kernel = NumaKernel::new(config, topology, table);
        let lib = library(&kernel);

        assert_eq!(lib.syscalls().reserved_pid_floor(), 50);
        assert!(!lib.set_thread_on_domain(PID, 0));
        assert!(lib.set_thread_on_domain(60, 0));
    }

    #[test]
    fn test_move_thread_leave_and_estranged_pages() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        for p in 0..3 {
            kernel.fault_in(PID, p * PAGE).unwrap();
        }

        assert_eq!(
            lib.move_thread_report(PID, 1, MemFlag::Leave),
            Some(MigrateOutcome::NoPagesMoved)
        );
        assert_eq!(kernel.process_residency(PID), [3, 0]);
        // New allocations follow the thread
        assert_eq!(kernel.fault_in(PID, 10 * PAGE), Ok(1));

        assert_eq!(
            lib.migrate_estranged_pages(PID),
            Some(MigrateOutcome::FullSuccess)
        );
        assert_eq!(kernel.process_residency(PID), [0, 4]);
        assert_eq!(
            lib.migrate_estranged_pages(PID),
            Some(MigrateOutcome::NoPagesMoved)
        );
    }

    #[test]
    fn test_interleave_policy_cycles_domains() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        assert!(lib.set_memory_policy(PID, MemoryPolicy::Interleave));
        let (mask, policy) = lib.memory_affinity(PID).unwrap();
        assert_eq!(mask, DomainMask::first_n(2));
        assert_eq!(policy, MemoryPolicy::Interleave);

        let placed: Vec<_> = (0..6)
            .map(|p| kernel.fault_in(PID, p * PAGE).unwrap())
            .collect();
        assert_eq!(placed, [0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_topology_cache() {
        let (_, kernel) = two_domains();
        let lib = library(&kernel);
        assert_eq!(lib.cpus_in_domain(1), Some([2, 3].into_iter().collect::<CpuSet>()));
        assert_eq!(lib.cpus_in_domain(2), None);
        let cache = lib.topology().unwrap();
        assert_eq!(cache.weight(0, 1), Some(10));
        assert_eq!(cache.weight(1, 1), Some(0));
        assert_eq!(cache.weight(0, 5), None);
        assert_eq!(cache.domain_holding(&CpuSet::first_n(4)), None);
        assert_eq!(MemFlag::try_from(2), Ok(MemFlag::Migrate));
        assert_eq!(MemFlag::try_from(3), Err(3));
    }
}
