//! # Memory Affinity Control
//!
//! Get/set of an object's memory affinity record, plus the generic CPU
//! affinity calls it is composed with.

use crate::affinity::{AffinityRecord, AffinityStore};
use crate::directory::{ObjectDirectory, ResolvedObject};
use crate::error::NumaResult;
use crate::stats::NumaStats;
use crate::topology::TopologyRegistry;
use crate::types::{AffinityTarget, CpuSet, DomainMask, MemoryPolicy};

/// Memory Affinity Control, borrowed from the owning kernel instance
pub struct MemoryAffinityControl<'a> {
    topology: &'a TopologyRegistry,
    directory: &'a dyn ObjectDirectory,
    store: &'a AffinityStore,
    stats: &'a NumaStats,
}

impl core::fmt::Debug for MemoryAffinityControl<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryAffinityControl")
            .field("domains", &self.topology.domain_count())
            .field("store", self.store)
            .finish_non_exhaustive()
    }
}

impl<'a> MemoryAffinityControl<'a> {
    /// Assemble over the kernel's state
    pub fn new(
        topology: &'a TopologyRegistry,
        directory: &'a dyn ObjectDirectory,
        store: &'a AffinityStore,
        stats: &'a NumaStats,
    ) -> Self {
        Self {
            topology,
            directory,
            store,
            stats,
        }
    }

    /// Resolve a target to its live object
    pub fn resolve(&self, target: &AffinityTarget) -> NumaResult<ResolvedObject> {
        self.topology.ensure_available()?;
        Ok(self.store.resolve(target)?.0)
    }

    /// Current mask and policy of the target
    pub fn get_memory_affinity(&self, target: &AffinityTarget) -> NumaResult<AffinityRecord> {
        self.topology.ensure_available()?;
        self.store.get(target)
    }

    /// Replace mask and policy together.
    ///
    /// Nothing changes unless the target exists and the mask is a
    /// non-empty subset of the domains.
    pub fn set_memory_affinity(
        &self,
        target: &AffinityTarget,
        mask: DomainMask,
        policy: MemoryPolicy,
    ) -> NumaResult<()> {
        self.topology.ensure_available()?;
        self.store.set(target, AffinityRecord::new(mask, policy))?;
        self.stats.record_affinity_update();
        Ok(())
    }

    /// CPU affinity of the target object
    pub fn get_cpu_affinity(&self, target: &AffinityTarget) -> NumaResult<CpuSet> {
        let object = self.directory.resolve(target.which, target.id)?;
        self.directory.cpu_affinity(&object)
    }

    /// Replace the CPU affinity of the target object
    pub fn set_cpu_affinity(&self, target: &AffinityTarget, cpus: &CpuSet) -> NumaResult<()> {
        let object = self.directory.resolve(target.which, target.id)?;
        self.directory.set_cpu_affinity(&object, cpus)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::directory::ObjectTable;
    use crate::error::NumaError;
    use crate::types::{CpuLevel, CpuWhich};

    fn setup(domains: usize) -> (TopologyRegistry, Arc<ObjectTable>, AffinityStore, NumaStats) {
        let topology = if domains == 0 {
            TopologyRegistry::unavailable()
        } else {
            TopologyRegistry::builder(domains).build().unwrap()
        };
        let table = Arc::new(ObjectTable::new(CpuSet::first_n(4)));
        table.spawn_process(5, 0).unwrap();
        let store = AffinityStore::new(topology.domain_count(), table.clone());
        (topology, table, store, NumaStats::new())
    }

    #[test]
    fn test_set_then_get() {
        let (topo, table, store, stats) = setup(2);
        let control = MemoryAffinityControl::new(&topo, &*table, &store, &stats);
        let target = AffinityTarget::thread(5);

        control
            .set_memory_affinity(&target, DomainMask::single(1), MemoryPolicy::Interleave)
            .unwrap();
        let record = control.get_memory_affinity(&target).unwrap();
        assert_eq!(record.mask, DomainMask::single(1));
        assert_eq!(record.policy, MemoryPolicy::Interleave);
    }

    #[test]
    fn test_failed_set_keeps_prior_record() {
        let (topo, table, store, stats) = setup(2);
        let control = MemoryAffinityControl::new(&topo, &*table, &store, &stats);
        let target = AffinityTarget::thread(5);
        control
            .set_memory_affinity(&target, DomainMask::single(0), MemoryPolicy::Nearest)
            .unwrap();

        assert_eq!(
            control.set_memory_affinity(&target, DomainMask::from_bits(0b100), MemoryPolicy::Interleave),
            Err(NumaError::InvalidDomainMask)
        );
        assert_eq!(
            control.get_memory_affinity(&target).unwrap(),
            AffinityRecord::new(DomainMask::single(0), MemoryPolicy::Nearest)
        );
    }

    #[test]
    fn test_unavailable_gates_everything() {
        let (topo, table, store, stats) = setup(0);
        let control = MemoryAffinityControl::new(&topo, &*table, &store, &stats);
        let target = AffinityTarget::thread(5);
        assert_eq!(control.get_memory_affinity(&target), Err(NumaError::Unavailable));
        assert_eq!(
            control.set_memory_affinity(&target, DomainMask::single(0), MemoryPolicy::Nearest),
            Err(NumaError::Unavailable)
        );
        assert_eq!(control.resolve(&target), Err(NumaError::Unavailable));
        assert!(store.is_empty());
    }

    #[test]
    fn test_cpu_affinity_roundtrip() {
        let (topo, table, store, stats) = setup(2);
        let control = MemoryAffinityControl::new(&topo, &*table, &store, &stats);
        let target = AffinityTarget::new(CpuLevel::Root, CpuWhich::Tid, 5);
        let cpus: CpuSet = [2, 3].into_iter().collect();
        control.set_cpu_affinity(&target, &cpus).unwrap();
        assert_eq!(control.get_cpu_affinity(&target).unwrap(), cpus);
        assert_eq!(table.current_cpu(5), Some(2));
        assert_eq!(
            control.set_cpu_affinity(&target, &CpuSet::single(9)),
            Err(NumaError::InvalidCpuSet)
        );
    }
}
