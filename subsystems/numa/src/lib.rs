//! # Helix NUMA Subsystem
//!
//! NUMA domain topology, per-object memory affinity and page migration for
//! a single kernel instance.
//!
//! ## Components
//!
//! - **Topology Registry**: CPUs, memory ranges and weights per domain
//! - **Affinity State Store**: mask/policy record per thread, process,
//!   cpuset and interrupt
//! - **Memory Affinity Control**: validated get/set over the store
//! - **Page Migration Engine**: `move_pages` / `migrate_pages`
//! - **Syscall layer**: raw integer entry points over the above
//!
//! Threads, processes and the generic CPU affinity mechanism belong to the
//! rest of the kernel and are reached through [`ObjectDirectory`].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod affinity;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod memory;
pub mod migration;
pub mod placement;
pub mod stats;
pub mod syscall;
pub mod topology;
pub mod types;

use alloc::sync::Arc;
use alloc::vec::Vec;

pub use affinity::{AffinityKey, AffinityRecord, AffinityStore};
pub use config::NumaConfig;
pub use control::MemoryAffinityControl;
pub use directory::{ObjectDirectory, ObjectTable, ResolvedObject};
pub use error::{ErrorKind, NumaError, NumaResult};
pub use migration::{
    MigrateOutcome, MigrationReport, MoveFlags, MoveReport, PageMigrationEngine, PageStatus,
};
pub use stats::NumaStatsSnapshot;
pub use topology::{TopologyBuilder, TopologyRegistry, Weight};
pub use types::{
    AffinityTarget, CpuId, CpuLevel, CpuSet, CpuWhich, DomainId, DomainMask, MemoryPolicy, Pid,
};

use memory::PhysicalMemory;
use stats::NumaStats;

/// NUMA state of one kernel instance
pub struct NumaKernel {
    config: NumaConfig,
    topology: TopologyRegistry,
    directory: Arc<dyn ObjectDirectory>,
    affinity: AffinityStore,
    memory: PhysicalMemory,
    stats: NumaStats,
}

impl core::fmt::Debug for NumaKernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NumaKernel")
            .field("config", &self.config)
            .field("domains", &self.topology.domain_count())
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl NumaKernel {
    /// Bring the subsystem up over a discovered topology
    pub fn new(
        config: NumaConfig,
        topology: TopologyRegistry,
        directory: Arc<dyn ObjectDirectory>,
    ) -> Self {
        let affinity = AffinityStore::new(topology.domain_count(), directory.clone());
        let memory = PhysicalMemory::new(&topology);
        if topology.is_available() {
            log::info!(
                "NUMA: subsystem up, {} domain(s), page size {}",
                topology.domain_count(),
                config.page_size
            );
        } else {
            log::info!("NUMA: subsystem up without NUMA support");
        }
        Self {
            config,
            topology,
            directory,
            affinity,
            memory,
            stats: NumaStats::new(),
        }
    }

    /// Configuration
    pub fn config(&self) -> &NumaConfig {
        &self.config
    }

    /// Topology Registry
    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    /// Object directory
    pub fn directory(&self) -> &dyn ObjectDirectory {
        self.directory.as_ref()
    }

    /// Affinity State Store
    pub fn affinity(&self) -> &AffinityStore {
        &self.affinity
    }

    /// Physical memory and page ownership
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Memory Affinity Control
    pub fn control(&self) -> MemoryAffinityControl<'_> {
        MemoryAffinityControl::new(
            &self.topology,
            self.directory.as_ref(),
            &self.affinity,
            &self.stats,
        )
    }

    /// Page Migration Engine
    pub fn migration(&self) -> PageMigrationEngine<'_> {
        PageMigrationEngine::new(
            &self.config,
            &self.topology,
            self.directory.as_ref(),
            &self.memory,
            &self.stats,
        )
    }

    /// Back the page at `addr` for thread `tid`, placing it by the
    /// thread's effective affinity record. Returns the domain used.
    pub fn fault_in(&self, tid: Pid, addr: u64) -> NumaResult<DomainId> {
        self.topology.ensure_available()?;
        let object = self
            .directory
            .resolve(CpuWhich::Tid, tid as types::ObjectId)?;
        let ResolvedObject::Thread { pid, .. } = object else {
            return Err(NumaError::InvalidTarget);
        };
        let vpn = self.config.vpn_of(addr);
        if let Some(domain) = self.memory.page_domain(pid, vpn) {
            return Ok(domain);
        }

        let (record, start) = match self.affinity.effective(&object) {
            Some(entry) => entry.claim_next(),
            None => (
                AffinityRecord::default_for(self.topology.domain_count()),
                None,
            ),
        };
        let home = self
            .directory
            .current_cpu(tid)
            .and_then(|cpu| self.topology.domain_of_cpu(cpu));
        let order = placement::candidate_domains(&self.topology, &record, home, start);
        let domain = self.memory.map_new(pid, vpn, &order)?;
        self.stats.record_allocation(domain, home == Some(domain));

        #[cfg(feature = "debug")]
        log::trace!(
            "NUMA: tid {} faulted {:#x} on domain {} ({:?})",
            tid,
            addr,
            domain,
            record.policy
        );
        Ok(domain)
    }

    /// Map the page at `from_addr` of one process into another
    pub fn share(&self, from_pid: Pid, from_addr: u64, to_pid: Pid, to_addr: u64) -> NumaResult<()> {
        self.memory.share(
            from_pid,
            self.config.vpn_of(from_addr),
            to_pid,
            self.config.vpn_of(to_addr),
        )
    }

    /// Wire a page so it cannot be migrated
    pub fn pin(&self, pid: Pid, addr: u64) -> NumaResult<()> {
        self.memory.set_pinned(pid, self.config.vpn_of(addr), true)
    }

    /// Undo [`pin`](Self::pin)
    pub fn unpin(&self, pid: Pid, addr: u64) -> NumaResult<()> {
        self.memory.set_pinned(pid, self.config.vpn_of(addr), false)
    }

    /// Drop a mapping
    pub fn unmap(&self, pid: Pid, addr: u64) -> NumaResult<()> {
        self.memory.unmap(pid, self.config.vpn_of(addr))
    }

    /// Domain the page at `addr` resides on
    pub fn page_domain(&self, pid: Pid, addr: u64) -> Option<DomainId> {
        self.memory.page_domain(pid, self.config.vpn_of(addr))
    }

    /// Resident pages of `pid` counted per domain
    pub fn process_residency(&self, pid: Pid) -> Vec<usize> {
        self.memory.residency(pid, self.topology.domain_count())
    }

    /// Forget a destroyed thread
    pub fn release_thread(&self, tid: Pid) {
        self.affinity.remove(AffinityKey::Thread(tid));
    }

    /// Forget a destroyed process: its records, those of its threads and
    /// its address space
    pub fn release_process(&self, pid: Pid) {
        self.affinity.remove_process(pid);
        self.memory.release_address_space(pid);
    }

    /// Counter snapshot
    pub fn stats(&self) -> NumaStatsSnapshot {
        self.stats.snapshot(self.topology.domain_count())
    }
}
