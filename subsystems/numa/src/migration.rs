//! # Page Migration Engine
//!
//! Relocates resident pages of a process between domains, either an
//! explicit page list (`move_pages`) or every page found on a set of
//! domains (`migrate_pages`).
//!
//! Requests are validated up front and rejected whole. Once a batch
//! starts, each page is handled on its own: a failing page is recorded and
//! the batch carries on. Locks are only ever held for one page at a time.

use alloc::vec::Vec;

use crate::config::NumaConfig;
use crate::directory::{ObjectDirectory, ResolvedObject};
use crate::error::{errno, NumaError, NumaResult};
use crate::memory::PhysicalMemory;
use crate::stats::NumaStats;
use crate::topology::TopologyRegistry;
use crate::types::{CpuWhich, DomainId, DomainMask, ObjectId, Pid};

// ============================================================================
// FLAGS
// ============================================================================

bitflags::bitflags! {
    /// `move_pages` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MoveFlags: u32 {
        /// Also relocate pages mapped by other processes
        const MOVE_SHARED = 1 << 0;
    }
}

impl MoveFlags {
    /// Skip pages mapped by other processes (the default)
    pub const MOVE_PRIVATE_ONLY: Self = Self::empty();

    /// Decode raw syscall flags, rejecting unknown bits
    pub fn from_raw(raw: i32) -> NumaResult<Self> {
        u32::try_from(raw)
            .ok()
            .and_then(Self::from_bits)
            .ok_or(NumaError::InvalidFlags)
    }
}

impl Default for MoveFlags {
    fn default() -> Self {
        Self::MOVE_PRIVATE_ONLY
    }
}

// ============================================================================
// PER-PAGE STATUS
// ============================================================================

/// Result for one page of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Page now resides on this domain
    Resident(DomainId),
    /// No page is mapped at the address
    Unmapped,
    /// Requested domain does not exist
    InvalidDomain,
    /// Page is wired and cannot move
    Pinned,
    /// Page is mapped by another process and shared moves were not requested
    Shared,
    /// Target domain has no free frame
    NoMemory,
    /// Page kept being relocated by others while this request ran
    Busy,
}

impl PageStatus {
    /// Status slot value: the domain on success, `-errno` otherwise
    pub const fn code(&self) -> i32 {
        match *self {
            Self::Resident(domain) => domain as i32,
            Self::Unmapped => -errno::EFAULT,
            Self::InvalidDomain => -errno::EINVAL,
            Self::Pinned => -errno::EBUSY,
            Self::Shared => -errno::EACCES,
            Self::NoMemory => -errno::ENOMEM,
            Self::Busy => -errno::EBUSY,
        }
    }

    /// Did the page end up where it was asked to?
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Resident(_))
    }
}

/// Outcome of `move_pages`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MoveReport {
    /// One entry per requested page, in request order
    pub statuses: Vec<PageStatus>,
    /// Number of entries that are not `Resident`
    pub failed: usize,
}

// ============================================================================
// MIGRATE OUTCOME
// ============================================================================

/// Coarse result of `migrate_pages`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MigrateOutcome {
    /// Every selected page was relocated
    FullSuccess    = 0,
    /// Some selected pages were relocated
    PartialSuccess = 1,
    /// No page matched the old mask
    NoPagesMoved   = 2,
    /// Pages matched but none could be relocated
    Failed         = 3,
}

impl MigrateOutcome {
    /// Value returned at the syscall boundary
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decode a syscall return value
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::FullSuccess),
            1 => Some(Self::PartialSuccess),
            2 => Some(Self::NoPagesMoved),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Anything other than a total failure
    pub const fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }

    fn classify(candidates: usize, moved: usize) -> Self {
        if candidates == 0 {
            Self::NoPagesMoved
        } else if moved == candidates {
            Self::FullSuccess
        } else if moved == 0 {
            Self::Failed
        } else {
            Self::PartialSuccess
        }
    }
}

/// Outcome of `migrate_pages` with counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Category
    pub outcome: MigrateOutcome,
    /// Pages found on an old-mask domain
    pub candidates: usize,
    /// Pages relocated (or already on their target)
    pub moved: usize,
    /// Pages left where they were
    pub failed: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Page Migration Engine, borrowed from the owning kernel instance
pub struct PageMigrationEngine<'a> {
    config: &'a NumaConfig,
    topology: &'a TopologyRegistry,
    directory: &'a dyn ObjectDirectory,
    memory: &'a PhysicalMemory,
    stats: &'a NumaStats,
}

impl core::fmt::Debug for PageMigrationEngine<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageMigrationEngine")
            .field("config", self.config)
            .field("domains", &self.topology.domain_count())
            .finish_non_exhaustive()
    }
}

impl<'a> PageMigrationEngine<'a> {
    /// Assemble an engine over the kernel's state
    pub fn new(
        config: &'a NumaConfig,
        topology: &'a TopologyRegistry,
        directory: &'a dyn ObjectDirectory,
        memory: &'a PhysicalMemory,
        stats: &'a NumaStats,
    ) -> Self {
        Self {
            config,
            topology,
            directory,
            memory,
            stats,
        }
    }

    /// Resolve the process a request is aimed at.
    ///
    /// A thread id names the address space of the process owning it.
    fn target_process(&self, pid: Pid) -> NumaResult<Pid> {
        if pid < self.config.reserved_pid_floor {
            return Err(NumaError::InvalidPid);
        }
        let object = match self.directory.resolve(CpuWhich::Pid, pid as ObjectId) {
            Err(NumaError::InvalidTarget) => {
                self.directory.resolve(CpuWhich::Tid, pid as ObjectId)?
            },
            other => other?,
        };
        match object {
            ResolvedObject::Process { pid, .. } | ResolvedObject::Thread { pid, .. } => Ok(pid),
            _ => Err(NumaError::InvalidTarget),
        }
    }

    /// Relocate each page at `addresses[i]` to `targets[i]`.
    ///
    /// With `targets == None` nothing moves and each status reports where
    /// the page currently lives.
    pub fn move_pages(
        &self,
        pid: Pid,
        addresses: &[u64],
        targets: Option<&[i32]>,
        flags: MoveFlags,
    ) -> NumaResult<MoveReport> {
        self.topology.ensure_available()?;
        let pid = self.target_process(pid)?;
        if addresses.len() > self.config.max_move_pages {
            return Err(NumaError::InvalidCount);
        }
        if targets.is_some_and(|t| t.len() != addresses.len()) {
            return Err(NumaError::InvalidCount);
        }

        let allow_shared = flags.contains(MoveFlags::MOVE_SHARED);
        let mut report = MoveReport {
            statuses: Vec::with_capacity(addresses.len()),
            failed: 0,
        };

        for (i, &addr) in addresses.iter().enumerate() {
            let vpn = self.config.vpn_of(addr);
            let status = match targets {
                None => match self.memory.page_domain(pid, vpn) {
                    Some(domain) => PageStatus::Resident(domain),
                    None => PageStatus::Unmapped,
                },
                Some(targets) => self.move_one(pid, vpn, targets[i], allow_shared),
            };
            if !status.is_ok() {
                report.failed += 1;
                log::debug!(
                    "NUMA: pid {} page {:#x} not moved: {:?}",
                    pid,
                    addr,
                    status
                );
            }
            report.statuses.push(status);
        }

        if targets.is_some() {
            let moved = report.statuses.len() - report.failed;
            self.stats.record_moves(moved as u64, report.failed as u64);
        }
        Ok(report)
    }

    fn move_one(&self, pid: Pid, vpn: u64, target: i32, allow_shared: bool) -> PageStatus {
        let Ok(target) = DomainId::try_from(target) else {
            return PageStatus::InvalidDomain;
        };
        if self.topology.check_domain(target).is_err() {
            return PageStatus::InvalidDomain;
        }
        match self.memory.relocate(pid, vpn, target, allow_shared) {
            Ok(domain) => PageStatus::Resident(domain),
            Err(status) => status,
        }
    }

    /// Relocate every page of `pid` resident on an `old` domain onto the
    /// `new` domains, handing targets out round-robin in ascending order.
    pub fn migrate_pages(
        &self,
        pid: Pid,
        old: DomainMask,
        new: DomainMask,
    ) -> NumaResult<MigrationReport> {
        self.topology.ensure_available()?;
        let pid = self.target_process(pid)?;
        self.topology.check_mask(new)?;
        if !old.fits(self.topology.domain_count()) {
            return Err(NumaError::InvalidDomainMask);
        }
        self.stats.record_migrate_call();

        let mut candidates = 0;
        let mut moved = 0;
        let mut cursor: Option<DomainId> = None;

        if !old.is_empty() {
            for (vpn, _) in self.memory.resident_pages(pid) {
                let Some(current) = self.memory.page_domain(pid, vpn) else {
                    continue;
                };
                if !old.contains(current) {
                    continue;
                }
                let next = match cursor {
                    Some(last) => new.next_after(last),
                    None => new.first(),
                };
                let Some(target) = next else {
                    break;
                };
                cursor = Some(target);
                candidates += 1;

                match self
                    .memory
                    .relocate(pid, vpn, target, self.config.migrate_shared)
                {
                    Ok(_) => moved += 1,
                    Err(status) => log::debug!(
                        "NUMA: pid {} page {:#x} left on domain {}: {:?}",
                        pid,
                        vpn,
                        current,
                        status
                    ),
                }
            }
        }

        let failed = candidates - moved;
        self.stats.record_moves(moved as u64, failed as u64);
        let outcome = MigrateOutcome::classify(candidates, moved);
        match outcome {
            MigrateOutcome::FullSuccess | MigrateOutcome::NoPagesMoved => log::info!(
                "NUMA: migrate pid {} {:?} -> {:?}: {}/{} pages",
                pid,
                old,
                new,
                moved,
                candidates
            ),
            MigrateOutcome::PartialSuccess | MigrateOutcome::Failed => log::warn!(
                "NUMA: migrate pid {} {:?} -> {:?}: {}/{} pages ({:?})",
                pid,
                old,
                new,
                moved,
                candidates,
                outcome
            ),
        }

        Ok(MigrationReport {
            outcome,
            candidates,
            moved,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ObjectTable;
    use crate::types::CpuSet;

    const PAGE: u64 = 4096;

    struct Fixture {
        config: NumaConfig,
        topology: TopologyRegistry,
        table: ObjectTable,
        memory: PhysicalMemory,
        stats: NumaStats,
    }

    impl Fixture {
        fn new() -> Self {
            let topology = TopologyRegistry::builder(3)
                .with_cpus(0, &[0])
                .with_cpus(1, &[1])
                .with_cpus(2, &[2])
                .with_memory(0, 0, 16)
                .with_memory(1, 16, 16)
                .with_memory(2, 32, 2)
                .build()
                .unwrap();
            let table = ObjectTable::new(CpuSet::first_n(3));
            table.spawn_process(5, 0).unwrap();
            table.spawn_thread(5, 7, 1).unwrap();
            table.spawn_process(6, 1).unwrap();
            let memory = PhysicalMemory::new(&topology);
            Self {
                config: NumaConfig::new(),
                topology,
                table,
                memory,
                stats: NumaStats::new(),
            }
        }

        fn engine(&self) -> PageMigrationEngine<'_> {
            PageMigrationEngine::new(
                &self.config,
                &self.topology,
                &self.table,
                &self.memory,
                &self.stats,
            )
        }

        fn fault(&self, pid: Pid, page: u64, domain: DomainId) {
            self.memory.map_new(pid, page, &[domain]).unwrap();
        }
    }

    #[test]
    fn test_move_pages_empty_batch() {
        let fx = Fixture::new();
        let report = fx.engine().move_pages(5, &[], Some(&[]), MoveFlags::default()).unwrap();
        assert!(report.statuses.is_empty());
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_move_pages_per_page_independence() {
        let fx = Fixture::new();
        fx.fault(5, 1, 0);
        fx.fault(5, 2, 0);
        fx.fault(5, 3, 0);
        fx.memory.set_pinned(5, 3, true).unwrap();

        let report = fx
            .engine()
            .move_pages(
                5,
                &[PAGE, 9 * PAGE, 2 * PAGE + 17, 3 * PAGE],
                Some(&[1, 1, 7, 1]),
                MoveFlags::MOVE_PRIVATE_ONLY,
            )
            .unwrap();

        assert_eq!(
            report.statuses,
            [
                PageStatus::Resident(1),
                PageStatus::Unmapped,
                PageStatus::InvalidDomain,
                PageStatus::Pinned
            ]
        );
        assert_eq!(report.failed, 3);
        assert_eq!(fx.memory.page_domain(5, 1), Some(1));
        assert_eq!(fx.memory.page_domain(5, 2), Some(0));
    }

    #[test]
    fn test_move_pages_shared_flag() {
        let fx = Fixture::new();
        fx.fault(5, 1, 0);
        fx.memory.share(5, 1, 6, 1).unwrap();
        let engine = fx.engine();

        let report = engine
            .move_pages(5, &[PAGE], Some(&[1]), MoveFlags::default())
            .unwrap();
        assert_eq!(report.statuses, [PageStatus::Shared]);
        assert_eq!(PageStatus::Shared.code(), -errno::EACCES);

        let report = engine
            .move_pages(5, &[PAGE], Some(&[1]), MoveFlags::MOVE_SHARED)
            .unwrap();
        assert_eq!(report.statuses[0].code(), 1);
        assert_eq!(fx.memory.page_domain(6, 1), Some(1));
    }

    #[test]
    fn test_move_pages_query_mode() {
        let fx = Fixture::new();
        fx.fault(5, 1, 2);
        let report = fx
            .engine()
            .move_pages(5, &[PAGE, 2 * PAGE], None, MoveFlags::default())
            .unwrap();
        assert_eq!(report.statuses, [PageStatus::Resident(2), PageStatus::Unmapped]);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_move_pages_request_failures() {
        let mut fx = Fixture::new();
        fx.config.max_move_pages = 2;
        let engine = fx.engine();
        let flags = MoveFlags::default();

        assert_eq!(
            engine.move_pages(1, &[0], Some(&[0]), flags),
            Err(NumaError::InvalidPid)
        );
        assert_eq!(
            engine.move_pages(-4, &[0], Some(&[0]), flags),
            Err(NumaError::InvalidPid)
        );
        assert_eq!(
            engine.move_pages(77, &[0], Some(&[0]), flags),
            Err(NumaError::InvalidTarget)
        );
        assert_eq!(
            engine.move_pages(5, &[0, 1, 2], None, flags),
            Err(NumaError::InvalidCount)
        );
        assert_eq!(
            engine.move_pages(5, &[0], Some(&[0, 1]), flags),
            Err(NumaError::InvalidCount)
        );
        assert_eq!(MoveFlags::from_raw(4), Err(NumaError::InvalidFlags));
        assert_eq!(MoveFlags::from_raw(-1), Err(NumaError::InvalidFlags));
        assert_eq!(MoveFlags::from_raw(1), Ok(MoveFlags::MOVE_SHARED));
    }

    #[test]
    fn test_migrate_pages_round_robin() {
        let fx = Fixture::new();
        for page in 0..4 {
            fx.fault(5, page, 0);
        }
        fx.fault(5, 10, 1);

        let new: DomainMask = [1, 2].into_iter().collect();
        let report = fx
            .engine()
            .migrate_pages(5, DomainMask::single(0), new)
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::FullSuccess);
        assert_eq!(report.candidates, 4);

        let placed: Vec<_> = (0..4).map(|p| fx.memory.page_domain(5, p).unwrap()).collect();
        assert_eq!(placed, [1, 2, 1, 2]);
        // Not selected by the old mask
        assert_eq!(fx.memory.page_domain(5, 10), Some(1));
    }

    #[test]
    fn test_migrate_pages_outcomes() {
        let fx = Fixture::new();
        let engine = fx.engine();
        fx.fault(5, 0, 0);

        // Old mask selects nothing the process occupies
        let report = engine
            .migrate_pages(5, DomainMask::single(1), DomainMask::single(2))
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::NoPagesMoved);
        let report = engine
            .migrate_pages(5, DomainMask::empty(), DomainMask::single(2))
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::NoPagesMoved);

        for page in 1..4 {
            fx.fault(5, page, 0);
        }
        // Domain 2 only holds two frames
        let report = engine
            .migrate_pages(5, DomainMask::single(0), DomainMask::single(2))
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::PartialSuccess);
        assert_eq!((report.moved, report.failed), (2, 2));

        fx.memory.set_pinned(5, 2, true).unwrap();
        fx.memory.set_pinned(5, 3, true).unwrap();
        let report = engine
            .migrate_pages(5, DomainMask::single(0), DomainMask::single(1))
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::Failed);
        assert_eq!(MigrateOutcome::Failed.code(), 3);
    }

    #[test]
    fn test_thread_id_targets_owning_process() {
        let fx = Fixture::new();
        let engine = fx.engine();
        fx.fault(5, 0, 0);
        fx.fault(5, 1, 0);

        let report = engine
            .migrate_pages(7, DomainMask::single(0), DomainMask::single(1))
            .unwrap();
        assert_eq!(report.outcome, MigrateOutcome::FullSuccess);
        assert_eq!(fx.memory.residency(5, 3), [0, 2, 0]);
        assert!(fx.memory.address_space(7).is_none());

        let report = engine
            .move_pages(7, &[0, PAGE], None, MoveFlags::default())
            .unwrap();
        assert_eq!(report.statuses, [PageStatus::Resident(1), PageStatus::Resident(1)]);
    }

    #[test]
    fn test_migrate_pages_rejects_bad_masks() {
        let fx = Fixture::new();
        let engine = fx.engine();
        assert_eq!(
            engine.migrate_pages(5, DomainMask::single(0), DomainMask::empty()),
            Err(NumaError::InvalidDomainMask)
        );
        assert_eq!(
            engine.migrate_pages(5, DomainMask::single(0), DomainMask::single(3)),
            Err(NumaError::InvalidDomainMask)
        );
        assert_eq!(
            engine.migrate_pages(5, DomainMask::single(9), DomainMask::single(0)),
            Err(NumaError::InvalidDomainMask)
        );
    }
}
