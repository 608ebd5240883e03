//! # Physical Memory and Page Ownership
//!
//! Per-domain frame pools, one ownership entry per physical frame and the
//! per-process translation from virtual page to frame.
//!
//! ## Locking
//!
//! Every frame has its own ownership lock. Operations that touch both a
//! frame and an address space take the frame lock first. Free lists are
//! leaf locks. A page relocation holds the source and destination frame
//! locks for the duration of that single page only.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::error::{NumaError, NumaResult};
use crate::migration::PageStatus;
use crate::topology::{MemoryRange, TopologyRegistry};
use crate::types::{DomainId, Pfn, Pid, Vpn};

/// Retries when a page is remapped under a relocation in flight
const RELOCATE_RETRIES: usize = 4;

// ============================================================================
// PAGE OWNERSHIP
// ============================================================================

#[derive(Debug)]
struct FrameState {
    domain: DomainId,
    /// Every `(pid, vpn)` mapping this frame
    mappings: Vec<(Pid, Vpn)>,
    pinned: bool,
}

/// Snapshot of one frame's ownership entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOwnership {
    /// Physical frame
    pub pfn: Pfn,
    /// Domain the frame lives on
    pub domain: DomainId,
    /// Number of mappings
    pub mappings: usize,
    /// Wired in place
    pub pinned: bool,
}

#[derive(Debug)]
struct FrameRange {
    range: MemoryRange,
    /// Index of the first frame in `PhysicalMemory::frames`
    offset: usize,
}

// ============================================================================
// ADDRESS SPACE
// ============================================================================

/// Virtual-to-physical translation of one process
#[derive(Debug, Default)]
pub struct AddressSpace {
    pages: RwLock<BTreeMap<Vpn, Pfn>>,
}

impl AddressSpace {
    /// Frame backing `vpn`
    pub fn translate(&self, vpn: Vpn) -> Option<Pfn> {
        self.pages.read().get(&vpn).copied()
    }

    /// Resident pages in ascending order
    pub fn snapshot(&self) -> Vec<(Vpn, Pfn)> {
        self.pages.read().iter().map(|(&v, &p)| (v, p)).collect()
    }

    /// Number of resident pages
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// No resident pages?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// PHYSICAL MEMORY
// ============================================================================

/// Frame pools, ownership entries and address spaces
#[derive(Debug)]
pub struct PhysicalMemory {
    ranges: Vec<FrameRange>,
    frames: Vec<Mutex<FrameState>>,
    /// Free frames per domain, lowest pfn popped first
    free: Vec<Mutex<Vec<Pfn>>>,
    spaces: RwLock<HashMap<Pid, Arc<AddressSpace>>>,
}

impl PhysicalMemory {
    /// Carve frame pools out of the topology's memory ranges
    pub fn new(topology: &TopologyRegistry) -> Self {
        let mut ranges = Vec::new();
        let mut frames = Vec::new();
        let mut free = Vec::with_capacity(topology.domain_count());

        for domain in topology.domains() {
            let mut pool = Vec::new();
            for range in &domain.memory {
                ranges.push(FrameRange {
                    range: *range,
                    offset: frames.len(),
                });
                for pfn in range.start..range.end() {
                    frames.push(Mutex::new(FrameState {
                        domain: domain.id,
                        mappings: Vec::new(),
                        pinned: false,
                    }));
                    pool.push(pfn);
                }
            }
            pool.reverse();
            free.push(Mutex::new(pool));
        }

        Self {
            ranges,
            frames,
            free,
            spaces: RwLock::new(HashMap::new()),
        }
    }

    fn frame(&self, pfn: Pfn) -> Option<&Mutex<FrameState>> {
        self.ranges
            .iter()
            .find(|r| r.range.contains(pfn))
            .map(|r| &self.frames[r.offset + (pfn - r.range.start) as usize])
    }

    /// Take a free frame from `domain`
    pub fn alloc_frame(&self, domain: DomainId) -> Option<Pfn> {
        self.free.get(domain as usize)?.lock().pop()
    }

    fn free_frame(&self, domain: DomainId, pfn: Pfn) {
        if let Some(pool) = self.free.get(domain as usize) {
            pool.lock().push(pfn);
        }
    }

    /// Free frames left on `domain`
    pub fn free_frames(&self, domain: DomainId) -> usize {
        self.free.get(domain as usize).map_or(0, |p| p.lock().len())
    }

    /// Ownership entry of a frame
    pub fn ownership(&self, pfn: Pfn) -> Option<PageOwnership> {
        let state = self.frame(pfn)?.lock();
        Some(PageOwnership {
            pfn,
            domain: state.domain,
            mappings: state.mappings.len(),
            pinned: state.pinned,
        })
    }

    /// Address space of a process
    pub fn address_space(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.spaces.read().get(&pid).cloned()
    }

    fn address_space_or_create(&self, pid: Pid) -> Arc<AddressSpace> {
        if let Some(space) = self.address_space(pid) {
            return space;
        }
        self.spaces.write().entry(pid).or_default().clone()
    }

    /// Frame backing a virtual page
    pub fn translate(&self, pid: Pid, vpn: Vpn) -> Option<Pfn> {
        self.address_space(pid)?.translate(vpn)
    }

    /// Domain a virtual page currently resides on
    pub fn page_domain(&self, pid: Pid, vpn: Vpn) -> Option<DomainId> {
        let pfn = self.translate(pid, vpn)?;
        Some(self.frame(pfn)?.lock().domain)
    }

    /// Resident pages of a process in ascending order
    pub fn resident_pages(&self, pid: Pid) -> Vec<(Vpn, Pfn)> {
        self.address_space(pid)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Number of resident pages of a process per domain
    pub fn residency(&self, pid: Pid, domain_count: usize) -> Vec<usize> {
        let mut counts = alloc::vec![0; domain_count];
        for (vpn, _) in self.resident_pages(pid) {
            if let Some(domain) = self.page_domain(pid, vpn) {
                if let Some(slot) = counts.get_mut(domain as usize) {
                    *slot += 1;
                }
            }
        }
        counts
    }

    /// Back `vpn` with a fresh frame from the first domain in `order` that
    /// has one. An already resident page is left where it is.
    pub fn map_new(&self, pid: Pid, vpn: Vpn, order: &[DomainId]) -> NumaResult<DomainId> {
        if let Some(domain) = self.page_domain(pid, vpn) {
            return Ok(domain);
        }
        let (domain, pfn) = order
            .iter()
            .find_map(|&d| self.alloc_frame(d).map(|pfn| (d, pfn)))
            .ok_or(NumaError::ResourceExhausted)?;
        let Some(frame) = self.frame(pfn) else {
            return Err(NumaError::ResourceExhausted);
        };

        let space = self.address_space_or_create(pid);
        let mut state = frame.lock();
        let mut pages = space.pages.write();
        if let Some(&existing) = pages.get(&vpn) {
            // Lost a race with another fault on the same page
            drop(pages);
            drop(state);
            self.free_frame(domain, pfn);
            return self
                .frame(existing)
                .map(|f| f.lock().domain)
                .ok_or(NumaError::ResourceExhausted);
        }
        pages.insert(vpn, pfn);
        state.mappings.push((pid, vpn));
        Ok(domain)
    }

    /// Map the frame behind `(src_pid, src_vpn)` into another process
    pub fn share(&self, src_pid: Pid, src_vpn: Vpn, dst_pid: Pid, dst_vpn: Vpn) -> NumaResult<()> {
        for _ in 0..RELOCATE_RETRIES {
            let pfn = self
                .translate(src_pid, src_vpn)
                .ok_or(NumaError::InvalidTarget)?;
            let frame = self.frame(pfn).ok_or(NumaError::InvalidTarget)?;
            let mut state = frame.lock();
            if !state.mappings.contains(&(src_pid, src_vpn)) {
                continue;
            }
            let space = self.address_space_or_create(dst_pid);
            let mut pages = space.pages.write();
            if pages.contains_key(&dst_vpn) {
                return Err(NumaError::NotPermitted);
            }
            pages.insert(dst_vpn, pfn);
            state.mappings.push((dst_pid, dst_vpn));
            return Ok(());
        }
        Err(NumaError::InvalidTarget)
    }

    /// Wire or unwire the frame behind a page
    pub fn set_pinned(&self, pid: Pid, vpn: Vpn, pinned: bool) -> NumaResult<()> {
        for _ in 0..RELOCATE_RETRIES {
            let pfn = self.translate(pid, vpn).ok_or(NumaError::InvalidTarget)?;
            let frame = self.frame(pfn).ok_or(NumaError::InvalidTarget)?;
            let mut state = frame.lock();
            if state.mappings.contains(&(pid, vpn)) {
                state.pinned = pinned;
                return Ok(());
            }
        }
        Err(NumaError::InvalidTarget)
    }

    /// Remove a mapping, freeing the frame when it was the last one
    pub fn unmap(&self, pid: Pid, vpn: Vpn) -> NumaResult<()> {
        for _ in 0..RELOCATE_RETRIES {
            let space = self.address_space(pid).ok_or(NumaError::InvalidTarget)?;
            let pfn = space.translate(vpn).ok_or(NumaError::InvalidTarget)?;
            let frame = self.frame(pfn).ok_or(NumaError::InvalidTarget)?;
            let mut state = frame.lock();
            let Some(pos) = state.mappings.iter().position(|&m| m == (pid, vpn)) else {
                continue;
            };
            space.pages.write().remove(&vpn);
            state.mappings.swap_remove(pos);
            if state.mappings.is_empty() {
                state.pinned = false;
                let domain = state.domain;
                drop(state);
                self.free_frame(domain, pfn);
            }
            return Ok(());
        }
        Err(NumaError::InvalidTarget)
    }

    /// Tear down a whole address space
    pub fn release_address_space(&self, pid: Pid) {
        for (vpn, _) in self.resident_pages(pid) {
            let _ = self.unmap(pid, vpn);
        }
        self.spaces.write().remove(&pid);
    }

    /// Move the page behind `(pid, vpn)` onto `target`.
    ///
    /// The copy, the ownership transfer and the rewrite of every
    /// translation pointing at the old frame happen while both frame locks
    /// are held, so nobody observes a translation whose frame disagrees
    /// with its ownership entry.
    pub fn relocate(
        &self,
        pid: Pid,
        vpn: Vpn,
        target: DomainId,
        allow_shared: bool,
    ) -> Result<DomainId, PageStatus> {
        if self.free.get(target as usize).is_none() {
            return Err(PageStatus::InvalidDomain);
        }
        for _ in 0..RELOCATE_RETRIES {
            let pfn = self.translate(pid, vpn).ok_or(PageStatus::Unmapped)?;
            let frame = self.frame(pfn).ok_or(PageStatus::Unmapped)?;
            let mut src = frame.lock();
            if !src.mappings.contains(&(pid, vpn)) {
                continue;
            }
            if src.domain == target {
                return Ok(target);
            }
            if src.pinned {
                return Err(PageStatus::Pinned);
            }
            if src.mappings.len() > 1 && !allow_shared {
                return Err(PageStatus::Shared);
            }

            let new_pfn = self.alloc_frame(target).ok_or(PageStatus::NoMemory)?;
            let Some(new_frame) = self.frame(new_pfn) else {
                return Err(PageStatus::NoMemory);
            };
            let mut dst = new_frame.lock();
            dst.mappings = core::mem::take(&mut src.mappings);
            dst.pinned = false;
            for &(owner, page) in &dst.mappings {
                if let Some(space) = self.address_space(owner) {
                    space.pages.write().insert(page, new_pfn);
                }
            }
            let old_domain = src.domain;
            drop(dst);
            drop(src);
            self.free_frame(old_domain, pfn);

            #[cfg(feature = "debug")]
            log::trace!(
                "NUMA: pid {} page {:#x} frame {:#x} -> {:#x} (domain {} -> {})",
                pid,
                vpn,
                pfn,
                new_pfn,
                old_domain,
                target
            );
            return Ok(target);
        }
        Err(PageStatus::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> PhysicalMemory {
        let topo = TopologyRegistry::builder(2)
            .with_cpus(0, &[0])
            .with_cpus(1, &[1])
            .with_memory(0, 0, 4)
            .with_memory(1, 100, 2)
            .build()
            .unwrap();
        PhysicalMemory::new(&topo)
    }

    #[test]
    fn test_map_new_falls_back() {
        let mem = memory();
        assert_eq!(mem.map_new(2, 0, &[1, 0]), Ok(1));
        assert_eq!(mem.map_new(2, 1, &[1, 0]), Ok(1));
        // Domain 1 exhausted
        assert_eq!(mem.map_new(2, 2, &[1, 0]), Ok(0));
        assert_eq!(mem.translate(2, 0), Some(100));
        assert_eq!(mem.free_frames(1), 0);
        assert_eq!(mem.map_new(2, 3, &[1]), Err(NumaError::ResourceExhausted));
        // Resident page stays put
        assert_eq!(mem.map_new(2, 0, &[0]), Ok(1));
    }

    #[test]
    fn test_relocate_updates_ownership_and_translation() {
        let mem = memory();
        mem.map_new(2, 7, &[0]).unwrap();
        let old = mem.translate(2, 7).unwrap();

        assert_eq!(mem.relocate(2, 7, 1, false), Ok(1));
        let new = mem.translate(2, 7).unwrap();
        assert_ne!(old, new);
        assert_eq!(mem.page_domain(2, 7), Some(1));

        let owner = mem.ownership(new).unwrap();
        assert_eq!(owner.domain, 1);
        assert_eq!(owner.mappings, 1);
        assert_eq!(mem.ownership(old).unwrap().mappings, 0);
        assert_eq!(mem.free_frames(0), 4);
    }

    #[test]
    fn test_relocate_failures() {
        let mem = memory();
        assert_eq!(mem.relocate(2, 0, 1, false), Err(PageStatus::Unmapped));

        mem.map_new(2, 0, &[0]).unwrap();
        assert_eq!(mem.relocate(2, 0, 5, false), Err(PageStatus::InvalidDomain));

        mem.set_pinned(2, 0, true).unwrap();
        assert_eq!(mem.relocate(2, 0, 1, false), Err(PageStatus::Pinned));
        mem.set_pinned(2, 0, false).unwrap();

        mem.share(2, 0, 3, 40).unwrap();
        assert_eq!(mem.relocate(2, 0, 1, false), Err(PageStatus::Shared));
        assert_eq!(mem.relocate(2, 0, 1, true), Ok(1));
        // Both mappings follow the frame
        assert_eq!(mem.translate(3, 40), mem.translate(2, 0));
        assert_eq!(mem.page_domain(3, 40), Some(1));
    }

    #[test]
    fn test_relocate_without_free_frames() {
        let mem = memory();
        mem.map_new(2, 0, &[1]).unwrap();
        mem.map_new(2, 1, &[1]).unwrap();
        mem.map_new(2, 2, &[0]).unwrap();
        assert_eq!(mem.relocate(2, 2, 1, false), Err(PageStatus::NoMemory));
        assert_eq!(mem.page_domain(2, 2), Some(0));
    }

    #[test]
    fn test_concurrent_relocation_of_one_frame() {
        let topo = TopologyRegistry::builder(2)
            .with_memory(0, 0, 8)
            .with_memory(1, 8, 8)
            .build()
            .unwrap();
        let mem = PhysicalMemory::new(&topo);
        mem.map_new(2, 0, &[0]).unwrap();
        mem.share(2, 0, 3, 0).unwrap();

        std::thread::scope(|s| {
            // Two movers pulling the same frame in opposite directions
            for (pid, offset) in [(2, 0u32), (3, 1u32)] {
                let mem = &mem;
                s.spawn(move || {
                    for i in 0..500u32 {
                        let target = (i + offset) % 2;
                        match mem.relocate(pid, 0, target, true) {
                            Ok(domain) => assert_eq!(domain, target),
                            Err(status) => assert_eq!(status, PageStatus::Busy),
                        }
                    }
                });
            }
            // A third process repeatedly attaches to and detaches from it
            let mem = &mem;
            s.spawn(move || {
                for vpn in 0..500 {
                    if mem.share(2, 0, 4, vpn).is_ok() {
                        assert!(mem.translate(4, vpn).is_some());
                        mem.unmap(4, vpn).unwrap();
                    }
                }
            });
            // The page never disappears from under its owners
            s.spawn(move || {
                for _ in 0..2000 {
                    assert!(mem.page_domain(2, 0).is_some());
                    assert!(mem.page_domain(3, 0).is_some());
                }
            });
        });

        let pfn = mem.translate(2, 0).unwrap();
        assert_eq!(mem.translate(3, 0), Some(pfn));
        let owner = mem.ownership(pfn).unwrap();
        assert_eq!(owner.mappings, 2);
        assert_eq!(Some(owner.domain), topo.domain_of_frame(pfn));
        assert_eq!(mem.address_space(4).map_or(0, |s| s.len()), 0);
        // Exactly one frame is in use
        assert_eq!(mem.free_frames(0) + mem.free_frames(1), 15);
    }

    #[test]
    fn test_unmap_and_release() {
        let mem = memory();
        mem.map_new(2, 0, &[0]).unwrap();
        mem.map_new(2, 1, &[0]).unwrap();
        mem.share(2, 1, 3, 1).unwrap();
        assert_eq!(mem.free_frames(0), 2);

        mem.release_address_space(2);
        assert!(mem.address_space(2).is_none());
        // The shared frame is still held by pid 3
        assert_eq!(mem.free_frames(0), 3);
        assert_eq!(mem.residency(3, 2), [1, 0]);
        assert_eq!(mem.unmap(2, 0), Err(NumaError::InvalidTarget));
    }
}
