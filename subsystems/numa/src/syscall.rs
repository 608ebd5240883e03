//! # NUMA Syscalls
//!
//! Raw integer entry points. Every call returns `0` (or a count) on
//! success and `-errno` on failure; nothing else crosses this boundary.

use crate::error::{NumaError, NumaResult};
use crate::migration::MoveFlags;
use crate::topology::Weight;
use crate::types::{
    AffinityTarget, CpuSet, CpuWhich, DomainMask, MemoryPolicy, ObjectId, Pid, ID_SELF,
};
use crate::NumaKernel;

/// Caller identity of the syscall being served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallContext {
    /// Calling process
    pub pid: Pid,
    /// Calling thread
    pub tid: Pid,
}

impl SyscallContext {
    /// Context of thread `tid` in process `pid`
    pub const fn new(pid: Pid, tid: Pid) -> Self {
        Self { pid, tid }
    }

    /// Replace `-1` with the caller for thread and process targets
    fn object_id(&self, which: CpuWhich, id: ObjectId) -> ObjectId {
        match which {
            CpuWhich::Tid if id == ID_SELF => self.tid as ObjectId,
            CpuWhich::Pid if id == ID_SELF => self.pid as ObjectId,
            _ => id,
        }
    }

    /// `0` names the calling process in migration calls
    fn process(&self, pid: Pid) -> Pid {
        if pid == 0 { self.pid } else { pid }
    }
}

fn ret(result: NumaResult<i32>) -> i32 {
    result.unwrap_or_else(|e| e.as_return())
}

fn ret_count(result: NumaResult<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => e.as_return() as isize,
    }
}

/// Decode level/which and resolve the id, in that order
fn decode_target(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    level: i32,
    which: i32,
    id: ObjectId,
) -> NumaResult<AffinityTarget> {
    kernel.topology().ensure_available()?;
    let mut target = AffinityTarget::decode(level, which, id)?;
    target.id = ctx.object_id(target.which, id);
    kernel.control().resolve(&target)?;
    Ok(target)
}

/// Number of mask words a `setsize` in bytes covers
fn mask_words(kernel: &NumaKernel, setsize: usize, available: usize) -> NumaResult<usize> {
    if setsize % 8 != 0 || setsize / 8 > available {
        return Err(NumaError::InvalidCount);
    }
    if setsize * 8 < kernel.topology().domain_count() {
        return Err(NumaError::BufferTooSmall);
    }
    Ok(setsize / 8)
}

// ============================================================================
// AFFINITY
// ============================================================================

/// `cpuset_get_memory_affinity(level, which, id, setsize, mask, policy)`
pub fn sys_cpuset_get_memory_affinity(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    level: i32,
    which: i32,
    id: ObjectId,
    setsize: usize,
    mask: &mut [u64],
    policy: &mut i32,
) -> i32 {
    ret((|| -> NumaResult<i32> {
        let target = decode_target(kernel, ctx, level, which, id)?;
        let words = mask_words(kernel, setsize, mask.len())?;
        let record = kernel.control().get_memory_affinity(&target)?;
        record.mask.to_words(&mut mask[..words]);
        *policy = record.policy as i32;
        Ok(0)
    })())
}

/// `cpuset_set_memory_affinity(level, which, id, setsize, mask, policy)`
///
/// Checked in order: level, which, id, mask, policy. The record is only
/// touched once everything has passed.
pub fn sys_cpuset_set_memory_affinity(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    level: i32,
    which: i32,
    id: ObjectId,
    setsize: usize,
    mask: &[u64],
    policy: i32,
) -> i32 {
    ret((|| -> NumaResult<i32> {
        let target = decode_target(kernel, ctx, level, which, id)?;
        let words = mask_words(kernel, setsize, mask.len())?;
        let mask = DomainMask::from_words(&mask[..words], words * 64)?;
        kernel.topology().check_mask(mask)?;
        let policy = MemoryPolicy::try_from(policy)?;
        kernel.control().set_memory_affinity(&target, mask, policy)?;
        Ok(0)
    })())
}

/// `cpuset_setaffinity(level, which, id, cpus)`
pub fn sys_cpuset_setaffinity(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    level: i32,
    which: i32,
    id: ObjectId,
    cpus: &CpuSet,
) -> i32 {
    ret((|| -> NumaResult<i32> {
        let mut target = AffinityTarget::decode(level, which, id)?;
        target.id = ctx.object_id(target.which, id);
        kernel.control().set_cpu_affinity(&target, cpus)?;
        Ok(0)
    })())
}

/// `cpuset_getaffinity(level, which, id, cpus)`
pub fn sys_cpuset_getaffinity(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    level: i32,
    which: i32,
    id: ObjectId,
    cpus: &mut CpuSet,
) -> i32 {
    ret((|| -> NumaResult<i32> {
        let mut target = AffinityTarget::decode(level, which, id)?;
        target.id = ctx.object_id(target.which, id);
        *cpus = kernel.control().get_cpu_affinity(&target)?;
        Ok(0)
    })())
}

/// `kill(pid, 0)`: `0` if the process or thread exists
pub fn sys_probe_process(kernel: &NumaKernel, pid: Pid) -> i32 {
    if pid > 0 && kernel.directory().process_exists(pid) {
        0
    } else {
        NumaError::InvalidTarget.as_return()
    }
}

// ============================================================================
// MIGRATION
// ============================================================================

/// `move_pages(pid, count, pages, nodes, status, flags)`
///
/// Returns the number of pages that could not be moved. `nodes == None`
/// only reports where each page lives.
pub fn sys_move_pages(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    pid: Pid,
    count: usize,
    pages: &[u64],
    nodes: Option<&[i32]>,
    status: &mut [i32],
    flags: i32,
) -> isize {
    ret_count((|| -> NumaResult<usize> {
        let flags = MoveFlags::from_raw(flags)?;
        if count > kernel.config().max_move_pages {
            return Err(NumaError::InvalidCount);
        }
        if pages.len() < count
            || status.len() < count
            || nodes.is_some_and(|n| n.len() < count)
        {
            return Err(NumaError::InvalidCount);
        }
        let report = kernel.migration().move_pages(
            ctx.process(pid),
            &pages[..count],
            nodes.map(|n| &n[..count]),
            flags,
        )?;
        for (slot, page) in status.iter_mut().zip(report.statuses.iter()) {
            *slot = page.code();
        }
        Ok(report.failed)
    })())
}

/// `migrate_pages(pid, maxnode, old_nodes, new_nodes)`
///
/// Returns the [`MigrateOutcome`](crate::MigrateOutcome) code.
pub fn sys_migrate_pages(
    kernel: &NumaKernel,
    ctx: &SyscallContext,
    pid: Pid,
    maxnode: usize,
    old_nodes: &[u64],
    new_nodes: &[u64],
) -> i32 {
    ret((|| -> NumaResult<i32> {
        let old = DomainMask::from_words(old_nodes, maxnode)?;
        let new = DomainMask::from_words(new_nodes, maxnode)?;
        let report = kernel.migration().migrate_pages(ctx.process(pid), old, new)?;
        Ok(report.outcome.code())
    })())
}

// ============================================================================
// TOPOLOGY
// ============================================================================

/// Data returned by `get_numa_topology`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TopologySelection {
    /// CPU set of each domain
    Cpus   = 1,
    /// Row-major weight matrix
    Weight = 2,
}

impl TryFrom<i32> for TopologySelection {
    type Error = NumaError;

    fn try_from(value: i32) -> Result<Self, NumaError> {
        match value {
            1 => Ok(Self::Cpus),
            2 => Ok(Self::Weight),
            _ => Err(NumaError::InvalidWhich),
        }
    }
}

/// Output of a topology query
#[derive(Debug)]
pub enum TopologyBuffer<'a> {
    /// Size probe: only the domain count is returned
    Probe,
    /// One CPU set per domain
    Cpus(&'a mut [CpuSet]),
    /// `domain_count * domain_count` weights
    Weights(&'a mut [Weight]),
}

/// CPU set of every domain. `None` probes for the domain count.
pub fn sys_get_numa_cpus(kernel: &NumaKernel, out: Option<&mut [CpuSet]>) -> isize {
    let topology = kernel.topology();
    let n = topology.domain_count();
    let Some(out) = out else {
        return n as isize;
    };
    ret_count((|| -> NumaResult<usize> {
        topology.ensure_available()?;
        if out.len() < n {
            return Err(NumaError::BufferTooSmall);
        }
        for (slot, domain) in out.iter_mut().zip(topology.domains()) {
            *slot = domain.cpus;
        }
        Ok(n)
    })())
}

/// Weight matrix, row-major. `None` probes for the domain count.
pub fn sys_get_numa_weights(kernel: &NumaKernel, out: Option<&mut [Weight]>) -> isize {
    let topology = kernel.topology();
    let n = topology.domain_count();
    let Some(out) = out else {
        return n as isize;
    };
    ret_count((|| -> NumaResult<usize> {
        topology.ensure_available()?;
        let matrix = topology.weight_matrix();
        if out.len() < matrix.len() {
            return Err(NumaError::BufferTooSmall);
        }
        out[..matrix.len()].copy_from_slice(matrix);
        Ok(n)
    })())
}

/// `get_numa_topology(buffer, length, selection)`
pub fn sys_get_numa_topology(
    kernel: &NumaKernel,
    selection: i32,
    buffer: TopologyBuffer<'_>,
) -> isize {
    let selection = match TopologySelection::try_from(selection) {
        Ok(selection) => selection,
        Err(e) => return e.as_return() as isize,
    };
    match (selection, buffer) {
        (_, TopologyBuffer::Probe) => kernel.topology().domain_count() as isize,
        (TopologySelection::Cpus, TopologyBuffer::Cpus(out)) => sys_get_numa_cpus(kernel, Some(out)),
        (TopologySelection::Weight, TopologyBuffer::Weights(out)) => {
            sys_get_numa_weights(kernel, Some(out))
        },
        _ => NumaError::InvalidWhich.as_return() as isize,
    }
}
