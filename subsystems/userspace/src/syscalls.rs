//! # NUMA Syscall Boundary
//!
//! The integer-coded calls the library is built on. [`KernelGate`] serves
//! them straight from an in-process [`NumaKernel`].

use helix_numa::config::DEFAULT_RESERVED_PID_FLOOR;
use helix_numa::syscall::{self, SyscallContext};
use helix_numa::topology::Weight;
use helix_numa::types::ObjectId;
use helix_numa::{CpuSet, NumaKernel, Pid};

/// NUMA syscalls as seen from userspace
///
/// Each call returns `0` or a count on success and `-errno` on failure.
pub trait NumaSyscalls {
    /// Per-domain CPU sets; `None` returns the domain count only
    fn get_numa_cpus(&self, out: Option<&mut [CpuSet]>) -> isize;

    /// Row-major weight matrix; `None` returns the domain count only
    fn get_numa_weights(&self, out: Option<&mut [Weight]>) -> isize;

    /// `0` if the process exists
    fn probe_process(&self, pid: Pid) -> i32;

    /// Lowest pid the kernel lets callers target
    fn reserved_pid_floor(&self) -> Pid {
        DEFAULT_RESERVED_PID_FLOOR
    }

    /// Replace an object's CPU affinity
    fn cpuset_setaffinity(&self, level: i32, which: i32, id: ObjectId, cpus: &CpuSet) -> i32;

    /// Read an object's CPU affinity
    fn cpuset_getaffinity(&self, level: i32, which: i32, id: ObjectId, cpus: &mut CpuSet) -> i32;

    /// Read an object's memory affinity
    fn cpuset_get_memory_affinity(
        &self,
        level: i32,
        which: i32,
        id: ObjectId,
        setsize: usize,
        mask: &mut [u64],
        policy: &mut i32,
    ) -> i32;

    /// Replace an object's memory affinity
    fn cpuset_set_memory_affinity(
        &self,
        level: i32,
        which: i32,
        id: ObjectId,
        setsize: usize,
        mask: &[u64],
        policy: i32,
    ) -> i32;

    /// Relocate individual pages
    fn move_pages(
        &self,
        pid: Pid,
        count: usize,
        pages: &[u64],
        nodes: Option<&[i32]>,
        status: &mut [i32],
        flags: i32,
    ) -> isize;

    /// Relocate every page found on the old domains
    fn migrate_pages(&self, pid: Pid, maxnode: usize, old_nodes: &[u64], new_nodes: &[u64]) -> i32;
}

/// Syscalls served directly by a kernel instance on behalf of one caller
#[derive(Debug, Clone, Copy)]
pub struct KernelGate<'k> {
    kernel: &'k NumaKernel,
    ctx: SyscallContext,
}

impl<'k> KernelGate<'k> {
    /// Gate for thread `tid` of process `pid`
    pub fn new(kernel: &'k NumaKernel, pid: Pid, tid: Pid) -> Self {
        Self {
            kernel,
            ctx: SyscallContext::new(pid, tid),
        }
    }

    /// The kernel behind the gate
    pub fn kernel(&self) -> &'k NumaKernel {
        self.kernel
    }
}

impl NumaSyscalls for KernelGate<'_> {
    fn get_numa_cpus(&self, out: Option<&mut [CpuSet]>) -> isize {
        syscall::sys_get_numa_cpus(self.kernel, out)
    }

    fn get_numa_weights(&self, out: Option<&mut [Weight]>) -> isize {
        syscall::sys_get_numa_weights(self.kernel, out)
    }

    fn probe_process(&self, pid: Pid) -> i32 {
        syscall::sys_probe_process(self.kernel, pid)
    }

    fn reserved_pid_floor(&self) -> Pid {
        self.kernel.config().reserved_pid_floor
    }

    fn cpuset_setaffinity(&self, level: i32, which: i32, id: ObjectId, cpus: &CpuSet) -> i32 {
        syscall::sys_cpuset_setaffinity(self.kernel, &self.ctx, level, which, id, cpus)
    }

    fn cpuset_getaffinity(&self, level: i32, which: i32, id: ObjectId, cpus: &mut CpuSet) -> i32 {
        syscall::sys_cpuset_getaffinity(self.kernel, &self.ctx, level, which, id, cpus)
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
        syscall::sys_cpuset_get_memory_affinity(
            self.kernel,
            &self.ctx,
            level,
            which,
            id,
            setsize,
            mask,
            policy,
        )
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
        syscall::sys_cpuset_set_memory_affinity(
            self.kernel,
            &self.ctx,
            level,
            which,
            id,
            setsize,
            mask,
            policy,
        )
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
        syscall::sys_move_pages(self.kernel, &self.ctx, pid, count, pages, nodes, status, flags)
    }

    fn migrate_pages(&self, pid: Pid, maxnode: usize, old_nodes: &[u64], new_nodes: &[u64]) -> i32 {
        syscall::sys_migrate_pages(self.kernel, &self.ctx, pid, maxnode, old_nodes, new_nodes)
    }
}
