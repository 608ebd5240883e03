//! # Kernel Object Directory
//!
//! The NUMA subsystem does not own threads, processes, cpusets or
//! interrupts. It reaches them through [`ObjectDirectory`], which also
//! carries the generic CPU affinity mechanism the subsystem builds on.
//!
//! [`ObjectTable`] is an in-memory directory for hosted use and tests.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use crate::error::{NumaError, NumaResult};
use crate::types::{CpuId, CpuSet, CpuWhich, ObjectId, Pid};

/// Cpuset identifier
pub type CpusetId = u32;

/// The root cpuset every object starts in
pub const ROOT_CPUSET: CpusetId = 0;

// ============================================================================
// RESOLVED OBJECT
// ============================================================================

/// Live object named by a `(which, id)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvedObject {
    /// A thread and the process/cpuset it belongs to
    Thread {
        /// Thread id
        tid: Pid,
        /// Owning process
        pid: Pid,
        /// Assigned cpuset
        cpuset: CpusetId,
    },
    /// A process
    Process {
        /// Process id
        pid: Pid,
        /// Assigned cpuset
        cpuset: CpusetId,
    },
    /// A cpuset
    Cpuset(CpusetId),
    /// An interrupt line
    Irq(u32),
}

impl ResolvedObject {
    /// Cpuset the object is assigned to
    pub const fn cpuset(&self) -> CpusetId {
        match *self {
            Self::Thread { cpuset, .. } | Self::Process { cpuset, .. } => cpuset,
            Self::Cpuset(id) => id,
            Self::Irq(_) => ROOT_CPUSET,
        }
    }
}

// ============================================================================
// OBJECT DIRECTORY
// ============================================================================

/// Lookup of live kernel objects plus the generic CPU affinity mechanism
pub trait ObjectDirectory: Send + Sync {
    /// Resolve `(which, id)`; `InvalidTarget` when no such object lives
    fn resolve(&self, which: CpuWhich, id: ObjectId) -> NumaResult<ResolvedObject>;

    /// Does a process or thread with this id exist?
    fn process_exists(&self, pid: Pid) -> bool;

    /// CPU the thread is currently running on
    fn current_cpu(&self, tid: Pid) -> Option<CpuId>;

    /// CPU affinity of an object
    fn cpu_affinity(&self, object: &ResolvedObject) -> NumaResult<CpuSet>;

    /// Replace the CPU affinity of an object
    fn set_cpu_affinity(&self, object: &ResolvedObject, cpus: &CpuSet) -> NumaResult<()>;
}

// ============================================================================
// OBJECT TABLE
// ============================================================================

#[derive(Debug, Clone)]
struct ThreadEntry {
    pid: Pid,
    cpuset: CpusetId,
    cpu: CpuId,
    cpus: CpuSet,
}

#[derive(Debug, Clone)]
struct ProcessEntry {
    cpuset: CpusetId,
    threads: Vec<Pid>,
}

#[derive(Debug, Default)]
struct TableInner {
    threads: HashMap<Pid, ThreadEntry>,
    processes: HashMap<Pid, ProcessEntry>,
    cpusets: HashMap<CpusetId, CpuSet>,
    irqs: HashMap<u32, CpuSet>,
}

/// In-memory object directory
#[derive(Debug)]
pub struct ObjectTable {
    all_cpus: CpuSet,
    inner: RwLock<TableInner>,
}

impl ObjectTable {
    /// Create a table whose root cpuset holds `all_cpus`
    pub fn new(all_cpus: CpuSet) -> Self {
        let mut inner = TableInner::default();
        inner.cpusets.insert(ROOT_CPUSET, all_cpus);
        Self {
            all_cpus,
            inner: RwLock::new(inner),
        }
    }

    /// Create a process whose main thread (`tid == pid`) runs on `cpu`
    pub fn spawn_process(&self, pid: Pid, cpu: CpuId) -> NumaResult<()> {
        let mut inner = self.inner.write();
        if pid < 0 || inner.processes.contains_key(&pid) || inner.threads.contains_key(&pid) {
            return Err(NumaError::NotPermitted);
        }
        inner.processes.insert(
            pid,
            ProcessEntry {
                cpuset: ROOT_CPUSET,
                threads: Vec::new(),
            },
        );
        drop(inner);
        self.spawn_thread(pid, pid, cpu)
    }

    /// Add a thread to an existing process
    pub fn spawn_thread(&self, pid: Pid, tid: Pid, cpu: CpuId) -> NumaResult<()> {
        let mut inner = self.inner.write();
        if inner.threads.contains_key(&tid) {
            return Err(NumaError::NotPermitted);
        }
        let cpuset = inner
            .processes
            .get(&pid)
            .map(|p| p.cpuset)
            .ok_or(NumaError::InvalidTarget)?;
        let cpus = inner.cpusets.get(&cpuset).copied().unwrap_or(self.all_cpus);
        inner.threads.insert(
            tid,
            ThreadEntry {
                pid,
                cpuset,
                cpu,
                cpus,
            },
        );
        if let Some(process) = inner.processes.get_mut(&pid) {
            process.threads.push(tid);
        }
        Ok(())
    }

    /// Remove a thread
    pub fn exit_thread(&self, tid: Pid) {
        let mut inner = self.inner.write();
        if let Some(thread) = inner.threads.remove(&tid) {
            if let Some(process) = inner.processes.get_mut(&thread.pid) {
                process.threads.retain(|&t| t != tid);
            }
        }
    }

    /// Remove a process and all its threads
    pub fn exit_process(&self, pid: Pid) {
        let mut inner = self.inner.write();
        if let Some(process) = inner.processes.remove(&pid) {
            for tid in process.threads {
                inner.threads.remove(&tid);
            }
        }
    }

    /// Create a cpuset
    pub fn create_cpuset(&self, id: CpusetId, cpus: CpuSet) -> NumaResult<()> {
        self.check_cpus(&cpus)?;
        self.inner.write().cpusets.insert(id, cpus);
        Ok(())
    }

    /// Move a process and its threads into a cpuset
    pub fn assign_cpuset(&self, pid: Pid, cpuset: CpusetId) -> NumaResult<()> {
        let mut inner = self.inner.write();
        let cpus = *inner.cpusets.get(&cpuset).ok_or(NumaError::InvalidTarget)?;
        let threads = {
            let process = inner.processes.get_mut(&pid).ok_or(NumaError::InvalidTarget)?;
            process.cpuset = cpuset;
            process.threads.clone()
        };
        for tid in threads {
            if let Some(thread) = inner.threads.get_mut(&tid) {
                thread.cpuset = cpuset;
                Self::apply_thread_mask(thread, cpus);
            }
        }
        Ok(())
    }

    /// Register an interrupt line
    pub fn add_irq(&self, irq: u32) {
        self.inner.write().irqs.insert(irq, self.all_cpus);
    }

    /// Threads of a process
    pub fn threads_of(&self, pid: Pid) -> Vec<Pid> {
        self.inner
            .read()
            .processes
            .get(&pid)
            .map(|p| p.threads.clone())
            .unwrap_or_default()
    }

    fn check_cpus(&self, cpus: &CpuSet) -> NumaResult<()> {
        if cpus.is_empty() || cpus.union(&self.all_cpus) != self.all_cpus {
            Err(NumaError::InvalidCpuSet)
        } else {
            Ok(())
        }
    }

    /// A thread leaving its allowed set is rescheduled onto the lowest allowed CPU
    fn apply_thread_mask(thread: &mut ThreadEntry, cpus: CpuSet) {
        thread.cpus = cpus;
        if !cpus.contains(thread.cpu) {
            if let Some(cpu) = cpus.first() {
                thread.cpu = cpu;
            }
        }
    }
}

impl ObjectDirectory for ObjectTable {
    fn resolve(&self, which: CpuWhich, id: ObjectId) -> NumaResult<ResolvedObject> {
        let inner = self.inner.read();
        match which {
            CpuWhich::Tid => {
                let tid = Pid::try_from(id).map_err(|_| NumaError::InvalidTarget)?;
                let thread = inner.threads.get(&tid).ok_or(NumaError::InvalidTarget)?;
                Ok(ResolvedObject::Thread {
                    tid,
                    pid: thread.pid,
                    cpuset: thread.cpuset,
                })
            },
            CpuWhich::Pid => {
                let pid = Pid::try_from(id).map_err(|_| NumaError::InvalidTarget)?;
                let process = inner.processes.get(&pid).ok_or(NumaError::InvalidTarget)?;
                Ok(ResolvedObject::Process {
                    pid,
                    cpuset: process.cpuset,
                })
            },
            CpuWhich::Cpuset => {
                let cpuset = CpusetId::try_from(id).map_err(|_| NumaError::InvalidTarget)?;
                if inner.cpusets.contains_key(&cpuset) {
                    Ok(ResolvedObject::Cpuset(cpuset))
                } else {
                    Err(NumaError::InvalidTarget)
                }
            },
            CpuWhich::Irq => {
                let irq = u32::try_from(id).map_err(|_| NumaError::InvalidTarget)?;
                if inner.irqs.contains_key(&irq) {
                    Ok(ResolvedObject::Irq(irq))
                } else {
                    Err(NumaError::InvalidTarget)
                }
            },
        }
    }

    fn process_exists(&self, pid: Pid) -> bool {
        let inner = self.inner.read();
        inner.processes.contains_key(&pid) || inner.threads.contains_key(&pid)
    }

    fn current_cpu(&self, tid: Pid) -> Option<CpuId> {
        self.inner.read().threads.get(&tid).map(|t| t.cpu)
    }

    fn cpu_affinity(&self, object: &ResolvedObject) -> NumaResult<CpuSet> {
        let inner = self.inner.read();
        let cpus = match *object {
            ResolvedObject::Thread { tid, .. } => inner.threads.get(&tid).map(|t| t.cpus),
            ResolvedObject::Process { pid, .. } => inner
                .processes
                .get(&pid)
                .and_then(|p| p.threads.first())
                .and_then(|tid| inner.threads.get(tid))
                .map(|t| t.cpus),
            ResolvedObject::Cpuset(id) => inner.cpusets.get(&id).copied(),
            ResolvedObject::Irq(irq) => inner.irqs.get(&irq).copied(),
        };
        cpus.ok_or(NumaError::InvalidTarget)
    }

    fn set_cpu_affinity(&self, object: &ResolvedObject, cpus: &CpuSet) -> NumaResult<()> {
        self.check_cpus(cpus)?;
        let mut inner = self.inner.write();
        match *object {
            ResolvedObject::Thread { tid, .. } => {
                let thread = inner.threads.get_mut(&tid).ok_or(NumaError::InvalidTarget)?;
                Self::apply_thread_mask(thread, *cpus);
            },
            ResolvedObject::Process { pid, .. } => {
                let threads = inner
                    .processes
                    .get(&pid)
                    .map(|p| p.threads.clone())
                    .ok_or(NumaError::InvalidTarget)?;
                for tid in threads {
                    if let Some(thread) = inner.threads.get_mut(&tid) {
                        Self::apply_thread_mask(thread, *cpus);
                    }
                }
            },
            ResolvedObject::Cpuset(id) => {
                let set = inner.cpusets.get_mut(&id).ok_or(NumaError::InvalidTarget)?;
                *set = *cpus;
            },
            ResolvedObject::Irq(irq) => {
                let set = inner.irqs.get_mut(&irq).ok_or(NumaError::InvalidTarget)?;
                *set = *cpus;
            },
        }
        log::debug!("NUMA: cpu affinity of {:?} set to {:?}", object, cpus);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ObjectTable {
        let table = ObjectTable::new(CpuSet::first_n(4));
        table.spawn_process(10, 3).unwrap();
        table.spawn_thread(10, 11, 0).unwrap();
        table
    }

    #[test]
    fn test_resolve_kinds() {
        let table = table();
        table.add_irq(5);
        assert_eq!(
            table.resolve(CpuWhich::Tid, 11),
            Ok(ResolvedObject::Thread {
                tid: 11,
                pid: 10,
                cpuset: ROOT_CPUSET
            })
        );
        assert!(table.resolve(CpuWhich::Pid, 10).is_ok());
        assert_eq!(table.resolve(CpuWhich::Pid, 11), Err(NumaError::InvalidTarget));
        assert!(table.resolve(CpuWhich::Cpuset, 0).is_ok());
        assert!(table.resolve(CpuWhich::Irq, 5).is_ok());
        assert_eq!(table.resolve(CpuWhich::Irq, 6), Err(NumaError::InvalidTarget));
        assert_eq!(
            table.resolve(CpuWhich::Tid, i64::MAX),
            Err(NumaError::InvalidTarget)
        );
    }

    #[test]
    fn test_affinity_reschedules_thread() {
        let table = table();
        let thread = table.resolve(CpuWhich::Tid, 10).unwrap();
        assert_eq!(table.current_cpu(10), Some(3));

        let cpus: CpuSet = [1, 2].into_iter().collect();
        table.set_cpu_affinity(&thread, &cpus).unwrap();
        assert_eq!(table.current_cpu(10), Some(1));
        assert_eq!(table.cpu_affinity(&thread), Ok(cpus));
        // The sibling thread is untouched
        assert_eq!(table.current_cpu(11), Some(0));
    }

    #[test]
    fn test_affinity_rejects_bad_sets() {
        let table = table();
        let thread = table.resolve(CpuWhich::Tid, 10).unwrap();
        assert_eq!(
            table.set_cpu_affinity(&thread, &CpuSet::new()),
            Err(NumaError::InvalidCpuSet)
        );
        assert_eq!(
            table.set_cpu_affinity(&thread, &CpuSet::single(9)),
            Err(NumaError::InvalidCpuSet)
        );
    }

    #[test]
    fn test_exit_process() {
        let table = table();
        assert!(table.process_exists(11));
        table.exit_process(10);
        assert!(!table.process_exists(10));
        assert!(!table.process_exists(11));
        assert_eq!(table.resolve(CpuWhich::Tid, 11), Err(NumaError::InvalidTarget));
    }

    #[test]
    fn test_cpuset_assignment() {
        let table = table();
        table.create_cpuset(7, [2, 3].into_iter().collect()).unwrap();
        table.assign_cpuset(10, 7).unwrap();
        assert_eq!(table.resolve(CpuWhich::Tid, 11).unwrap().cpuset(), 7);
        assert_eq!(table.current_cpu(11), Some(2));
        assert_eq!(table.threads_of(10), [10, 11]);
    }
}
