//! # Affinity State Store
//!
//! Per-object memory affinity records. Each record sits behind its own
//! lock and is always replaced whole, so a reader sees either the old
//! mask/policy pair or the new one, never a mix. Different objects never
//! contend beyond the brief directory lookup.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::directory::{CpusetId, ObjectDirectory, ResolvedObject};
use crate::error::{NumaError, NumaResult};
use crate::types::{AffinityTarget, CpuLevel, DomainId, DomainMask, MemoryPolicy, Pid};

// ============================================================================
// AFFINITY RECORD
// ============================================================================

/// Memory affinity of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityRecord {
    /// Domains the object allocates from
    pub mask: DomainMask,
    /// Strategy within the mask
    pub policy: MemoryPolicy,
}

impl AffinityRecord {
    /// Create a record
    pub const fn new(mask: DomainMask, policy: MemoryPolicy) -> Self {
        Self { mask, policy }
    }

    /// Default record: every domain, nearest first
    pub const fn default_for(domain_count: usize) -> Self {
        Self::new(DomainMask::first_n(domain_count), MemoryPolicy::Nearest)
    }
}

// ============================================================================
// AFFINITY KEY
// ============================================================================

/// Canonical storage key a target resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffinityKey {
    /// The root set
    Root,
    /// A cpuset
    Cpuset(CpusetId),
    /// A thread
    Thread(Pid),
    /// A process
    Process(Pid),
    /// An interrupt line
    Irq(u32),
}

impl ResolvedObject {
    /// Process owning the object
    const fn owner(&self) -> Option<Pid> {
        match *self {
            ResolvedObject::Thread { pid, .. } | ResolvedObject::Process { pid, .. } => Some(pid),
            ResolvedObject::Cpuset(_) | ResolvedObject::Irq(_) => None,
        }
    }
}

impl AffinityKey {
    /// Key for `object` seen at `level`
    pub const fn for_object(level: CpuLevel, object: &ResolvedObject) -> Self {
        match level {
            CpuLevel::Root => Self::Root,
            CpuLevel::Cpuset => Self::Cpuset(object.cpuset()),
            CpuLevel::Which => match *object {
                ResolvedObject::Thread { tid, .. } => Self::Thread(tid),
                ResolvedObject::Process { pid, .. } => Self::Process(pid),
                ResolvedObject::Cpuset(id) => Self::Cpuset(id),
                ResolvedObject::Irq(irq) => Self::Irq(irq),
            },
        }
    }
}

// ============================================================================
// AFFINITY ENTRY
// ============================================================================

#[derive(Debug)]
struct EntryState {
    record: AffinityRecord,
    /// Last domain handed out by interleave
    last_interleave: Option<DomainId>,
}

/// Locked slot holding one record
#[derive(Debug)]
pub struct AffinityEntry {
    /// Process the object belongs to, for threads and processes
    owner: Option<Pid>,
    state: Mutex<EntryState>,
}

impl AffinityEntry {
    fn new(record: AffinityRecord, owner: Option<Pid>) -> Self {
        Self {
            owner,
            state: Mutex::new(EntryState {
                record,
                last_interleave: None,
            }),
        }
    }

    /// Owning process, if any
    pub fn owner(&self) -> Option<Pid> {
        self.owner
    }

    /// Current record
    pub fn record(&self) -> AffinityRecord {
        self.state.lock().record
    }

    /// Record plus the domain interleave should start from.
    ///
    /// For `Interleave` the cursor advances to the next mask domain in
    /// ascending order, wrapping around; for `Nearest` the cursor is left
    /// alone and `None` is returned.
    pub fn claim_next(&self) -> (AffinityRecord, Option<DomainId>) {
        let mut state = self.state.lock();
        let record = state.record;
        match record.policy {
            MemoryPolicy::Nearest => (record, None),
            MemoryPolicy::Interleave => {
                let next = match state.last_interleave {
                    Some(last) => record.mask.next_after(last),
                    None => record.mask.first(),
                };
                state.last_interleave = next;
                (record, next)
            },
        }
    }

    fn replace(&self, record: AffinityRecord) {
        let mut state = self.state.lock();
        state.record = record;
        state.last_interleave = None;
    }
}

// ============================================================================
// AFFINITY STORE
// ============================================================================

/// Table of affinity records keyed by object
pub struct AffinityStore {
    domain_count: usize,
    directory: Arc<dyn ObjectDirectory>,
    entries: RwLock<HashMap<AffinityKey, Arc<AffinityEntry>>>,
}

impl core::fmt::Debug for AffinityStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AffinityStore")
            .field("domain_count", &self.domain_count)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl AffinityStore {
    /// Create an empty store
    pub fn new(domain_count: usize, directory: Arc<dyn ObjectDirectory>) -> Self {
        Self {
            domain_count,
            directory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a target to its live object and storage key
    pub fn resolve(&self, target: &AffinityTarget) -> NumaResult<(ResolvedObject, AffinityKey)> {
        let object = self.directory.resolve(target.which, target.id)?;
        Ok((object, AffinityKey::for_object(target.level, &object)))
    }

    /// Current record of the target.
    ///
    /// An object without a record of its own reports the record it
    /// inherits (see [`effective`](Self::effective)), or the default
    /// all-domains/NEAREST record. Reading never creates a record.
    pub fn get(&self, target: &AffinityTarget) -> NumaResult<AffinityRecord> {
        let (object, key) = self.resolve(target)?;
        let chain = Self::chain(&object);
        let start = chain.iter().position(|k| *k == key).unwrap_or(chain.len());
        let entries = self.entries.read();
        let inherited = core::iter::once(&key)
            .chain(chain.iter().skip(start + 1))
            .find_map(|k| entries.get(k).map(|e| e.record()));
        Ok(inherited.unwrap_or_else(|| AffinityRecord::default_for(self.domain_count)))
    }

    /// Replace the record as a unit
    pub fn set(&self, target: &AffinityTarget, record: AffinityRecord) -> NumaResult<()> {
        let (object, key) = self.resolve(target)?;
        self.validate(&record)?;
        let owner = match key {
            AffinityKey::Thread(_) | AffinityKey::Process(_) => object.owner(),
            _ => None,
        };
        self.entry(key, owner).replace(record);
        log::debug!(
            "NUMA: memory affinity of {:?} set to {:?}/{:?}",
            key,
            record.mask,
            record.policy
        );
        Ok(())
    }

    /// Check a record against the topology
    pub fn validate(&self, record: &AffinityRecord) -> NumaResult<()> {
        if self.domain_count == 0 {
            return Err(NumaError::Unavailable);
        }
        if record.mask.is_empty() || !record.mask.fits(self.domain_count) {
            return Err(NumaError::InvalidDomainMask);
        }
        Ok(())
    }

    fn entry(&self, key: AffinityKey, owner: Option<Pid>) -> Arc<AffinityEntry> {
        if let Some(entry) = self.lookup(key) {
            return entry;
        }
        let default = AffinityRecord::default_for(self.domain_count);
        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(AffinityEntry::new(default, owner)))
            .clone()
    }

    /// Entry for `key` without creating one
    pub fn lookup(&self, key: AffinityKey) -> Option<Arc<AffinityEntry>> {
        self.entries.read().get(&key).cloned()
    }

    /// Keys consulted for `object`, most specific first
    fn chain(object: &ResolvedObject) -> Vec<AffinityKey> {
        let mut chain: Vec<AffinityKey> = Vec::with_capacity(4);
        match *object {
            ResolvedObject::Thread { tid, pid, .. } => {
                chain.push(AffinityKey::Thread(tid));
                chain.push(AffinityKey::Process(pid));
            },
            ResolvedObject::Process { pid, .. } => chain.push(AffinityKey::Process(pid)),
            ResolvedObject::Irq(irq) => chain.push(AffinityKey::Irq(irq)),
            ResolvedObject::Cpuset(_) => {},
        }
        chain.push(AffinityKey::Cpuset(object.cpuset()));
        chain.push(AffinityKey::Root);
        chain
    }

    /// Entry governing allocations by `object`.
    ///
    /// The most specific existing record wins: the thread, its process,
    /// its cpuset, then the root set.
    pub fn effective(&self, object: &ResolvedObject) -> Option<Arc<AffinityEntry>> {
        let chain = Self::chain(object);
        let entries = self.entries.read();
        chain.iter().find_map(|key| entries.get(key).cloned())
    }

    /// Drop the record of a destroyed object
    pub fn remove(&self, key: AffinityKey) {
        if self.entries.write().remove(&key).is_some() {
            log::trace!("NUMA: dropped affinity record {:?}", key);
        }
    }

    /// Drop the records of a destroyed process and of all its threads
    pub fn remove_process(&self, pid: Pid) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, entry| match key {
            AffinityKey::Process(p) => *p != pid,
            AffinityKey::Thread(_) => entry.owner != Some(pid),
            _ => true,
        });
        let dropped = before - entries.len();
        if dropped > 0 {
            log::trace!("NUMA: dropped {} affinity record(s) of pid {}", dropped, pid);
        }
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No records held?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
