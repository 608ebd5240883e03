//! Core NUMA types: identifiers, domain and CPU sets, policies and targets.

use core::fmt;

use crate::error::NumaError;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// NUMA domain identifier (`0 <= id < domain_count`)
pub type DomainId = u32;

/// CPU identifier
pub type CpuId = u32;

/// Process / thread identifier as seen at the kernel boundary
pub type Pid = i32;

/// Identifier of the object named by an affinity target
pub type ObjectId = i64;

/// Physical frame number
pub type Pfn = u64;

/// Virtual page number (virtual address / page size)
pub type Vpn = u64;

/// Maximum number of NUMA domains
pub const MAX_DOMAINS: usize = 64;

/// Maximum number of CPUs
pub const MAX_CPUS: usize = 256;

/// Number of 64-bit words in a [`CpuSet`]
pub const CPUSET_WORDS: usize = MAX_CPUS / 64;

/// Object id meaning "the calling thread/process"
pub const ID_SELF: ObjectId = -1;

static_assertions::const_assert!(MAX_DOMAINS <= u64::BITS as usize);
static_assertions::const_assert_eq!(MAX_CPUS % 64, 0);

// ============================================================================
// DOMAIN MASK
// ============================================================================

/// Set of NUMA domains, one bit per domain
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DomainMask(u64);

impl DomainMask {
    /// Empty mask
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with exactly one domain
    pub const fn single(domain: DomainId) -> Self {
        if (domain as usize) < MAX_DOMAINS {
            Self(1 << domain)
        } else {
            Self(0)
        }
    }

    /// Mask with domains `0..count`
    pub const fn first_n(count: usize) -> Self {
        if count >= MAX_DOMAINS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Decode a user-supplied word array holding `maxnode` meaningful bits.
    ///
    /// Bits at or above `maxnode` are ignored. A set bit at or above
    /// [`MAX_DOMAINS`] is rejected.
    pub fn from_words(words: &[u64], maxnode: usize) -> Result<Self, NumaError> {
        if maxnode > words.len() * 64 {
            return Err(NumaError::InvalidCount);
        }
        let mut bits = 0u64;
        for (i, &word) in words.iter().enumerate() {
            let base = i * 64;
            if base >= maxnode {
                break;
            }
            let live = maxnode - base;
            let word = if live < 64 {
                word & ((1u64 << live) - 1)
            } else {
                word
            };
            if i == 0 {
                bits = word;
            } else if word != 0 {
                return Err(NumaError::InvalidDomainMask);
            }
        }
        Ok(Self(bits))
    }

    /// Encode into a user word array, zeroing the tail
    pub fn to_words(&self, words: &mut [u64]) {
        for (i, word) in words.iter_mut().enumerate() {
            *word = if i == 0 { self.0 } else { 0 };
        }
    }

    /// Is the domain set?
    pub const fn contains(&self, domain: DomainId) -> bool {
        (domain as usize) < MAX_DOMAINS && self.0 & (1 << domain) != 0
    }

    /// Set a domain
    pub fn insert(&mut self, domain: DomainId) {
        if (domain as usize) < MAX_DOMAINS {
            self.0 |= 1 << domain;
        }
    }

    /// Clear a domain
    pub fn remove(&mut self, domain: DomainId) {
        if (domain as usize) < MAX_DOMAINS {
            self.0 &= !(1 << domain);
        }
    }

    /// No domain set?
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of domains set
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest domain set
    pub const fn first(&self) -> Option<DomainId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Lowest domain set that is strictly greater than `after`, wrapping
    /// around to [`first`](Self::first).
    pub fn next_after(&self, after: DomainId) -> Option<DomainId> {
        let shift = after as u64 + 1;
        let above = if shift >= 64 { 0 } else { self.0 & (u64::MAX << shift) };
        if above != 0 {
            Some(above.trailing_zeros())
        } else {
            self.first()
        }
    }

    /// Every set domain is below `domain_count`
    pub const fn fits(&self, domain_count: usize) -> bool {
        self.0 & !Self::first_n(domain_count).0 == 0
    }

    /// Intersection
    pub const fn intersect(&self, other: &Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union
    pub const fn union(&self, other: &Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate set domains in ascending order
    pub fn iter(&self) -> DomainIter {
        DomainIter(self.0)
    }
}

impl fmt::Debug for DomainMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<DomainId> for DomainMask {
    fn from_iter<I: IntoIterator<Item = DomainId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for domain in iter {
            mask.insert(domain);
        }
        mask
    }
}

/// Ascending iterator over a [`DomainMask`]
#[derive(Debug, Clone)]
pub struct DomainIter(u64);

impl Iterator for DomainIter {
    type Item = DomainId;

    fn next(&mut self) -> Option<DomainId> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

// ============================================================================
// CPU SET
// ============================================================================

/// Set of CPUs, the building block of the generic cpuset mechanism
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuSet([u64; CPUSET_WORDS]);

impl CpuSet {
    /// Empty set
    pub const fn new() -> Self {
        Self([0; CPUSET_WORDS])
    }

    /// Set holding a single CPU
    pub fn single(cpu: CpuId) -> Self {
        let mut set = Self::new();
        set.insert(cpu);
        set
    }

    /// Set holding `0..count`
    pub fn first_n(count: usize) -> Self {
        (0..count.min(MAX_CPUS) as CpuId).collect()
    }

    /// Add a CPU (ignored past [`MAX_CPUS`])
    pub fn insert(&mut self, cpu: CpuId) {
        let cpu = cpu as usize;
        if cpu < MAX_CPUS {
            self.0[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    /// Remove a CPU
    pub fn remove(&mut self, cpu: CpuId) {
        let cpu = cpu as usize;
        if cpu < MAX_CPUS {
            self.0[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    /// Is the CPU in the set?
    pub fn contains(&self, cpu: CpuId) -> bool {
        let cpu = cpu as usize;
        cpu < MAX_CPUS && self.0[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    /// Number of CPUs
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    /// Empty?
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Lowest CPU in the set
    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    /// Union
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.0.iter_mut().zip(other.0.iter()) {
            *w |= *o;
        }
        out
    }

    /// Any CPU in common?
    pub fn intersects(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// Raw words
    pub fn words(&self) -> &[u64; CPUSET_WORDS] {
        &self.0
    }

    /// Iterate CPUs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &word)| {
            DomainIter(word).map(move |bit| (i * 64) as CpuId + bit)
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = Self::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

// ============================================================================
// MEMORY POLICY
// ============================================================================

/// Allocation strategy applied within an affinity mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum MemoryPolicy {
    /// Allocate from the mask domain closest to the thread's CPU
    #[default]
    Nearest    = 0,
    /// Round-robin across mask domains in ascending order
    Interleave = 1,
}

impl TryFrom<i32> for MemoryPolicy {
    type Error = NumaError;

    fn try_from(value: i32) -> Result<Self, NumaError> {
        match value {
            0 => Ok(Self::Nearest),
            1 => Ok(Self::Interleave),
            _ => Err(NumaError::InvalidPolicy),
        }
    }
}

// ============================================================================
// AFFINITY TARGET
// ============================================================================

/// Scope of an affinity operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum CpuLevel {
    /// The root set the object belongs to
    Root   = 1,
    /// The cpuset the object is assigned to
    Cpuset = 2,
    /// The object itself
    Which  = 3,
}

impl TryFrom<i32> for CpuLevel {
    type Error = NumaError;

    fn try_from(value: i32) -> Result<Self, NumaError> {
        match value {
            1 => Ok(Self::Root),
            2 => Ok(Self::Cpuset),
            3 => Ok(Self::Which),
            _ => Err(NumaError::InvalidLevel),
        }
    }
}

/// Kind of object an affinity target id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum CpuWhich {
    /// Thread id
    Tid    = 1,
    /// Process id
    Pid    = 2,
    /// Cpuset id
    Cpuset = 3,
    /// Interrupt number
    Irq    = 4,
}

impl TryFrom<i32> for CpuWhich {
    type Error = NumaError;

    fn try_from(value: i32) -> Result<Self, NumaError> {
        match value {
            1 => Ok(Self::Tid),
            2 => Ok(Self::Pid),
            3 => Ok(Self::Cpuset),
            4 => Ok(Self::Irq),
            _ => Err(NumaError::InvalidWhich),
        }
    }
}

/// Subject of an affinity operation.
///
/// Not allocated anywhere: it is a name, resolved against the object
/// directory each time it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityTarget {
    /// Scope
    pub level: CpuLevel,
    /// Object kind
    pub which: CpuWhich,
    /// Object id (`-1` = caller for threads and processes)
    pub id: ObjectId,
}

impl AffinityTarget {
    /// Create a target
    pub const fn new(level: CpuLevel, which: CpuWhich, id: ObjectId) -> Self {
        Self { level, which, id }
    }

    /// The thread itself
    pub const fn thread(tid: Pid) -> Self {
        Self::new(CpuLevel::Which, CpuWhich::Tid, tid as ObjectId)
    }

    /// The process itself
    pub const fn process(pid: Pid) -> Self {
        Self::new(CpuLevel::Which, CpuWhich::Pid, pid as ObjectId)
    }

    /// Decode a raw `(level, which, id)` triple, level first then which
    pub fn decode(level: i32, which: i32, id: ObjectId) -> Result<Self, NumaError> {
        let level = CpuLevel::try_from(level)?;
        let which = CpuWhich::try_from(which)?;
        Ok(Self::new(level, which, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_mask_basics() {
        let mut mask = DomainMask::empty();
        assert!(mask.is_empty());
        mask.insert(3);
        mask.insert(1);
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.first(), Some(1));
        assert!(mask.contains(3));
        assert!(!mask.contains(2));
        assert!(!mask.contains(200));
        assert_eq!(mask.iter().collect::<alloc::vec::Vec<_>>(), [1, 3]);
    }

    #[test]
    fn test_domain_mask_next_after_wraps() {
        let mask: DomainMask = [0, 2, 5].into_iter().collect();
        assert_eq!(mask.next_after(0), Some(2));
        assert_eq!(mask.next_after(2), Some(5));
        assert_eq!(mask.next_after(5), Some(0));
        assert_eq!(mask.next_after(63), Some(0));
        assert_eq!(DomainMask::empty().next_after(0), None);
    }

    #[test]
    fn test_domain_mask_fits() {
        assert!(DomainMask::first_n(4).fits(4));
        assert!(!DomainMask::single(4).fits(4));
        assert!(DomainMask::first_n(64).fits(64));
        assert!(DomainMask::empty().fits(0));
    }

    #[test]
    fn test_domain_mask_words() {
        let mask = DomainMask::from_words(&[0b1010, 0], 128).unwrap();
        assert_eq!(mask.bits(), 0b1010);
        // Bits past maxnode are ignored
        let mask = DomainMask::from_words(&[0b1111], 2).unwrap();
        assert_eq!(mask.bits(), 0b11);
        assert_eq!(
            DomainMask::from_words(&[0, 1], 128),
            Err(NumaError::InvalidDomainMask)
        );
        assert_eq!(DomainMask::from_words(&[1], 65), Err(NumaError::InvalidCount));

        let mut words = [7u64; 2];
        DomainMask::single(2).to_words(&mut words);
        assert_eq!(words, [4, 0]);
    }

    #[test]
    fn test_cpuset_iteration() {
        let set: CpuSet = [0, 63, 64, 200].into_iter().collect();
        assert_eq!(set.count(), 4);
        assert!(set.contains(64));
        assert!(!set.contains(65));
        assert_eq!(set.iter().collect::<alloc::vec::Vec<_>>(), [0, 63, 64, 200]);
        assert_eq!(set.first(), Some(0));
        assert!(CpuSet::new().is_empty());
    }

    #[test]
    fn test_raw_enum_decoding() {
        assert_eq!(MemoryPolicy::try_from(1), Ok(MemoryPolicy::Interleave));
        assert_eq!(MemoryPolicy::try_from(7), Err(NumaError::InvalidPolicy));
        assert_eq!(
            AffinityTarget::decode(9, 1, 5),
            Err(NumaError::InvalidLevel)
        );
        // Level is checked before which
        assert_eq!(
            AffinityTarget::decode(0, 0, 5),
            Err(NumaError::InvalidLevel)
        );
        assert_eq!(
            AffinityTarget::decode(3, 9, 5),
            Err(NumaError::InvalidWhich)
        );
        assert_eq!(
            AffinityTarget::decode(3, 1, 5),
            Ok(AffinityTarget::thread(5))
        );
    }
}
