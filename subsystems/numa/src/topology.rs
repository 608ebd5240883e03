//! # Topology Registry
//!
//! The static mapping of CPUs and physical memory onto NUMA domains, plus
//! the inter-domain weight matrix. Built once at boot from the firmware
//! description and read-only afterwards, so queries take no locks.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{NumaError, NumaResult};
use crate::types::{CpuId, CpuSet, DomainId, DomainMask, Pfn, MAX_CPUS, MAX_DOMAINS};

/// Relative access cost between two domains
pub type Weight = u16;

/// Weight used for every remote pair the firmware leaves unspecified
pub const DEFAULT_REMOTE_WEIGHT: Weight = 10;

// ============================================================================
// MEMORY RANGE
// ============================================================================

/// Contiguous run of physical frames owned by one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First frame
    pub start: Pfn,
    /// Number of frames
    pub frames: u64,
}

impl MemoryRange {
    /// Create a range
    pub const fn new(start: Pfn, frames: u64) -> Self {
        Self { start, frames }
    }

    /// One past the last frame
    pub const fn end(&self) -> Pfn {
        self.start.saturating_add(self.frames)
    }

    /// Does the range hold `pfn`?
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start && pfn < self.end()
    }

    /// Do two ranges share a frame?
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

// ============================================================================
// NUMA DOMAIN
// ============================================================================

/// One NUMA domain
#[derive(Debug, Clone)]
pub struct NumaDomain {
    /// Domain ID
    pub id: DomainId,
    /// CPUs on this domain
    pub cpus: CpuSet,
    /// Physical memory on this domain
    pub memory: Vec<MemoryRange>,
}

impl NumaDomain {
    fn new(id: DomainId) -> Self {
        Self {
            id,
            cpus: CpuSet::new(),
            memory: Vec::new(),
        }
    }

    /// Total frames on this domain
    pub fn frame_count(&self) -> u64 {
        self.memory.iter().map(|r| r.frames).sum()
    }
}

// ============================================================================
// TOPOLOGY REGISTRY
// ============================================================================

/// Immutable NUMA topology
#[derive(Debug, Clone)]
pub struct TopologyRegistry {
    /// Set once at boot; false means "no NUMA", not "one domain"
    available: bool,
    domains: Vec<NumaDomain>,
    /// Row-major `domain_count x domain_count`
    weights: Vec<Weight>,
    /// Index = CPU id
    cpu_to_domain: Vec<Option<DomainId>>,
    all_cpus: CpuSet,
}

impl TopologyRegistry {
    /// Topology of a machine without NUMA support
    pub fn unavailable() -> Self {
        Self {
            available: false,
            domains: Vec::new(),
            weights: Vec::new(),
            cpu_to_domain: Vec::new(),
            all_cpus: CpuSet::new(),
        }
    }

    /// Start describing a topology with `domain_count` domains
    pub fn builder(domain_count: usize) -> TopologyBuilder {
        TopologyBuilder::new(domain_count)
    }

    /// NUMA present?
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Number of domains, 0 when NUMA is unavailable
    pub fn domain_count(&self) -> usize {
        if self.available { self.domains.len() } else { 0 }
    }

    /// Fail with `Unavailable` unless NUMA is present
    pub fn ensure_available(&self) -> NumaResult<()> {
        if self.domain_count() == 0 {
            Err(NumaError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Fail unless `domain` is in range
    pub fn check_domain(&self, domain: DomainId) -> NumaResult<()> {
        self.ensure_available()?;
        if (domain as usize) < self.domains.len() {
            Ok(())
        } else {
            Err(NumaError::InvalidDomain)
        }
    }

    /// Fail unless `mask` is a non-empty subset of the domains
    pub fn check_mask(&self, mask: DomainMask) -> NumaResult<()> {
        self.ensure_available()?;
        if mask.is_empty() || !mask.fits(self.domains.len()) {
            Err(NumaError::InvalidDomainMask)
        } else {
            Ok(())
        }
    }

    /// Domain descriptor
    pub fn domain(&self, domain: DomainId) -> NumaResult<&NumaDomain> {
        self.check_domain(domain)?;
        Ok(&self.domains[domain as usize])
    }

    /// CPUs assigned to `domain`
    pub fn cpus_in_domain(&self, domain: DomainId) -> NumaResult<CpuSet> {
        Ok(self.domain(domain)?.cpus)
    }

    /// Relative cost between two domains
    pub fn weight(&self, a: DomainId, b: DomainId) -> NumaResult<Weight> {
        self.check_domain(a)?;
        self.check_domain(b)?;
        let n = self.domains.len();
        Ok(self.weights[a as usize * n + b as usize])
    }

    /// Row-major weight matrix
    pub fn weight_matrix(&self) -> &[Weight] {
        if self.available { &self.weights } else { &[] }
    }

    /// Domain a CPU belongs to
    pub fn domain_of_cpu(&self, cpu: CpuId) -> Option<DomainId> {
        self.cpu_to_domain.get(cpu as usize).copied().flatten()
    }

    /// Domain a physical frame lives on
    pub fn domain_of_frame(&self, pfn: Pfn) -> Option<DomainId> {
        self.domains
            .iter()
            .find(|d| d.memory.iter().any(|r| r.contains(pfn)))
            .map(|d| d.id)
    }

    /// Every CPU known to the topology
    pub fn all_cpus(&self) -> CpuSet {
        self.all_cpus
    }

    /// Mask of every domain
    pub fn all_domains(&self) -> DomainMask {
        DomainMask::first_n(self.domain_count())
    }

    /// Domains iterable in id order
    pub fn domains(&self) -> &[NumaDomain] {
        if self.available { &self.domains } else { &[] }
    }

    /// Domains sorted by weight from `from`, ties broken by id.
    ///
    /// `from` itself comes first since its own weight is zero.
    pub fn nearest_domains(&self, from: DomainId) -> Vec<DomainId> {
        if self.check_domain(from).is_err() {
            return Vec::new();
        }
        let n = self.domains.len();
        let row = &self.weights[from as usize * n..(from as usize + 1) * n];
        let mut order: Vec<DomainId> = (0..n as DomainId).collect();
        order.sort_by_key(|&d| (row[d as usize], d));
        order
    }
}

// ============================================================================
// TOPOLOGY BUILDER
// ============================================================================

/// Boot-time topology description, validated by [`build`](Self::build)
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    domain_count: usize,
    cpus: Vec<(DomainId, CpuId)>,
    memory: Vec<(DomainId, MemoryRange)>,
    weights: Vec<Weight>,
    bad_reference: bool,
}

impl TopologyBuilder {
    /// New description with default weights (0 local, 10 remote)
    pub fn new(domain_count: usize) -> Self {
        let too_many = domain_count > MAX_DOMAINS;
        let n = if too_many { 0 } else { domain_count };
        let mut weights = vec![DEFAULT_REMOTE_WEIGHT; n * n];
        for i in 0..n {
            weights[i * n + i] = 0;
        }
        Self {
            domain_count,
            cpus: Vec::new(),
            memory: Vec::new(),
            weights,
            bad_reference: too_many,
        }
    }

    fn valid(&self, domain: DomainId) -> bool {
        (domain as usize) < self.domain_count
    }

    /// Assign CPUs to a domain
    pub fn with_cpus(mut self, domain: DomainId, cpus: &[CpuId]) -> Self {
        if !self.valid(domain) {
            self.bad_reference = true;
        }
        self.cpus.extend(cpus.iter().map(|&cpu| (domain, cpu)));
        self
    }

    /// Assign a frame range to a domain
    pub fn with_memory(mut self, domain: DomainId, start: Pfn, frames: u64) -> Self {
        if !self.valid(domain) {
            self.bad_reference = true;
        }
        self.memory.push((domain, MemoryRange::new(start, frames)));
        self
    }

    /// Set a symmetric weight
    pub fn with_weight(mut self, a: DomainId, b: DomainId, weight: Weight) -> Self {
        if self.bad_reference || !self.valid(a) || !self.valid(b) {
            self.bad_reference = true;
            return self;
        }
        let n = self.domain_count;
        self.weights[a as usize * n + b as usize] = weight;
        self.weights[b as usize * n + a as usize] = weight;
        self
    }

    /// Replace the whole weight matrix (row-major)
    pub fn with_weight_matrix(mut self, weights: &[Weight]) -> Self {
        if weights.len() != self.weights.len() {
            self.bad_reference = true;
        } else {
            self.weights.copy_from_slice(weights);
        }
        self
    }

    /// Validate and freeze
    pub fn build(self) -> NumaResult<TopologyRegistry> {
        let n = self.domain_count;
        if n == 0 {
            log::info!("NUMA: no domains reported, NUMA unavailable");
            return Ok(TopologyRegistry::unavailable());
        }
        if n > MAX_DOMAINS || self.bad_reference {
            return Err(NumaError::InvalidTopology);
        }

        for a in 0..n {
            if self.weights[a * n + a] != 0 {
                return Err(NumaError::InvalidTopology);
            }
            for b in 0..a {
                if self.weights[a * n + b] != self.weights[b * n + a] {
                    return Err(NumaError::InvalidTopology);
                }
            }
        }

        let mut domains: Vec<NumaDomain> = (0..n as DomainId).map(NumaDomain::new).collect();
        let mut cpu_to_domain: Vec<Option<DomainId>> = Vec::new();
        let mut all_cpus = CpuSet::new();

        for &(domain, cpu) in &self.cpus {
            if cpu as usize >= MAX_CPUS || all_cpus.contains(cpu) {
                return Err(NumaError::InvalidTopology);
            }
            all_cpus.insert(cpu);
            domains[domain as usize].cpus.insert(cpu);
            if cpu_to_domain.len() <= cpu as usize {
                cpu_to_domain.resize(cpu as usize + 1, None);
            }
            cpu_to_domain[cpu as usize] = Some(domain);
        }

        for (i, (domain, range)) in self.memory.iter().enumerate() {
            if range.frames == 0 || range.start.checked_add(range.frames).is_none() {
                return Err(NumaError::InvalidTopology);
            }
            if self.memory[..i].iter().any(|(_, other)| other.overlaps(range)) {
                return Err(NumaError::InvalidTopology);
            }
            domains[*domain as usize].memory.push(*range);
        }

        for domain in &domains {
            log::info!(
                "NUMA: domain {}: {} CPU(s), {} frame(s)",
                domain.id,
                domain.cpus.count(),
                domain.frame_count()
            );
        }
        log::info!(
            "NUMA: discovered {} domain(s), {} CPU(s)",
            n,
            all_cpus.count()
        );

        Ok(TopologyRegistry {
            available: true,
            domains,
            weights: self.weights,
            cpu_to_domain,
            all_cpus,
        })
    }
}
