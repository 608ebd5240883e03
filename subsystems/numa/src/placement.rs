//! Domain selection for new page allocations.

use alloc::vec::Vec;

use crate::affinity::AffinityRecord;
use crate::topology::TopologyRegistry;
use crate::types::{DomainId, MemoryPolicy};

/// Order in which domains are tried for one allocation.
///
/// - `Nearest`: mask domains by weight from `home` (the domain of the
///   allocating thread's CPU), ties by id; ascending id when `home` is
///   unknown.
/// - `Interleave`: mask domains in ascending order starting at `start`,
///   wrapping around.
///
/// Domains outside the mask are never returned.
pub fn candidate_domains(
    topology: &TopologyRegistry,
    record: &AffinityRecord,
    home: Option<DomainId>,
    start: Option<DomainId>,
) -> Vec<DomainId> {
    let mask = record.mask;
    match record.policy {
        MemoryPolicy::Nearest => match home {
            Some(home) if topology.check_domain(home).is_ok() => topology
                .nearest_domains(home)
                .into_iter()
                .filter(|&d| mask.contains(d))
                .collect(),
            _ => mask.iter().collect(),
        },
        MemoryPolicy::Interleave => {
            let all: Vec<DomainId> = mask.iter().collect();
            let pivot = start
                .and_then(|s| all.iter().position(|&d| d == s))
                .unwrap_or(0);
            let mut order = Vec::with_capacity(all.len());
            order.extend_from_slice(&all[pivot..]);
            order.extend_from_slice(&all[..pivot]);
            order
        },
    }
}
