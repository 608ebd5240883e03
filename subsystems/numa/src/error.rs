//! # NUMA Error Types
//!
//! Errors returned by the NUMA subsystem and their mapping onto the
//! integer codes surfaced at the syscall boundary.

use core::fmt;

/// Result type for NUMA operations
pub type NumaResult<T> = Result<T, NumaError>;

// ============================================================================
// ERRNO VALUES
// ============================================================================

/// FreeBSD-compatible errno values used at the syscall boundary
pub mod errno {
    /// Operation not permitted
    pub const EPERM: i32 = 1;
    /// No such process
    pub const ESRCH: i32 = 3;
    /// Argument list too long
    pub const E2BIG: i32 = 7;
    /// Cannot allocate memory
    pub const ENOMEM: i32 = 12;
    /// Permission denied
    pub const EACCES: i32 = 13;
    /// Bad address
    pub const EFAULT: i32 = 14;
    /// Device busy
    pub const EBUSY: i32 = 16;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Result too large
    pub const ERANGE: i32 = 34;
    /// Operation not supported
    pub const EOPNOTSUPP: i32 = 45;
}

// ============================================================================
// ERROR KIND
// ============================================================================

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// NUMA is not present on this machine
    Unavailable,
    /// Bad level, which, domain, policy, pid, count or flags
    InvalidArgument,
    /// The named object does not exist
    NotFound,
    /// A batch finished with some items failing
    PartialFailure,
    /// Allocation failure while staging a request
    ResourceExhausted,
}

// ============================================================================
// NUMA ERROR
// ============================================================================

/// NUMA subsystem error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaError {
    /// NUMA is not available (domain count is zero)
    Unavailable,
    /// `level` is not a defined scope
    InvalidLevel,
    /// `which` is not a defined object kind
    InvalidWhich,
    /// The object named by the target does not exist
    InvalidTarget,
    /// Domain out of range
    InvalidDomain,
    /// Domain mask empty or referencing an out-of-range domain
    InvalidDomainMask,
    /// Unrecognized memory policy
    InvalidPolicy,
    /// Reserved or negative pid
    InvalidPid,
    /// CPU set empty or naming CPUs outside the topology
    InvalidCpuSet,
    /// Batch count or set size cannot be decoded
    InvalidCount,
    /// Unknown flag bits
    InvalidFlags,
    /// Output buffer cannot hold the result
    BufferTooSmall,
    /// Topology description violates an invariant
    InvalidTopology,
    /// No memory to stage the request
    ResourceExhausted,
    /// Operation refused on this object
    NotPermitted,
}

impl NumaError {
    /// Category of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Unavailable,
            Self::InvalidTarget => ErrorKind::NotFound,
            Self::ResourceExhausted => ErrorKind::ResourceExhausted,
            _ => ErrorKind::InvalidArgument,
        }
    }

    /// Positive errno value for this error
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Unavailable => errno::EOPNOTSUPP,
            Self::InvalidTarget => errno::ESRCH,
            Self::InvalidCount => errno::E2BIG,
            Self::BufferTooSmall => errno::ERANGE,
            Self::ResourceExhausted => errno::ENOMEM,
            Self::NotPermitted => errno::EPERM,
            Self::InvalidLevel
            | Self::InvalidWhich
            | Self::InvalidDomain
            | Self::InvalidDomainMask
            | Self::InvalidPolicy
            | Self::InvalidPid
            | Self::InvalidCpuSet
            | Self::InvalidFlags
            | Self::InvalidTopology => errno::EINVAL,
        }
    }

    /// Negative errno, the value a syscall returns
    pub const fn as_return(&self) -> i32 {
        -self.errno()
    }
}

impl fmt::Display for NumaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "NUMA is not available"),
            Self::InvalidLevel => write!(f, "Invalid affinity level"),
            Self::InvalidWhich => write!(f, "Invalid affinity object kind"),
            Self::InvalidTarget => write!(f, "Affinity target does not exist"),
            Self::InvalidDomain => write!(f, "NUMA domain out of range"),
            Self::InvalidDomainMask => write!(f, "Domain mask empty or out of range"),
            Self::InvalidPolicy => write!(f, "Unrecognized memory policy"),
            Self::InvalidPid => write!(f, "Reserved or negative process id"),
            Self::InvalidCpuSet => write!(f, "CPU set empty or out of range"),
            Self::InvalidCount => write!(f, "Invalid count or set size"),
            Self::InvalidFlags => write!(f, "Unknown flag bits"),
            Self::BufferTooSmall => write!(f, "Output buffer too small"),
            Self::InvalidTopology => write!(f, "Inconsistent NUMA topology"),
            Self::ResourceExhausted => write!(f, "Out of memory"),
            Self::NotPermitted => write!(f, "Operation not permitted"),
        }
    }
}
