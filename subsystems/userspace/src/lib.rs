//! # Helix Userspace NUMA Library
//!
//! Userspace side of the NUMA subsystem. [`NumaLibrary`] composes the
//! NUMA syscalls into thread placement operations; the syscalls themselves
//! sit behind [`NumaSyscalls`] so the library can run against any kernel
//! boundary.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod numa;
pub mod syscalls;

pub use numa::{MemFlag, NumaLibrary, TopologyCache};
pub use syscalls::{KernelGate, NumaSyscalls};
