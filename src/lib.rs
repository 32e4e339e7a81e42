//! mach_fault - Mach-style page-fault resolution in Rust
//!
//! This crate provides the virtual memory fault path of a Mach/BSD style
//! kernel: shadow-chain walking, clustered page-in from pagers,
//! copy-on-write, page wiring and wired-region copy. The embedding kernel
//! supplies the scheduler, the address maps and the physical maps through
//! traits; software implementations of each are included.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Page arithmetic often needs explicit casts between u64 offsets and usize
#![allow(clippy::unnecessary_cast)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod kern;
pub mod mach_vm;

pub use kern::sched_prim::{Scheduler, SpinScheduler};
pub use mach_vm::{
    FaultError, FaultOutcome, FaultStats, MemoryPager, SimpleMap, VmConfig, VmMap, VmProt,
    VmSystem,
};
