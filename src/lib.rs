//! Mach_R VM - the Mach virtual memory core in Rust
//!
//! Address maps, shadow/copy object chains, the fault handler, copy objects
//! and the sleep locks underneath them. The physical page allocator, the
//! pmap layer, the scheduler and external pagers are collaborators behind
//! traits, each with a host implementation for tests.

#![no_std]
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod kern;
pub mod mach_vm;

pub use kern::{KernError, KernResult, KernReturn};
pub use mach_vm::{VmConfig, VmContext, VmMap, VmMapCopy, VmObject, VmProt};
