//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the return codes, locks and wait/wakeup primitives the VM
//! subsystem is built on.

pub mod kern_return;
pub mod lock;
pub mod sched_prim;

pub use kern_return::{kern_return, KernError, KernResult, KernReturn, KERN_SUCCESS};
pub use lock::{ReadGuard, Recursion, RecursionToken, SimpleLock, SleepLock, SleepLocked, WriteGuard};
pub use sched_prim::{event_for, Scheduler, ThreadId, WaitEvent, WaitResult};
#[cfg(any(test, feature = "std"))]
pub use sched_prim::HostScheduler;
