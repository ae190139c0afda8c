//! Scheduling Primitives - Wait/Wakeup and Event Management
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! The VM core does not own a scheduler. It only needs the classic Mach
//! event protocol:
//!
//! 1. `assert_wait(event)` while still holding the interlock protecting the
//!    condition being waited for
//! 2. drop the interlock
//! 3. `thread_block(token)` until some thread calls `wakeup(event)`
//!
//! Because the waiter is queued before the interlock is dropped, a wakeup
//! issued between steps 2 and 3 is never lost. Spurious wakeups are allowed;
//! every caller re-checks its condition in a loop.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

// ============================================================================
// Identifiers
// ============================================================================

/// Thread identifier as seen by the VM core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Event that threads can wait on
/// In Mach, this is typically a pointer cast to an integer
pub type WaitEvent = u64;

/// Special value indicating no event
pub const EVENT_NULL: WaitEvent = 0;

/// Derive an event from the address of a kernel structure plus a tag.
///
/// Distinct structures yield distinct events; tags separate several
/// conditions on one structure (e.g. one per page offset).
pub fn event_for<T: ?Sized>(object: &T, tag: u64) -> WaitEvent {
    let addr = object as *const T as *const u8 as usize as u64;
    addr ^ tag.rotate_left(47)
}

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation (from Mach4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Thread was awakened normally
    Normal = 0,
    /// Thread was interrupted (only for interruptible waits)
    Interrupted = 2,
}

/// Handle returned by `assert_wait` and consumed by `thread_block`
#[derive(Debug)]
#[must_use = "an asserted wait must be completed with thread_block"]
pub struct WaitToken {
    pub event: WaitEvent,
    pub thread: ThreadId,
    pub interruptible: bool,
}

// ============================================================================
// Scheduler Collaborator
// ============================================================================

/// Sleep/wakeup interface the VM core is built on
pub trait Scheduler: Send + Sync {
    /// Identity of the calling thread
    fn current_thread(&self) -> ThreadId;

    /// Queue the calling thread on `event`. Must be called before the
    /// interlock guarding the awaited condition is released.
    fn assert_wait(&self, event: WaitEvent, interruptible: bool) -> WaitToken;

    /// Block until the asserted event is posted (or the wait is interrupted)
    fn thread_block(&self, token: WaitToken) -> WaitResult;

    /// Wake every thread waiting on `event`
    fn wakeup(&self, event: WaitEvent);
}

// ============================================================================
// Waiter Entry
// ============================================================================

/// A thread waiting on an event
#[derive(Debug, Clone)]
pub struct Waiter {
    /// The waiting thread
    pub thread_id: ThreadId,
    /// The event being waited on
    pub event: WaitEvent,
    /// Is this wait interruptible?
    pub interruptible: bool,
}

impl Waiter {
    /// Create a new waiter
    pub fn new(thread_id: ThreadId, event: WaitEvent, interruptible: bool) -> Self {
        Self {
            thread_id,
            event,
            interruptible,
        }
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Queue of threads waiting on events
#[derive(Debug)]
pub struct WaitQueue {
    /// Waiters indexed by event
    waiters: BTreeMap<WaitEvent, Vec<Waiter>>,
    /// Total waiter count
    count: usize,
}

impl WaitQueue {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            waiters: BTreeMap::new(),
            count: 0,
        }
    }

    /// Add a waiter
    pub fn add(&mut self, waiter: Waiter) {
        let event = waiter.event;
        self.waiters.entry(event).or_default().push(waiter);
        self.count += 1;
    }

    /// Remove a specific waiter
    pub fn remove(&mut self, thread_id: ThreadId) -> Option<Waiter> {
        let mut found = None;
        for (&event, waiters) in self.waiters.iter_mut() {
            if let Some(pos) = waiters.iter().position(|w| w.thread_id == thread_id) {
                found = Some((event, waiters.remove(pos)));
                break;
            }
        }
        let (event, waiter) = found?;
        self.count -= 1;
        if self.waiters.get(&event).is_some_and(|w| w.is_empty()) {
            self.waiters.remove(&event);
        }
        Some(waiter)
    }

    /// Wake all threads waiting on an event
    pub fn wakeup_all(&mut self, event: WaitEvent) -> Vec<Waiter> {
        match self.waiters.remove(&event) {
            Some(waiters) => {
                self.count -= waiters.len();
                waiters
            }
            None => Vec::new(),
        }
    }

    /// Get count of waiters
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of threads waiting on one event
    pub fn waiting_on(&self, event: WaitEvent) -> usize {
        self.waiters.get(&event).map_or(0, |w| w.len())
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Host Scheduler
// ============================================================================

#[cfg(any(test, feature = "std"))]
pub use host::HostScheduler;

#[cfg(any(test, feature = "std"))]
mod host {
    extern crate std;

    use super::*;
    use alloc::collections::BTreeSet;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Condvar, Mutex, MutexGuard};

    static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

    std::thread_local! {
        static THREAD_ID: Cell<u64> = const { Cell::new(0) };
    }

    #[derive(Default)]
    struct HostState {
        queue: WaitQueue,
        awakened: BTreeSet<ThreadId>,
        interrupted: BTreeSet<ThreadId>,
    }

    /// Scheduler backed by host threads, for tests and host tools.
    ///
    /// Threads are identified lazily through a thread-local counter.
    #[derive(Default)]
    pub struct HostScheduler {
        state: Mutex<HostState>,
        cond: Condvar,
    }

    impl HostScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, HostState> {
            self.state.lock().unwrap_or_else(|poison| poison.into_inner())
        }

        /// Abort an interruptible wait of `thread`, if it has one queued.
        /// Returns whether a wait was interrupted.
        pub fn interrupt(&self, thread: ThreadId) -> bool {
            let mut state = self.state();
            let queued = state
                .queue
                .waiters
                .values()
                .flatten()
                .any(|w| w.thread_id == thread && w.interruptible);
            if queued {
                state.queue.remove(thread);
                state.interrupted.insert(thread);
                self.cond.notify_all();
            }
            queued
        }

        /// Number of threads currently queued on `event`
        pub fn waiters(&self, event: WaitEvent) -> usize {
            self.state().queue.waiting_on(event)
        }

        /// Number of threads queued on any event
        pub fn total_waiters(&self) -> usize {
            self.state().queue.count()
        }
    }

    impl Scheduler for HostScheduler {
        fn current_thread(&self) -> ThreadId {
            THREAD_ID.with(|id| {
                if id.get() == 0 {
                    id.set(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
                }
                ThreadId(id.get())
            })
        }

        fn assert_wait(&self, event: WaitEvent, interruptible: bool) -> WaitToken {
            let thread = self.current_thread();
            let mut state = self.state();
            state.awakened.remove(&thread);
            state.interrupted.remove(&thread);
            state.queue.add(Waiter::new(thread, event, interruptible));
            WaitToken {
                event,
                thread,
                interruptible,
            }
        }

        fn thread_block(&self, token: WaitToken) -> WaitResult {
            let mut state = self.state();
            loop {
                if state.awakened.remove(&token.thread) {
                    return WaitResult::Normal;
                }
                if state.interrupted.remove(&token.thread) {
                    return WaitResult::Interrupted;
                }
                state = self
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poison| poison.into_inner());
            }
        }

        fn wakeup(&self, event: WaitEvent) {
            let mut state = self.state();
            let woken = state.queue.wakeup_all(event);
            if woken.is_empty() {
                return;
            }
            for waiter in woken {
                state.awakened.insert(waiter.thread_id);
            }
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_queue() {
        let mut queue = WaitQueue::new();
        queue.add(Waiter::new(ThreadId(1), 10, false));
        queue.add(Waiter::new(ThreadId(2), 10, true));
        queue.add(Waiter::new(ThreadId(3), 11, false));
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.waiting_on(10), 2);

        assert!(queue.remove(ThreadId(3)).is_some());
        assert_eq!(queue.waiting_on(11), 0);

        let woken = queue.wakeup_all(10);
        assert_eq!(woken.len(), 2);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_wakeup_between_assert_and_block_is_not_lost() {
        let sched = HostScheduler::new();
        let token = sched.assert_wait(42, false);
        sched.wakeup(42);
        assert_eq!(sched.thread_block(token), WaitResult::Normal);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let sched = Arc::new(HostScheduler::new());
        let waiter = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || {
                let token = sched.assert_wait(7, false);
                sched.thread_block(token)
            })
        };
        while sched.waiters(7) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        sched.wakeup(7);
        assert_eq!(waiter.join().unwrap(), WaitResult::Normal);
    }

    #[test]
    fn test_interrupt_only_hits_interruptible_waits() {
        let sched = Arc::new(HostScheduler::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let sched = Arc::clone(&sched);
            thread::spawn(move || {
                tx.send(sched.current_thread()).unwrap();
                let token = sched.assert_wait(9, true);
                sched.thread_block(token)
            })
        };
        let tid = rx.recv().unwrap();
        while sched.waiters(9) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sched.interrupt(tid));
        assert_eq!(waiter.join().unwrap(), WaitResult::Interrupted);
        assert!(!sched.interrupt(tid));
    }

    #[test]
    fn test_event_for_distinguishes_tags() {
        let a = 0u64;
        assert_ne!(event_for(&a, 0), event_for(&a, 1));
    }
}
