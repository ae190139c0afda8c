//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Provides:
//! - `SimpleLock`: the short-hold spin mutex protecting small bookkeeping
//!   (object state, lock interlocks)
//! - `SleepLock`: Mach's reentrant reader/writer lock with upgrade and
//!   downgrade, built on an interlock plus scheduler sleep/wakeup
//! - `SleepLocked<T>`: a data-carrying wrapper with RAII guards, used for
//!   address map entry lists
//!
//! Lock discipline violations (double release, release by a thread that
//! does not hold the write lock, unannounced recursion) panic.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::sched_prim::{event_for, Scheduler, ThreadId, WaitEvent, WaitResult};

// ============================================================================
// Simple Lock (Spin Lock)
// ============================================================================

/// A simple spin lock protecting data.
///
/// Only for short critical sections that never block.
pub type SimpleLock<T> = spin::Mutex<T>;

/// Guard of a `SimpleLock`
pub type SimpleLockGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Default number of spins before a sleep lock blocks
pub const DEFAULT_SPIN_BUDGET: u32 = 64;

// ============================================================================
// Sleep Lock
// ============================================================================

#[derive(Debug, Default)]
struct LockState {
    /// A writer holds (or is draining readers for) the lock
    want_write: bool,
    /// A reader is converting to a writer
    want_upgrade: bool,
    /// Someone is asleep on the lock event
    waiting: bool,
    /// Blocking allowed; otherwise acquisition spins
    can_sleep: bool,
    read_count: u32,
    /// Thread holding the write side (via want_write or want_upgrade)
    holder: Option<ThreadId>,
    /// Recursion enabled by the holder
    recursive: bool,
    /// Extra write acquisitions through a recursion token
    recursion_depth: u32,
    /// Bumped per `enable_recursive`, so stale tokens are rejected
    recursion_epoch: u64,
}

/// Permission to re-enter a write-held `SleepLock`.
///
/// Returned by `enable_recursive`, presented to the `*_recursive`
/// acquisitions and surrendered to `disable_recursive`. Not `Send`:
/// it is only meaningful on the thread that holds the lock.
#[derive(Debug)]
#[must_use = "recursion must be disabled with disable_recursive"]
pub struct RecursionToken {
    lock: usize,
    epoch: u64,
    _thread_bound: PhantomData<*const ()>,
}

/// Reentrant reader/writer sleep lock
pub struct SleepLock {
    /// Interlock for modifying the lock structure
    interlock: SimpleLock<LockState>,
    sched: Arc<dyn Scheduler>,
    spin_budget: u32,
}

impl core::fmt::Debug for SleepLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.interlock.lock();
        f.debug_struct("SleepLock")
            .field("want_write", &st.want_write)
            .field("want_upgrade", &st.want_upgrade)
            .field("read_count", &st.read_count)
            .field("recursion_depth", &st.recursion_depth)
            .finish()
    }
}

impl SleepLock {
    /// Create a new unlocked lock
    pub fn new(sched: Arc<dyn Scheduler>, can_sleep: bool, spin_budget: u32) -> Self {
        Self {
            interlock: SimpleLock::new(LockState {
                can_sleep,
                ..LockState::default()
            }),
            sched,
            spin_budget,
        }
    }

    /// Set whether the lock can sleep
    pub fn set_sleepable(&self, can_sleep: bool) {
        self.interlock.lock().can_sleep = can_sleep;
    }

    fn event(&self) -> WaitEvent {
        event_for(self, 0)
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Wait, with the interlock held on entry and exit, until `blocked`
    /// turns false. Spins for the configured budget, then sleeps when allowed.
    /// On interruption the interlock is returned in the error.
    fn wait_while<'a>(
        &'a self,
        mut st: SimpleLockGuard<'a, LockState>,
        blocked: impl Fn(&LockState) -> bool,
        interruptible: bool,
    ) -> Result<SimpleLockGuard<'a, LockState>, SimpleLockGuard<'a, LockState>> {
        let mut spins = 0u32;
        while blocked(&st) {
            if !st.can_sleep || spins < self.spin_budget {
                drop(st);
                core::hint::spin_loop();
                spins = spins.saturating_add(1);
                st = self.interlock.lock();
                continue;
            }
            st.waiting = true;
            let token = self.sched.assert_wait(self.event(), interruptible);
            drop(st);
            let result = self.sched.thread_block(token);
            st = self.interlock.lock();
            if result == WaitResult::Interrupted {
                return Err(st);
            }
        }
        Ok(st)
    }

    /// Clear the waiting flag; the caller posts the wakeup once the
    /// interlock is dropped.
    fn take_waiting(st: &mut LockState) -> bool {
        core::mem::replace(&mut st.waiting, false)
    }

    fn wake(&self, needed: bool) {
        if needed {
            self.sched.wakeup(self.event());
        }
    }

    fn check_not_holder(&self, st: &LockState, me: ThreadId, what: &str) {
        if st.holder == Some(me) {
            panic!(
                "sleep lock: {} by the write holder without a recursion token",
                what
            );
        }
    }

    /// Acquire for writing (uninterruptible)
    pub fn acquire_write(&self) {
        // An uninterruptible wait never reports Aborted
        let _ = self.acquire_write_interruptible(false);
    }

    /// Acquire for writing, optionally abortable while asleep
    pub fn acquire_write_interruptible(&self, interruptible: bool) -> KernResult<()> {
        let me = self.sched.current_thread();
        let st = self.interlock.lock();
        self.check_not_holder(&st, me, "write acquisition");

        // Phase 1: claim the writer slot
        let mut st = self
            .wait_while(st, |s| s.want_write, interruptible)
            .map_err(|_| KernError::Aborted)?;
        st.want_write = true;

        // Phase 2: drain readers and any pending upgrade
        match self.wait_while(st, |s| s.read_count != 0 || s.want_upgrade, interruptible) {
            Ok(mut st) => {
                st.holder = Some(me);
                Ok(())
            }
            Err(mut st) => {
                st.want_write = false;
                let wake = Self::take_waiting(&mut st);
                drop(st);
                self.wake(wake);
                Err(KernError::Aborted)
            }
        }
    }

    /// Acquire for reading (uninterruptible)
    pub fn acquire_read(&self) {
        let _ = self.acquire_read_interruptible(false);
    }

    /// Acquire for reading, optionally abortable while asleep
    pub fn acquire_read_interruptible(&self, interruptible: bool) -> KernResult<()> {
        let me = self.sched.current_thread();
        let st = self.interlock.lock();
        self.check_not_holder(&st, me, "read acquisition");
        let mut st = self
            .wait_while(st, |s| s.want_write || s.want_upgrade, interruptible)
            .map_err(|_| KernError::Aborted)?;
        st.read_count += 1;
        Ok(())
    }

    /// Try to acquire for writing without blocking
    pub fn try_acquire_write(&self) -> bool {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        self.check_not_holder(&st, me, "write try-acquisition");
        if st.want_write || st.want_upgrade || st.read_count != 0 {
            return false;
        }
        st.want_write = true;
        st.holder = Some(me);
        true
    }

    /// Try to acquire for reading without blocking
    pub fn try_acquire_read(&self) -> bool {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        self.check_not_holder(&st, me, "read try-acquisition");
        if st.want_write || st.want_upgrade {
            return false;
        }
        st.read_count += 1;
        true
    }

    /// Release one hold (read, recursive, or write)
    pub fn release(&self) {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        let wake = if st.read_count > 0 {
            st.read_count -= 1;
            st.read_count == 0 && Self::take_waiting(&mut st)
        } else if st.recursion_depth > 0 {
            if st.holder != Some(me) {
                panic!("sleep lock: recursive release by a thread that does not hold it");
            }
            st.recursion_depth -= 1;
            false
        } else if st.want_upgrade || st.want_write {
            if st.holder != Some(me) {
                panic!("sleep lock: write release by a thread that does not hold it");
            }
            if st.recursive {
                panic!("sleep lock: write released while recursion is still enabled");
            }
            if st.want_upgrade {
                st.want_upgrade = false;
            } else {
                st.want_write = false;
            }
            st.holder = None;
            Self::take_waiting(&mut st)
        } else {
            panic!("sleep lock: release of an unheld lock");
        };
        drop(st);
        self.wake(wake);
    }

    /// Convert a read hold into a write hold.
    ///
    /// Returns false if another upgrade is already pending; the caller's
    /// read hold is gone in that case and it must start over.
    pub fn upgrade_read_to_write(&self) -> bool {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        self.check_not_holder(&st, me, "upgrade");
        if st.read_count == 0 {
            panic!("sleep lock: upgrade without a read hold");
        }
        st.read_count -= 1;

        if st.want_upgrade {
            let wake = st.read_count == 0 && Self::take_waiting(&mut st);
            drop(st);
            self.wake(wake);
            return false;
        }
        st.want_upgrade = true;

        // Upgrades are not interruptible: an Err is impossible here
        let mut st = match self.wait_while(st, |s| s.read_count != 0, false) {
            Ok(st) | Err(st) => st,
        };
        st.holder = Some(me);
        true
    }

    /// Convert the write hold into a read hold without letting a writer in
    pub fn downgrade_write_to_read(&self) {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        if st.holder != Some(me) {
            panic!("sleep lock: downgrade by a thread that does not hold it");
        }
        if st.recursive || st.recursion_depth != 0 {
            panic!("sleep lock: downgrade while recursion is enabled");
        }
        st.read_count += 1;
        if st.want_upgrade {
            st.want_upgrade = false;
        } else {
            st.want_write = false;
        }
        st.holder = None;
        let wake = Self::take_waiting(&mut st);
        drop(st);
        self.wake(wake);
    }

    /// Allow the write holder to re-enter
    pub fn enable_recursive(&self) -> RecursionToken {
        let me = self.sched.current_thread();
        let mut st = self.interlock.lock();
        if st.holder != Some(me) {
            panic!("sleep lock: enable_recursive requires the write hold");
        }
        if st.recursive {
            panic!("sleep lock: recursion already enabled");
        }
        st.recursive = true;
        st.recursion_epoch += 1;
        RecursionToken {
            lock: self.id(),
            epoch: st.recursion_epoch,
            _thread_bound: PhantomData,
        }
    }

    fn check_token(&self, st: &LockState, token: &RecursionToken) {
        let me = self.sched.current_thread();
        if token.lock != self.id() || !st.recursive || token.epoch != st.recursion_epoch {
            panic!("sleep lock: stale or foreign recursion token");
        }
        if st.holder != Some(me) {
            panic!("sleep lock: recursion token presented by a non-holder");
        }
    }

    /// Re-acquire the write side while already holding it
    pub fn acquire_write_recursive(&self, token: &RecursionToken) {
        let mut st = self.interlock.lock();
        self.check_token(&st, token);
        st.recursion_depth += 1;
    }

    /// Take a read hold while holding the write side
    pub fn acquire_read_recursive(&self, token: &RecursionToken) {
        let mut st = self.interlock.lock();
        self.check_token(&st, token);
        st.read_count += 1;
    }

    /// Withdraw recursion; all recursive holds must have been released
    pub fn disable_recursive(&self, token: RecursionToken) {
        let mut st = self.interlock.lock();
        self.check_token(&st, &token);
        if st.recursion_depth != 0 || st.read_count != 0 {
            panic!("sleep lock: disable_recursive with recursive holds outstanding");
        }
        st.recursive = false;
    }

    /// Get the current reader count
    pub fn read_count(&self) -> u32 {
        self.interlock.lock().read_count
    }

    /// Check if the write side is held or being claimed
    pub fn is_write_locked(&self) -> bool {
        let st = self.interlock.lock();
        st.want_write || st.want_upgrade
    }

    /// Thread holding the write side, if any
    pub fn holder(&self) -> Option<ThreadId> {
        self.interlock.lock().holder
    }
}

// ============================================================================
// Sleep Lock with Data
// ============================================================================

/// A sleep lock that protects data
pub struct SleepLocked<T> {
    lock: SleepLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by the reader/writer protocol of `lock`
unsafe impl<T: Send> Send for SleepLocked<T> {}
unsafe impl<T: Send + Sync> Sync for SleepLocked<T> {}

impl<T> SleepLocked<T> {
    pub fn new(data: T, sched: Arc<dyn Scheduler>, spin_budget: u32) -> Self {
        Self {
            lock: SleepLock::new(sched, true, spin_budget),
            data: UnsafeCell::new(data),
        }
    }

    /// The underlying lock (diagnostics only)
    pub fn raw(&self) -> &SleepLock {
        &self.lock
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock.acquire_read();
        ReadGuard { owner: self }
    }

    pub fn read_interruptible(&self, interruptible: bool) -> KernResult<ReadGuard<'_, T>> {
        self.lock.acquire_read_interruptible(interruptible)?;
        Ok(ReadGuard { owner: self })
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.lock.acquire_write();
        WriteGuard { owner: self }
    }

    pub fn write_interruptible(&self, interruptible: bool) -> KernResult<WriteGuard<'_, T>> {
        self.lock.acquire_write_interruptible(interruptible)?;
        Ok(WriteGuard { owner: self })
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.lock.try_acquire_read().then_some(ReadGuard { owner: self })
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.lock.try_acquire_write().then_some(WriteGuard { owner: self })
    }

    /// Exclusive access without locking (teardown paths)
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Shared hold on a `SleepLocked`
pub struct ReadGuard<'a, T> {
    owner: &'a SleepLocked<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Upgrade to a write hold. On failure nothing is held any more.
    pub fn upgrade(self) -> Option<WriteGuard<'a, T>> {
        let owner = self.owner;
        core::mem::forget(self);
        owner
            .lock
            .upgrade_read_to_write()
            .then_some(WriteGuard { owner })
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a read hold excludes writers
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}

/// Exclusive hold on a `SleepLocked`
pub struct WriteGuard<'a, T> {
    owner: &'a SleepLocked<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Trade the write hold for a read hold
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let owner = self.owner;
        core::mem::forget(self);
        owner.lock.downgrade_write_to_read();
        ReadGuard { owner }
    }

    /// Open a recursion scope. While it lives the guard itself is
    /// unusable, so recursive holds never alias a live `&mut T`.
    pub fn recursive(&mut self) -> Recursion<'_, T> {
        let token = self.owner.lock.enable_recursive();
        Recursion {
            owner: self.owner,
            token: Some(token),
        }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the write hold is exclusive
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the write hold is exclusive
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}

/// Recursion scope of a write holder
pub struct Recursion<'g, T> {
    owner: &'g SleepLocked<T>,
    token: Option<RecursionToken>,
}

impl<T> Recursion<'_, T> {
    fn token(&self) -> &RecursionToken {
        match &self.token {
            Some(token) => token,
            None => panic!("sleep lock: recursion scope already closed"),
        }
    }

    /// Re-enter for reading
    pub fn read(&self) -> RecursiveRead<'_, T> {
        self.owner.lock.acquire_read_recursive(self.token());
        RecursiveRead { owner: self.owner }
    }

    /// Re-enter for writing
    pub fn write(&mut self) -> RecursiveWrite<'_, T> {
        self.owner.lock.acquire_write_recursive(self.token());
        RecursiveWrite { owner: self.owner }
    }
}

impl<T> Drop for Recursion<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.owner.lock.disable_recursive(token);
        }
    }
}

/// Recursive read hold
pub struct RecursiveRead<'r, T> {
    owner: &'r SleepLocked<T>,
}

impl<T> Deref for RecursiveRead<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the write guard is frozen by the recursion borrow
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> Drop for RecursiveRead<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}

/// Recursive write hold
pub struct RecursiveWrite<'r, T> {
    owner: &'r SleepLocked<T>,
}

impl<T> Deref for RecursiveWrite<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive through `&mut Recursion`
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for RecursiveWrite<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive through `&mut Recursion`
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for RecursiveWrite<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}
