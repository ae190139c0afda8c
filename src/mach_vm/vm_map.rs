//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//! VM maps represent the virtual address space of a task.
//! Each map contains a set of map entries that describe the mappings.
//!
//! Entries live in a `BTreeMap` keyed by start address, so the list is
//! always address ordered. Splitting and merging replace entries and give
//! them fresh generations; an `EntryHandle` taken before a sleep is
//! revalidated rather than trusted.
//!
//! The entry list is protected by a `SleepLocked` whose timestamp is bumped
//! on every write acquisition; `lookup` hands out that timestamp so a fault
//! can `verify` the map did not change while it slept.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::lock::{ReadGuard, SleepLocked, WriteGuard};
use crate::kern::sched_prim::{event_for, WaitEvent, WaitResult};
use crate::mach_vm::pmap::Pmap;
use crate::mach_vm::vm_fault::vm_fault_page;
use crate::mach_vm::vm_object::{ObjectRef, VmObject};
use crate::mach_vm::vm_page::{checked_round_page, round_page, trunc_page, PAGE_MASK, PAGE_SIZE};
use crate::mach_vm::VmContext;

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// VM Map Types
// ============================================================================

/// VM Map ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

impl VmMapId {
    pub const NULL: Self = Self(0);
}

bitflags! {
    /// Memory protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        /// Read access
        const READ = 0x1;
        /// Write access
        const WRITE = 0x2;
        /// Execute access
        const EXECUTE = 0x4;
    }
}

impl VmProt {
    /// No access
    pub const NONE: Self = Self::empty();
    /// Default (read/write)
    pub const DEFAULT: Self = Self::READ.union(Self::WRITE);
    /// All permissions
    pub const ALL: Self = Self::all();

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Inheritance on fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmInherit {
    /// Child shares the memory with the parent
    Share,
    /// Child gets a copy-on-write copy
    #[default]
    Copy,
    /// Not mapped in the child
    None,
}

bitflags! {
    /// Placement flags for `VmMap::enter`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: u32 {
        /// Pick any free range at or above the address
        const ANYWHERE = 0x1;
        /// Replace whatever is mapped in the range
        const OVERWRITE = 0x2;
    }
}

/// Access attributes of a new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAttributes {
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
}

impl EntryAttributes {
    pub fn new(protection: VmProt, max_protection: VmProt, inheritance: VmInherit) -> Self {
        Self {
            protection,
            max_protection,
            inheritance,
        }
    }
}

impl Default for EntryAttributes {
    fn default() -> Self {
        Self::new(VmProt::DEFAULT, VmProt::ALL, VmInherit::Copy)
    }
}

/// Shared reference to a map
pub type MapRef = Arc<VmMap>;

// ============================================================================
// VM Map Entry
// ============================================================================

/// What an entry maps
#[derive(Debug)]
pub enum EntryTarget {
    /// Backing object; `None` until the first fault allocates one
    Object(Option<ObjectRef>),
    /// Nested map
    Submap(MapRef),
}

impl EntryTarget {
    fn duplicate(&self) -> Self {
        match self {
            EntryTarget::Object(object) => EntryTarget::Object(object.clone()),
            EntryTarget::Submap(map) => EntryTarget::Submap(Arc::clone(map)),
        }
    }
}

/// Revalidatable reference to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    start: u64,
    generation: u64,
}

impl EntryHandle {
    pub fn start(&self) -> u64 {
        self.start
    }
}

/// Result of `find_entry`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLookup {
    /// The entry containing the address
    Found(EntryHandle),
    /// Unmapped; `prev` is the entry the address would follow
    Gap { prev: Option<EntryHandle> },
}

/// VM Map Entry - describes a single mapping in the address space
#[derive(Debug)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: u64,
    /// End address of this entry (exclusive)
    pub end: u64,
    pub target: EntryTarget,
    /// Offset into the object or submap
    pub offset: u64,
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
    /// Kernel wirings (one for all user wirings together)
    pub wired_count: u32,
    pub user_wired_count: u32,
    pub is_shared: bool,
    /// Copy-on-write still has to be set up on the first write
    pub needs_copy: bool,
    pub in_transition: bool,
    pub needs_wakeup: bool,
    generation: u64,
}

impl VmMapEntry {
    pub(crate) fn new(start: u64, end: u64, target: EntryTarget, offset: u64, attrs: EntryAttributes) -> Self {
        Self {
            start,
            end,
            target,
            offset,
            protection: attrs.protection,
            max_protection: attrs.max_protection,
            inheritance: attrs.inheritance,
            wired_count: 0,
            user_wired_count: 0,
            is_shared: false,
            needs_copy: false,
            in_transition: false,
            needs_wakeup: false,
            generation: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn is_wired(&self) -> bool {
        self.wired_count > 0
    }

    pub fn is_submap(&self) -> bool {
        matches!(self.target, EntryTarget::Submap(_))
    }

    pub fn object(&self) -> Option<&ObjectRef> {
        match &self.target {
            EntryTarget::Object(object) => object.as_ref(),
            EntryTarget::Submap(_) => None,
        }
    }

    pub fn submap(&self) -> Option<&MapRef> {
        match &self.target {
            EntryTarget::Submap(map) => Some(map),
            EntryTarget::Object(_) => None,
        }
    }

    pub fn attributes(&self) -> EntryAttributes {
        EntryAttributes::new(self.protection, self.max_protection, self.inheritance)
    }

    pub fn handle(&self) -> EntryHandle {
        EntryHandle {
            start: self.start,
            generation: self.generation,
        }
    }

    /// Same mapping and attributes, with fresh wiring and transition state
    pub(crate) fn duplicate(&self) -> VmMapEntry {
        let mut copy = VmMapEntry::new(self.start, self.end, self.target.duplicate(), self.offset, self.attributes());
        copy.needs_copy = self.needs_copy;
        copy
    }

    /// Split at `at`, keeping the lower part; returns the upper part
    fn split(&mut self, at: u64) -> VmMapEntry {
        let mut upper = VmMapEntry::new(at, self.end, self.target.duplicate(), self.offset + (at - self.start), self.attributes());
        upper.wired_count = self.wired_count;
        upper.user_wired_count = self.user_wired_count;
        upper.is_shared = self.is_shared;
        upper.needs_copy = self.needs_copy;
        upper.in_transition = self.in_transition;
        upper.needs_wakeup = self.needs_wakeup;
        self.end = at;
        upper
    }

    /// Check if `next` can be folded into this entry
    fn can_merge(&self, next: &VmMapEntry) -> bool {
        if self.end != next.start {
            return false;
        }
        if self.attributes() != next.attributes()
            || self.wired_count != next.wired_count
            || self.user_wired_count != next.user_wired_count
            || self.is_shared != next.is_shared
            || self.needs_copy != next.needs_copy
            || self.in_transition
            || next.in_transition
        {
            return false;
        }
        let contiguous = self.offset + self.size() == next.offset;
        match (&self.target, &next.target) {
            (EntryTarget::Object(None), EntryTarget::Object(None)) => true,
            (EntryTarget::Object(Some(a)), EntryTarget::Object(Some(b))) => ObjectRef::ptr_eq(a, b) && contiguous,
            (EntryTarget::Submap(a), EntryTarget::Submap(b)) => Arc::ptr_eq(a, b) && contiguous,
            _ => false,
        }
    }
}

// ============================================================================
// Entry list
// ============================================================================

/// State protected by the map lock
pub(crate) struct MapInner {
    pub(crate) entries: BTreeMap<u64, VmMapEntry>,
    /// Total mapped size
    pub(crate) size: u64,
    next_generation: u64,
}

impl MapInner {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size: 0,
            next_generation: 1,
        }
    }

    pub(crate) fn insert(&mut self, mut entry: VmMapEntry) {
        entry.generation = self.next_generation;
        self.next_generation += 1;
        self.size += entry.size();
        let start = entry.start;
        if self.entries.insert(start, entry).is_some() {
            panic!("vm_map: two entries start at {:#x}", start);
        }
    }

    pub(crate) fn take(&mut self, start: u64) -> Option<VmMapEntry> {
        let entry = self.entries.remove(&start)?;
        self.size -= entry.size();
        Some(entry)
    }

    /// Start of the entry containing `addr`
    pub(crate) fn containing(&self, addr: u64) -> Option<u64> {
        self.entries
            .range(..=addr)
            .next_back()
            .filter(|(_, e)| e.contains(addr))
            .map(|(&start, _)| start)
    }

    /// Starts of the entries overlapping `[start, end)`, in order
    pub(crate) fn keys_in(&self, start: u64, end: u64) -> Vec<u64> {
        let first = self.containing(start).unwrap_or(start);
        self.entries
            .range(first..end)
            .filter(|(_, e)| e.overlaps(start, end))
            .map(|(&k, _)| k)
            .collect()
    }

    pub(crate) fn first_overlapping(&self, start: u64, end: u64) -> Option<u64> {
        self.keys_in(start, end).first().copied()
    }

    /// Whether some address in `[start, end)` is unmapped
    pub(crate) fn has_hole(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for key in self.keys_in(start, end) {
            let entry = &self.entries[&key];
            if entry.start > cursor {
                return true;
            }
            cursor = entry.end;
        }
        cursor < end
    }

    /// Make sure an entry boundary falls at `addr`
    pub(crate) fn clip(&mut self, addr: u64) {
        let key = match self.containing(addr) {
            Some(key) if key != addr => key,
            _ => return,
        };
        if let Some(mut lower) = self.take(key) {
            let upper = lower.split(addr);
            self.insert(lower);
            self.insert(upper);
        }
    }

    /// Fold the entry at `key` into its predecessor when they match
    pub(crate) fn simplify(&mut self, key: u64) {
        let prev_key = match self.entries.range(..key).next_back() {
            Some((&prev_key, prev)) => match self.entries.get(&key) {
                Some(entry) if prev.can_merge(entry) => prev_key,
                _ => return,
            },
            None => return,
        };
        if let (Some(mut prev), Some(entry)) = (self.take(prev_key), self.take(key)) {
            prev.end = entry.end;
            self.insert(prev);
            drop(entry);
        }
    }
}

// ============================================================================
// Lookup results
// ============================================================================

/// Map timestamps captured by `lookup`
#[derive(Debug, Clone)]
pub struct MapVersion {
    timestamp: u64,
    submaps: Vec<(MapRef, u64)>,
}

/// Where an address lives
#[derive(Debug)]
pub struct LookupResult {
    /// First object of the chain backing the address
    pub object: ObjectRef,
    pub offset: u64,
    /// Protection to give the hardware mapping
    pub protection: VmProt,
    pub wired: bool,
    pub version: MapVersion,
}

// ============================================================================
// VM Map
// ============================================================================

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

const EVENT_SPACE: u64 = 1;
const EVENT_ENTRY: u64 = 2;

/// VM Map - represents a task's address space
pub struct VmMap {
    id: VmMapId,
    ctx: Arc<VmContext>,
    pmap: Arc<dyn Pmap>,
    min_offset: u64,
    max_offset: u64,
    inner: SleepLocked<MapInner>,
    timestamp: AtomicU64,
    /// Start of the last entry found
    hint: AtomicU64,
    wait_for_space: AtomicBool,
    wiring_required: AtomicBool,
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMap")
            .field("id", &self.id)
            .field("min_offset", &format_args!("{:#x}", self.min_offset))
            .field("max_offset", &format_args!("{:#x}", self.max_offset))
            .finish()
    }
}

impl VmMap {
    /// Create an empty map covering `[min, max)`
    pub fn create(ctx: &Arc<VmContext>, min: u64, max: u64) -> KernResult<MapRef> {
        let min = round_page(min);
        let max = trunc_page(max);
        if min >= max {
            return Err(KernError::InvalidArgument);
        }
        let map = Arc::new(VmMap {
            id: VmMapId(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed)),
            ctx: Arc::clone(ctx),
            pmap: ctx.pmaps().create(),
            min_offset: min,
            max_offset: max,
            inner: SleepLocked::new(
                MapInner::new(),
                Arc::clone(ctx.scheduler()),
                ctx.config().lock_spin_budget,
            ),
            timestamp: AtomicU64::new(0),
            hint: AtomicU64::new(min),
            wait_for_space: AtomicBool::new(false),
            wiring_required: AtomicBool::new(false),
        });
        debug!("vm_map {:?}: created [{:#x}, {:#x})", map.id, min, max);
        Ok(map)
    }

    /// Map with the configured user bounds
    pub fn create_user(ctx: &Arc<VmContext>) -> KernResult<MapRef> {
        Self::create(ctx, ctx.config().user_min, ctx.config().user_max)
    }

    pub fn id(&self) -> VmMapId {
        self.id
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub fn pmap(&self) -> &Arc<dyn Pmap> {
        &self.pmap
    }

    pub fn min_offset(&self) -> u64 {
        self.min_offset
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    pub fn set_wait_for_space(&self, wait: bool) {
        self.wait_for_space.store(wait, Ordering::SeqCst);
    }

    pub fn set_wiring_required(&self, required: bool) {
        self.wiring_required.store(required, Ordering::SeqCst);
    }

    /// Total mapped size
    pub fn size(&self) -> u64 {
        self.lock_read().size
    }

    pub fn entry_count(&self) -> usize {
        self.lock_read().entries.len()
    }

    /// Hardware translations currently installed
    pub fn resident_count(&self) -> usize {
        self.pmap.resident_count()
    }

    // ========================================================================
    // Locking
    // ========================================================================

    pub(crate) fn lock_read(&self) -> ReadGuard<'_, MapInner> {
        self.inner.read()
    }

    pub(crate) fn try_lock_read(&self) -> Option<ReadGuard<'_, MapInner>> {
        self.inner.try_read()
    }

    pub(crate) fn lock_write(&self) -> WriteGuard<'_, MapInner> {
        let guard = self.inner.write();
        self.timestamp.fetch_add(1, Ordering::SeqCst);
        guard
    }

    /// Trade a read hold for a write hold. If the upgrade loses the race the
    /// lock is taken afresh, so the caller must look its entry up again.
    fn upgrade<'a>(&'a self, guard: ReadGuard<'a, MapInner>) -> WriteGuard<'a, MapInner> {
        match guard.upgrade() {
            Some(guard) => {
                self.timestamp.fetch_add(1, Ordering::SeqCst);
                guard
            }
            None => self.lock_write(),
        }
    }

    pub(crate) fn space_event(&self) -> WaitEvent {
        event_for(self, EVENT_SPACE)
    }

    fn entry_event(&self) -> WaitEvent {
        event_for(self, EVENT_ENTRY)
    }

    fn sleep(&self, guard: WriteGuard<'_, MapInner>, event: WaitEvent, interruptible: bool) -> KernResult<()> {
        let token = self.ctx.scheduler().assert_wait(event, interruptible);
        drop(guard);
        match self.ctx.scheduler().thread_block(token) {
            WaitResult::Normal => Ok(()),
            WaitResult::Interrupted => Err(KernError::Aborted),
        }
    }

    /// Sleep until the in-transition entry at `key` settles. The lock is
    /// released; the caller restarts its search.
    pub(crate) fn wait_for_entry(
        &self,
        mut guard: WriteGuard<'_, MapInner>,
        key: u64,
        interruptible: bool,
    ) -> KernResult<()> {
        if let Some(entry) = guard.entries.get_mut(&key) {
            entry.needs_wakeup = true;
        }
        trace!("vm_map {:?}: waiting for entry at {:#x}", self.id, key);
        self.sleep(guard, self.entry_event(), interruptible)
    }

    /// Write lock with no entry of `[start, end)` in transition
    fn lock_write_settled(&self, start: u64, end: u64) -> KernResult<WriteGuard<'_, MapInner>> {
        loop {
            let guard = self.lock_write();
            match Self::transition_key(&guard, start, end) {
                Some(key) => self.wait_for_entry(guard, key, false)?,
                None => return Ok(guard),
            }
        }
    }

    pub(crate) fn transition_key(inner: &MapInner, start: u64, end: u64) -> Option<u64> {
        inner
            .keys_in(start, end)
            .into_iter()
            .find(|k| inner.entries.get(k).is_some_and(|e| e.in_transition))
    }

    // ========================================================================
    // Searching
    // ========================================================================

    /// Find the entry containing `address`, or the entry it would follow
    pub fn find_entry(&self, address: u64) -> EntryLookup {
        let inner = self.lock_read();
        self.lookup_entry(&inner, address)
    }

    fn lookup_entry(&self, inner: &MapInner, address: u64) -> EntryLookup {
        let hint = self.hint.load(Ordering::Relaxed);
        if let Some(entry) = inner.entries.get(&hint) {
            if entry.contains(address) {
                return EntryLookup::Found(entry.handle());
            }
        }
        match inner.entries.range(..=address).next_back() {
            Some((_, entry)) if entry.contains(address) => {
                self.hint.store(entry.start, Ordering::Relaxed);
                EntryLookup::Found(entry.handle())
            }
            Some((_, entry)) => EntryLookup::Gap {
                prev: Some(entry.handle()),
            },
            None => EntryLookup::Gap { prev: None },
        }
    }

    /// Run `f` on the entry behind `handle` if it is still the same entry
    pub fn with_entry<R>(&self, handle: EntryHandle, f: impl FnOnce(&VmMapEntry) -> R) -> Option<R> {
        let inner = self.lock_read();
        inner
            .entries
            .get(&handle.start)
            .filter(|e| e.generation == handle.generation)
            .map(f)
    }

    /// Visit every entry in address order
    pub fn for_each_entry(&self, mut f: impl FnMut(&VmMapEntry)) {
        let inner = self.lock_read();
        for entry in inner.entries.values() {
            f(entry);
        }
    }

    /// Lowest free `size`-byte range at or above `hint`, aligned to `mask + 1`
    pub(crate) fn find_space(&self, inner: &MapInner, hint: u64, size: u64, mask: u64) -> Option<u64> {
        let search = |from: u64| -> Option<u64> {
            let align = |addr: u64| addr.checked_add(mask).map(|a| a & !mask);
            let mut addr = align(from.max(self.min_offset))?;
            if let Some((_, entry)) = inner.entries.range(..=addr).next_back() {
                if entry.end > addr {
                    addr = align(entry.end)?;
                }
            }
            for entry in inner.entries.range(addr..).map(|(_, e)| e) {
                if addr.checked_add(size)? <= entry.start {
                    return Some(addr);
                }
                addr = align(entry.end.max(addr))?;
            }
            (addr.checked_add(size)? <= self.max_offset).then_some(addr)
        };
        match search(hint) {
            Some(addr) => Some(addr),
            None if hint > self.min_offset => search(self.min_offset),
            None => None,
        }
    }

    // ========================================================================
    // Enter / Remove
    // ========================================================================

    /// Map `object` (or lazily allocated zero-fill memory when `None`).
    ///
    /// Returns the start address chosen.
    #[allow(clippy::too_many_arguments)]
    pub fn enter(
        &self,
        address: u64,
        size: u64,
        mask: u64,
        flags: EnterFlags,
        object: Option<ObjectRef>,
        offset: u64,
        needs_copy: bool,
        attrs: EntryAttributes,
    ) -> KernResult<u64> {
        if size == 0 || !attrs.max_protection.contains(attrs.protection) {
            return Err(KernError::InvalidArgument);
        }
        let mask = mask | PAGE_MASK;
        let (mut guard, start, end, displaced) = if flags.contains(EnterFlags::ANYWHERE) {
            let size = checked_round_page(size).ok_or(KernError::NoSpace)?;
            let (guard, start) = self.reserve_space(address, size, mask)?;
            (guard, start, start + size, Vec::new())
        } else {
            let start = trunc_page(address);
            let end = address
                .checked_add(size)
                .and_then(checked_round_page)
                .ok_or(KernError::NoSpace)?;
            if start < self.min_offset || end > self.max_offset {
                return Err(KernError::NoSpace);
            }
            loop {
                let mut guard = self.lock_write();
                if guard.first_overlapping(start, end).is_none() {
                    break (guard, start, end, Vec::new());
                }
                if !flags.contains(EnterFlags::OVERWRITE) {
                    return Err(KernError::MemoryPresent);
                }
                match self.delete_range(&mut guard, start, end) {
                    Ok(removed) => break (guard, start, end, removed),
                    Err(key) => self.wait_for_entry(guard, key, false)?,
                }
            }
        };

        if !(object.is_none() && !needs_copy && self.extend_previous(&mut guard, start, end - start, attrs)) {
            let mut entry = VmMapEntry::new(start, end, EntryTarget::Object(object), offset, attrs);
            entry.needs_copy = needs_copy;
            guard.insert(entry);
        }
        let result = self.finish_insert(guard, start, end, attrs.protection);
        drop(displaced);
        result?;
        trace!("vm_map {:?}: entered [{:#x}, {:#x})", self.id, start, end);
        Ok(start)
    }

    /// Take the write lock with `size` bytes free at or above `hint`.
    /// Maps that wait for space sleep until a removal frees some.
    pub(crate) fn reserve_space(&self, hint: u64, size: u64, mask: u64) -> KernResult<(WriteGuard<'_, MapInner>, u64)> {
        loop {
            let guard = self.lock_write();
            match self.find_space(&guard, hint, size, mask) {
                Some(start) => return Ok((guard, start)),
                None if self.wait_for_space.load(Ordering::SeqCst) => {
                    trace!("vm_map {:?}: waiting for {:#x} bytes of space", self.id, size);
                    self.sleep(guard, self.space_event(), true)?;
                }
                None => return Err(KernError::NoSpace),
            }
        }
    }

    /// Release the lock after inserting `[start, end)`, wiring the range
    /// first when the map requires it. A failed wiring unmaps the range.
    pub(crate) fn finish_insert(
        &self,
        guard: WriteGuard<'_, MapInner>,
        start: u64,
        end: u64,
        access: VmProt,
    ) -> KernResult<()> {
        if !self.wiring_required.load(Ordering::SeqCst) {
            drop(guard);
            return Ok(());
        }
        match self.wire_locked(guard, start, end, access, false) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.remove(start, end)?;
                Err(err)
            }
        }
    }

    /// Grow the entry ending at `start` instead of adding a new one
    fn extend_previous(&self, inner: &mut MapInner, start: u64, size: u64, attrs: EntryAttributes) -> bool {
        let prev_key = match inner.entries.range(..start).next_back() {
            Some((&key, prev)) => {
                let plain = prev.end == start
                    && prev.attributes() == attrs
                    && prev.wired_count == 0
                    && !prev.is_shared
                    && !prev.needs_copy
                    && !prev.in_transition;
                let grows = match &prev.target {
                    EntryTarget::Object(None) => true,
                    EntryTarget::Object(Some(object)) => plain && object.coalesce(prev.offset, prev.size(), size),
                    EntryTarget::Submap(_) => false,
                };
                if !(plain && grows) {
                    return false;
                }
                key
            }
            None => return false,
        };
        if let Some(mut prev) = inner.take(prev_key) {
            prev.end = start + size;
            inner.insert(prev);
        }
        true
    }

    /// Unmap `[start, end)`
    pub fn remove(&self, start: u64, end: u64) -> KernResult<()> {
        if end < start {
            return Err(KernError::InvalidArgument);
        }
        if start == end {
            return Ok(());
        }
        let start = trunc_page(start).max(self.min_offset);
        let end = checked_round_page(end).unwrap_or(self.max_offset).min(self.max_offset);
        if start >= end {
            return Ok(());
        }
        loop {
            let mut guard = self.lock_write();
            match self.delete_range(&mut guard, start, end) {
                Ok(removed) => {
                    drop(guard);
                    if !removed.is_empty() {
                        debug!(
                            "vm_map {:?}: removed {} entries in [{:#x}, {:#x})",
                            self.id,
                            removed.len(),
                            start,
                            end
                        );
                        drop(removed);
                        self.ctx.scheduler().wakeup(self.space_event());
                    }
                    return Ok(());
                }
                Err(key) => self.wait_for_entry(guard, key, false)?,
            }
        }
    }

    /// Detach the entries in `[start, end)`. Fails with the key of an
    /// in-transition entry without changing anything. The caller drops the
    /// returned entries once the map lock is released.
    pub(crate) fn delete_range(&self, inner: &mut MapInner, start: u64, end: u64) -> Result<Vec<VmMapEntry>, u64> {
        if let Some(key) = Self::transition_key(inner, start, end) {
            return Err(key);
        }
        inner.clip(start);
        inner.clip(end);
        let mut removed = Vec::new();
        for key in inner.keys_in(start, end) {
            if let Some(mut entry) = inner.take(key) {
                if entry.wired_count > 0 {
                    self.unwire_entry_pages(&entry);
                    entry.wired_count = 0;
                    entry.user_wired_count = 0;
                }
                self.pmap.remove(entry.start, entry.end);
                removed.push(entry);
            }
        }
        Ok(removed)
    }

    /// Install `submap` over `[start, end)`, translating to `offset` in it
    pub fn submap(&self, start: u64, end: u64, submap: MapRef, offset: u64) -> KernResult<()> {
        if core::ptr::eq(self, &*submap) {
            return Err(KernError::InvalidArgument);
        }
        let start = trunc_page(start);
        let end = round_page(end);
        if start >= end || start < self.min_offset || end > self.max_offset {
            return Err(KernError::InvalidAddress);
        }
        let mut guard = self.lock_write();
        if guard.first_overlapping(start, end).is_some() {
            return Err(KernError::MemoryPresent);
        }
        let attrs = EntryAttributes::new(VmProt::DEFAULT, VmProt::ALL, VmInherit::Share);
        debug!("vm_map {:?}: submap {:?} at [{:#x}, {:#x})", self.id, submap.id, start, end);
        guard.insert(VmMapEntry::new(start, end, EntryTarget::Submap(submap), offset, attrs));
        Ok(())
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Change protection of `[start, end)`; with `set_max` the maximum
    /// protection is set and current protection clipped to it.
    pub fn protect(&self, start: u64, end: u64, new_prot: VmProt, set_max: bool) -> KernResult<()> {
        if end < start {
            return Err(KernError::InvalidArgument);
        }
        let start = trunc_page(start);
        let end = round_page(end);
        if start == end {
            return Ok(());
        }
        let mut guard = self.lock_write_settled(start, end)?;
        let keys = guard.keys_in(start, end);
        for key in &keys {
            if !guard.entries[key].max_protection.contains(new_prot) {
                return Err(KernError::ProtectionFailure);
            }
        }
        guard.clip(start);
        guard.clip(end);
        let keys = guard.keys_in(start, end);
        for key in &keys {
            let entry = match guard.entries.get_mut(key) {
                Some(entry) => entry,
                None => continue,
            };
            let old = entry.protection;
            if set_max {
                entry.max_protection = new_prot;
                entry.protection &= new_prot;
            } else {
                entry.protection = new_prot;
            }
            if entry.protection != old {
                let mut hardware = entry.protection;
                if entry.needs_copy {
                    hardware.remove(VmProt::WRITE);
                }
                self.pmap.protect(entry.start, entry.end, hardware);
            }
        }
        Self::simplify_range(&mut guard, &keys, end);
        Ok(())
    }

    /// Set the fork inheritance of `[start, end)`
    pub fn inherit(&self, start: u64, end: u64, inheritance: VmInherit) -> KernResult<()> {
        if end < start {
            return Err(KernError::InvalidArgument);
        }
        let start = trunc_page(start);
        let end = round_page(end);
        if start == end {
            return Ok(());
        }
        let mut guard = self.lock_write();
        guard.clip(start);
        guard.clip(end);
        let keys = guard.keys_in(start, end);
        for key in &keys {
            if let Some(entry) = guard.entries.get_mut(key) {
                entry.inheritance = inheritance;
            }
        }
        Self::simplify_range(&mut guard, &keys, end);
        Ok(())
    }

    fn simplify_range(inner: &mut MapInner, keys: &[u64], end: u64) {
        for &key in keys.iter().rev() {
            inner.simplify(key);
        }
        inner.simplify(end);
    }

    // ========================================================================
    // Lookup / Verify
    // ========================================================================

    /// Resolve `vaddr` for `access`.
    ///
    /// A write to a needs-copy entry shadows its object first; an entry
    /// without an object gets one. Both need the write lock, taken by
    /// upgrading and then downgraded again before the result is built.
    pub fn lookup(&self, vaddr: u64, access: VmProt) -> KernResult<LookupResult> {
        let mut guard = self.lock_read();
        loop {
            let key = match self.lookup_entry(&guard, vaddr) {
                EntryLookup::Found(handle) => handle.start,
                EntryLookup::Gap { .. } => return Err(KernError::InvalidAddress),
            };
            let entry = match guard.entries.get(&key) {
                Some(entry) => entry,
                None => return Err(KernError::InvalidAddress),
            };
            if !entry.protection.contains(access) {
                return Err(KernError::ProtectionFailure);
            }

            if let EntryTarget::Submap(submap) = &entry.target {
                let submap = Arc::clone(submap);
                let sub_addr = entry.offset + (vaddr - entry.start);
                let protection = entry.protection;
                let mut result = submap.lookup(sub_addr, access)?;
                result.protection &= protection;
                let mut submaps = Vec::with_capacity(result.version.submaps.len() + 1);
                submaps.push((submap, result.version.timestamp));
                submaps.append(&mut result.version.submaps);
                result.version = MapVersion {
                    timestamp: self.timestamp(),
                    submaps,
                };
                return Ok(result);
            }

            let write = access.contains(VmProt::WRITE);
            let object = match &entry.target {
                EntryTarget::Object(Some(object)) if !(write && entry.needs_copy) => object.clone(),
                _ => {
                    let mut writer = self.upgrade(guard);
                    self.resolve_entry(&mut writer, vaddr, write)?;
                    guard = writer.downgrade();
                    continue;
                }
            };

            let mut protection = entry.protection;
            if entry.needs_copy {
                protection.remove(VmProt::WRITE);
            }
            return Ok(LookupResult {
                object,
                offset: entry.offset + (vaddr - entry.start),
                protection,
                wired: entry.wired_count > 0,
                version: MapVersion {
                    timestamp: self.timestamp(),
                    submaps: Vec::new(),
                },
            });
        }
    }

    /// Give the entry containing `vaddr` an object, and a private shadow
    /// when it is written while still needing a copy.
    fn resolve_entry(&self, inner: &mut MapInner, vaddr: u64, write: bool) -> KernResult<()> {
        let entry = match inner.containing(vaddr).and_then(|key| inner.entries.get_mut(&key)) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        Self::materialize(&self.ctx, entry, write)
    }

    /// Allocate the object of a lazy entry; with `write`, also resolve a
    /// pending copy by shadowing.
    fn materialize(ctx: &Arc<VmContext>, entry: &mut VmMapEntry, write: bool) -> KernResult<()> {
        let size = entry.size();
        let slot = match &mut entry.target {
            EntryTarget::Object(slot) => slot,
            EntryTarget::Submap(_) => return Ok(()),
        };
        if slot.is_none() {
            *slot = Some(VmObject::allocate(ctx, size)?);
            entry.offset = 0;
            entry.needs_copy = false;
        }
        if write && entry.needs_copy {
            if let Some(object) = slot.as_ref() {
                let (shadow, offset) = object.shadow(entry.offset, size)?;
                *slot = Some(shadow);
                entry.offset = offset;
            }
            entry.needs_copy = false;
        }
        Ok(())
    }

    /// Whether nothing changed since `version` was taken
    pub fn verify(&self, version: &MapVersion) -> bool {
        self.timestamp() == version.timestamp
            && version
                .submaps
                .iter()
                .all(|(submap, stamp)| submap.timestamp() == *stamp)
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Duplicate this map for a child task, honoring each entry's
    /// inheritance.
    pub fn fork(&self) -> KernResult<MapRef> {
        let child = VmMap::create(&self.ctx, self.min_offset, self.max_offset)?;
        let mut guard = self.lock_write();
        let keys: Vec<u64> = guard.entries.keys().copied().collect();
        let mut inherited = Vec::new();
        for key in keys {
            let entry = match guard.entries.get_mut(&key) {
                Some(entry) => entry,
                None => continue,
            };
            match entry.inheritance {
                VmInherit::None => {}
                VmInherit::Share => {
                    if !entry.is_submap() {
                        Self::materialize(&self.ctx, entry, true)?;
                        entry.is_shared = true;
                    }
                    let mut shared = entry.duplicate();
                    shared.is_shared = entry.is_shared;
                    inherited.push(shared);
                }
                VmInherit::Copy => inherited.push(self.copy_entry(entry)?),
            }
        }
        drop(guard);

        let count = inherited.len();
        {
            let mut child_guard = child.lock_write();
            for entry in inherited {
                child_guard.insert(entry);
            }
        }
        debug!("vm_map {:?}: forked into {:?} ({} entries)", self.id, child.id, count);
        Ok(child)
    }

    /// Copy of `entry` for another map. Symmetric copies mark both sides
    /// needs-copy; shared or wired memory is copied eagerly.
    pub(crate) fn copy_entry(&self, entry: &mut VmMapEntry) -> KernResult<VmMapEntry> {
        let mut copy = entry.duplicate();
        let object = match &entry.target {
            EntryTarget::Object(Some(object)) => object.clone(),
            _ => return Ok(copy),
        };
        if entry.wired_count > 0 || entry.is_shared {
            copy.target = EntryTarget::Object(Some(object.copy_slowly(entry.offset, entry.size(), false)?));
            copy.offset = 0;
            copy.needs_copy = false;
            return Ok(copy);
        }
        let (new_object, offset, needs_copy) = object.copy_strategically(entry.offset, entry.size())?;
        if needs_copy && !entry.needs_copy {
            entry.needs_copy = true;
            self.pmap.protect(entry.start, entry.end, entry.protection - VmProt::WRITE);
        }
        copy.target = EntryTarget::Object(Some(new_object));
        copy.offset = offset;
        copy.needs_copy = needs_copy;
        Ok(copy)
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Kernel wiring: `VmProt::NONE` unwires, anything else wires for that access
    pub fn pageable(&self, start: u64, end: u64, access: VmProt) -> KernResult<()> {
        if access.is_empty() {
            self.unwire(start, end, false)
        } else {
            self.wire(start, end, access, false)
        }
    }

    /// Fault in and pin `[start, end)`
    pub fn wire(&self, start: u64, end: u64, access: VmProt, user: bool) -> KernResult<()> {
        let start = trunc_page(start);
        let end = round_page(end);
        if start >= end {
            return Ok(());
        }
        let guard = self.lock_write_settled(start, end)?;
        if guard.has_hole(start, end) {
            return Err(KernError::InvalidArgument);
        }
        self.wire_locked(guard, start, end, access, user)
    }

    /// Wire `[start, end)` starting from a held write lock.
    ///
    /// The wirings are counted and the entries marked in transition under
    /// the lock; the lock is then released while the pages are faulted in,
    /// since that may wait on a pager. Entries are looked up again by range
    /// afterwards.
    pub(crate) fn wire_locked(
        &self,
        mut guard: WriteGuard<'_, MapInner>,
        start: u64,
        end: u64,
        access: VmProt,
        user: bool,
    ) -> KernResult<()> {
        for key in guard.keys_in(start, end) {
            let entry = &guard.entries[&key];
            if entry.is_submap() {
                return Err(KernError::InvalidArgument);
            }
            if !entry.protection.contains(access) {
                return Err(KernError::ProtectionFailure);
            }
        }
        guard.clip(start);
        guard.clip(end);
        let keys = guard.keys_in(start, end);

        let mut to_fault = Vec::new();
        for (index, &key) in keys.iter().enumerate() {
            let entry = match guard.entries.get_mut(&key) {
                Some(entry) => entry,
                None => continue,
            };
            let first = entry.wired_count == 0;
            if user {
                if entry.user_wired_count == 0 {
                    entry.wired_count += 1;
                }
                entry.user_wired_count += 1;
            } else {
                entry.wired_count += 1;
            }
            if !first {
                continue;
            }
            let writable = entry.protection.contains(VmProt::WRITE);
            if let Err(err) = Self::materialize(&self.ctx, entry, writable) {
                Self::drop_wiring(&mut guard, &keys[..=index], user);
                return Err(err);
            }
            if let Some(span) = WireSpan::of(entry) {
                to_fault.push(span);
            }
        }
        for key in &keys {
            if let Some(entry) = guard.entries.get_mut(key) {
                entry.in_transition = true;
            }
        }
        drop(guard);

        let failure = self.fault_wired(&to_fault);

        let mut guard = self.lock_write();
        let keys = guard.keys_in(start, end);
        let mut wake = false;
        for key in &keys {
            if let Some(entry) = guard.entries.get_mut(key) {
                entry.in_transition = false;
                wake |= core::mem::take(&mut entry.needs_wakeup);
            }
        }
        let result = match failure {
            Some((failed, failed_va, err)) => {
                warn!("vm_map {:?}: wiring failed at {:#x}: {}", self.id, failed_va, err);
                for (index, span) in to_fault.iter().enumerate().take(failed + 1) {
                    let until = if index == failed { failed_va } else { span.end };
                    self.unwire_span(span, span.start, until);
                }
                Self::drop_wiring(&mut guard, &keys, user);
                Err(err)
            }
            None => Ok(()),
        };
        drop(guard);
        if wake {
            self.ctx.scheduler().wakeup(self.entry_event());
        }
        result
    }

    /// Fault and pin every page of `spans`; returns the index of the
    /// failing span, the address and the error.
    fn fault_wired(&self, spans: &[WireSpan]) -> Option<(usize, u64, KernError)> {
        for (index, span) in spans.iter().enumerate() {
            let access = if span.protection.contains(VmProt::WRITE) {
                VmProt::READ | VmProt::WRITE
            } else {
                VmProt::READ
            };
            let mut va = span.start;
            while va < span.end {
                match vm_fault_page(span.object.arc(), span.offset + (va - span.start), access, false) {
                    Ok(held) => {
                        held.wire();
                        self.pmap.enter(va, held.phys_addr(), span.protection, true);
                    }
                    Err(err) => return Some((index, va, err)),
                }
                va += PAGE;
            }
        }
        None
    }

    fn drop_wiring(inner: &mut MapInner, keys: &[u64], user: bool) {
        for key in keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                if user {
                    entry.user_wired_count -= 1;
                    if entry.user_wired_count == 0 {
                        entry.wired_count -= 1;
                    }
                } else {
                    entry.wired_count -= 1;
                }
            }
        }
    }

    /// Release one wiring of `[start, end)`
    pub fn unwire(&self, start: u64, end: u64, user: bool) -> KernResult<()> {
        let start = trunc_page(start);
        let end = round_page(end);
        if start >= end {
            return Ok(());
        }
        let mut guard = self.lock_write_settled(start, end)?;
        if guard.has_hole(start, end) {
            return Err(KernError::InvalidArgument);
        }
        for key in guard.keys_in(start, end) {
            let entry = &guard.entries[&key];
            let kernel_wirings = entry.wired_count - u32::from(entry.user_wired_count > 0);
            let wired = if user { entry.user_wired_count > 0 } else { kernel_wirings > 0 };
            if !wired {
                return Err(KernError::InvalidArgument);
            }
        }
        guard.clip(start);
        guard.clip(end);
        let keys = guard.keys_in(start, end);
        Self::drop_wiring(&mut guard, &keys, user);
        for key in &keys {
            if let Some(entry) = guard.entries.get(key) {
                if entry.wired_count == 0 {
                    self.unwire_entry_pages(entry);
                }
            }
        }
        Self::simplify_range(&mut guard, &keys, end);
        Ok(())
    }

    fn unwire_entry_pages(&self, entry: &VmMapEntry) {
        if let Some(span) = WireSpan::of(entry) {
            self.unwire_span(&span, span.start, span.end);
        }
    }

    fn unwire_span(&self, span: &WireSpan, start: u64, end: u64) {
        let mut va = start;
        while va < end {
            match vm_fault_page(span.object.arc(), span.offset + (va - span.start), VmProt::READ, false) {
                Ok(held) => {
                    held.unwire();
                    if let Some((pa, prot)) = self.pmap.extract(va) {
                        self.pmap.enter(va, pa, prot, false);
                    }
                }
                Err(err) => warn!("vm_map {:?}: unwire at {:#x} failed: {}", self.id, va, err),
            }
            va += PAGE;
        }
    }
}

/// Object range of one entry being wired, usable without the map lock
struct WireSpan {
    start: u64,
    end: u64,
    object: ObjectRef,
    offset: u64,
    /// Hardware protection for the wired translations
    protection: VmProt,
}

impl WireSpan {
    fn of(entry: &VmMapEntry) -> Option<Self> {
        let object = entry.object()?.clone();
        let mut protection = entry.protection;
        if entry.needs_copy {
            protection.remove(VmProt::WRITE);
        }
        Some(Self {
            start: entry.start,
            end: entry.end,
            object,
            offset: entry.offset,
            protection,
        })
    }
}

impl Drop for VmMap {
    fn drop(&mut self) {
        let entries = core::mem::take(&mut self.inner.get_mut().entries);
        self.inner.get_mut().size = 0;
        for entry in entries.values().filter(|e| e.wired_count > 0) {
            self.unwire_entry_pages(entry);
        }
        self.pmap.remove(self.min_offset, self.max_offset);
        debug!("vm_map {:?}: destroyed with {} entries", self.id, entries.len());
        drop(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::mach_vm::vm_page::PageFrameAllocator;
    use crate::mach_vm::VmConfig;

    fn setup() -> (Arc<VmContext>, MapRef) {
        let ctx = VmContext::host(VmConfig::default(), 128);
        let map = VmMap::create(&ctx, 0x1000, 0x100_000).unwrap();
        (ctx, map)
    }

    fn enter_at(map: &VmMap, start: u64, size: u64) -> KernResult<u64> {
        map.enter(start, size, 0, EnterFlags::empty(), None, 0, false, EntryAttributes::default())
    }

    fn ranges(map: &VmMap) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        map.for_each_entry(|e| out.push((e.start, e.end)));
        out
    }

    #[test]
    fn test_vm_prot() {
        let prot = VmProt::READ | VmProt::WRITE;
        assert!(prot.can_read());
        assert!(prot.can_write());
        assert!(!prot.can_execute());
        assert_eq!(prot, VmProt::DEFAULT);
        assert!(VmProt::ALL.contains(VmProt::EXECUTE));
        assert!(VmProt::NONE.is_empty());
    }

    #[test]
    fn test_create_rejects_empty_bounds() {
        let ctx = VmContext::host(VmConfig::default(), 4);
        assert_eq!(VmMap::create(&ctx, 0x5000, 0x5000).err(), Some(KernError::InvalidArgument));
        let map = VmMap::create_user(&ctx).unwrap();
        assert_eq!(map.min_offset(), ctx.config().user_min);
    }

    #[test]
    fn test_enter_fixed_and_overlap() {
        let (_ctx, map) = setup();
        assert_eq!(enter_at(&map, 0x4000, 0x2000), Ok(0x4000));
        assert_eq!(enter_at(&map, 0x5000, 0x1000), Err(KernError::MemoryPresent));
        assert_eq!(map.entry_count(), 1);
        assert_eq!(map.size(), 0x2000);
    }

    #[test]
    fn test_enter_exact_bounds_and_beyond() {
        let (_ctx, map) = setup();
        assert_eq!(enter_at(&map, 0x100_000, 0x1000), Err(KernError::NoSpace));
        assert_eq!(enter_at(&map, 0x1000, 0xff_000), Ok(0x1000));
        map.remove(0x1000, 0x100_000).unwrap();
        assert_eq!(enter_at(&map, 0x1000, 0xff_000 + 1), Err(KernError::NoSpace));
    }

    #[test]
    fn test_enter_anywhere_finds_gap() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x1000, 0x1000).unwrap();
        enter_at(&map, 0x3000, 0x1000).unwrap();
        let placed = map
            .enter(0, 0x1000, 0, EnterFlags::ANYWHERE, None, 0, false, EntryAttributes::default())
            .unwrap();
        assert_eq!(placed, 0x2000);
        let aligned = map
            .enter(0, 0x1000, 0xffff, EnterFlags::ANYWHERE, None, 0, false, EntryAttributes::default())
            .unwrap();
        assert_eq!(aligned, 0x10000);
    }

    #[test]
    fn test_enter_coalesces_lazy_neighbours() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x1000).unwrap();
        enter_at(&map, 0x5000, 0x1000).unwrap();
        assert_eq!(ranges(&map), vec![(0x4000, 0x6000)]);
    }

    #[test]
    fn test_enter_overwrite_replaces() {
        let (ctx, map) = setup();
        enter_at(&map, 0x4000, 0x3000).unwrap();
        let object = VmObject::allocate(&ctx, 0x1000).unwrap();
        map.enter(0x5000, 0x1000, 0, EnterFlags::OVERWRITE, Some(object), 0, false, EntryAttributes::default())
            .unwrap();
        assert_eq!(ranges(&map), vec![(0x4000, 0x5000), (0x5000, 0x6000), (0x6000, 0x7000)]);
    }

    #[test]
    fn test_remove_splits_and_zero_length_is_noop() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x4000).unwrap();
        let stamp = map.timestamp();
        map.remove(0x5000, 0x5000).unwrap();
        assert_eq!(map.timestamp(), stamp);
        map.remove(0x5000, 0x6000).unwrap();
        assert_eq!(ranges(&map), vec![(0x4000, 0x5000), (0x6000, 0x8000)]);
        assert_eq!(map.size(), 0x3000);
    }

    #[test]
    fn test_find_entry_reports_predecessor() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x1000).unwrap();
        match map.find_entry(0x4800) {
            EntryLookup::Found(handle) => assert_eq!(handle.start(), 0x4000),
            other => panic!("unexpected {:?}", other),
        }
        match map.find_entry(0x9000) {
            EntryLookup::Gap { prev: Some(prev) } => assert_eq!(prev.start(), 0x4000),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(map.find_entry(0x2000), EntryLookup::Gap { prev: None });
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        let handle = match map.find_entry(0x4000) {
            EntryLookup::Found(handle) => handle,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(map.with_entry(handle, |e| e.end), Some(0x6000));
        map.protect(0x5000, 0x6000, VmProt::READ, false).unwrap();
        assert_eq!(map.with_entry(handle, |e| e.end), None);
    }

    #[test]
    fn test_protect_checks_maximum_and_merges_back() {
        let (_ctx, map) = setup();
        let attrs = EntryAttributes::new(VmProt::READ, VmProt::DEFAULT, VmInherit::Copy);
        map.enter(0x4000, 0x3000, 0, EnterFlags::empty(), None, 0, false, attrs).unwrap();
        assert_eq!(
            map.protect(0x4000, 0x5000, VmProt::ALL, false),
            Err(KernError::ProtectionFailure)
        );
        map.protect(0x5000, 0x6000, VmProt::DEFAULT, false).unwrap();
        assert_eq!(map.entry_count(), 3);
        map.protect(0x5000, 0x6000, VmProt::READ, false).unwrap();
        assert_eq!(ranges(&map), vec![(0x4000, 0x7000)]);

        map.protect(0x4000, 0x7000, VmProt::READ, true).unwrap();
        assert_eq!(
            map.protect(0x4000, 0x5000, VmProt::DEFAULT, false),
            Err(KernError::ProtectionFailure)
        );
    }

    #[test]
    fn test_inherit_splits() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        map.inherit(0x5000, 0x6000, VmInherit::Share).unwrap();
        let mut inherits = Vec::new();
        map.for_each_entry(|e| inherits.push(e.inheritance));
        assert_eq!(inherits, vec![VmInherit::Copy, VmInherit::Share]);
    }

    #[test]
    fn test_lookup_allocates_and_verifies() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        let result = map.lookup(0x5010, VmProt::READ).unwrap();
        assert_eq!(result.offset, 0x1010);
        assert!(map.verify(&result.version));
        let again = map.lookup(0x4000, VmProt::READ).unwrap();
        assert!(ObjectRef::ptr_eq(&result.object, &again.object));

        assert_eq!(map.lookup(0x9000, VmProt::READ).err(), Some(KernError::InvalidAddress));
        assert_eq!(
            map.lookup(0x4000, VmProt::EXECUTE).err(),
            Some(KernError::ProtectionFailure)
        );
        map.inherit(0x4000, 0x5000, VmInherit::Share).unwrap();
        assert!(!map.verify(&result.version));
    }

    #[test]
    fn test_lookup_write_resolves_needs_copy() {
        let (ctx, map) = setup();
        let object = VmObject::allocate(&ctx, 0x1000).unwrap();
        let original = object.id();
        map.enter(0x4000, 0x1000, 0, EnterFlags::empty(), Some(object), 0, true, EntryAttributes::default())
            .unwrap();
        let read = map.lookup(0x4000, VmProt::READ).unwrap();
        assert_eq!(read.object.id(), original);
        assert!(!read.protection.contains(VmProt::WRITE));
        drop(read);

        let write = map.lookup(0x4000, VmProt::WRITE).unwrap();
        assert_ne!(write.object.id(), original);
        assert_eq!(write.object.shadow_id().map(|(id, _)| id), Some(original));
        assert!(write.protection.contains(VmProt::WRITE));
    }

    #[test]
    fn test_fork_honours_inheritance() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x1000).unwrap();
        enter_at(&map, 0x6000, 0x1000).unwrap();
        enter_at(&map, 0x8000, 0x1000).unwrap();
        map.inherit(0x6000, 0x7000, VmInherit::Share).unwrap();
        map.inherit(0x8000, 0x9000, VmInherit::None).unwrap();
        let shared = map.lookup(0x6000, VmProt::WRITE).unwrap().object;

        let child = map.fork().unwrap();
        assert_eq!(ranges(&child), vec![(0x4000, 0x5000), (0x6000, 0x7000)]);
        let child_shared = child.lookup(0x6000, VmProt::WRITE).unwrap().object;
        assert!(ObjectRef::ptr_eq(&shared, &child_shared));
        let mut flags = Vec::new();
        child.for_each_entry(|e| flags.push(e.is_shared));
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_fork_copy_marks_both_sides() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        let parent_object = map.lookup(0x4000, VmProt::WRITE).unwrap().object;
        let child = map.fork().unwrap();
        let mut needs_copy = Vec::new();
        map.for_each_entry(|e| needs_copy.push(e.needs_copy));
        child.for_each_entry(|e| needs_copy.push(e.needs_copy));
        assert_eq!(needs_copy, vec![true, true]);
        let child_read = child.lookup(0x4000, VmProt::READ).unwrap();
        assert!(ObjectRef::ptr_eq(&parent_object, &child_read.object));
    }

    #[test]
    fn test_wire_and_unwire_counts() {
        let (ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        map.wire(0x4000, 0x6000, VmProt::READ, true).unwrap();
        map.wire(0x4000, 0x5000, VmProt::READ, false).unwrap();
        let mut counts = Vec::new();
        map.for_each_entry(|e| counts.push((e.wired_count, e.user_wired_count)));
        assert_eq!(counts, vec![(2, 1), (1, 1)]);
        assert_eq!(ctx.frames().allocated(), 2);
        assert_eq!(map.resident_count(), 2);

        assert_eq!(map.unwire(0x5000, 0x6000, false), Err(KernError::InvalidArgument));
        map.pageable(0x4000, 0x5000, VmProt::NONE).unwrap();
        map.unwire(0x4000, 0x6000, true).unwrap();
        let mut counts = Vec::new();
        map.for_each_entry(|e| counts.push(e.wired_count));
        assert_eq!(counts, vec![0]);
        let object = map.lookup(0x4000, VmProt::READ).unwrap().object;
        assert!(!object.page_lookup(0).unwrap().is_wired());
    }

    #[test]
    fn test_enter_unaligned_fixed_address_covers_whole_range() {
        let (_ctx, map) = setup();
        assert_eq!(enter_at(&map, 0x1800, 0x1000), Ok(0x1000));
        assert_eq!(ranges(&map), vec![(0x1000, 0x3000)]);
        assert_eq!(enter_at(&map, 0x2800, 0x10), Err(KernError::MemoryPresent));
        assert_eq!(enter_at(&map, 0xF_F800, 0x1000), Err(KernError::NoSpace));
    }

    #[test]
    fn test_wire_rejects_holes() {
        let (_ctx, map) = setup();
        enter_at(&map, 0x4000, 0x1000).unwrap();
        assert_eq!(map.wire(0x4000, 0x6000, VmProt::READ, false), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_wiring_required_wires_new_entries() {
        let (ctx, map) = setup();
        map.set_wiring_required(true);
        enter_at(&map, 0x4000, 0x3000).unwrap();
        assert_eq!(ctx.frames().allocated(), 3);
        let mut wired = Vec::new();
        map.for_each_entry(|e| wired.push(e.wired_count));
        assert_eq!(wired, vec![1]);
    }

    #[test]
    fn test_submap_lookup_descends() {
        let (ctx, map) = setup();
        let nested = VmMap::create(&ctx, 0x1000, 0x20_000).unwrap();
        enter_at(&nested, 0x2000, 0x2000).unwrap();
        map.submap(0x10_000, 0x12_000, Arc::clone(&nested), 0x2000).unwrap();

        let result = map.lookup(0x11_000, VmProt::READ).unwrap();
        let direct = nested.lookup(0x3000, VmProt::READ).unwrap();
        assert!(ObjectRef::ptr_eq(&result.object, &direct.object));
        assert_eq!(result.offset, 0x1000);
        assert!(map.verify(&result.version));
        nested.inherit(0x2000, 0x3000, VmInherit::None).unwrap();
        assert!(!map.verify(&result.version));

        assert_eq!(
            map.submap(0x10_000, 0x11_000, Arc::clone(&nested), 0).err(),
            Some(KernError::MemoryPresent)
        );
    }

    #[test]
    fn test_drop_releases_objects() {
        let (ctx, map) = setup();
        enter_at(&map, 0x4000, 0x2000).unwrap();
        map.wire(0x4000, 0x6000, VmProt::DEFAULT, false).unwrap();
        assert_eq!(ctx.frames().allocated(), 2);
        drop(map);
        assert_eq!(ctx.frames().allocated(), 0);
        assert_eq!(ctx.objects().count(), 0);
    }
}
