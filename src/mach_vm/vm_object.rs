//! VM Object - Memory Object Abstraction
//!
//! Based on Mach4 vm/vm_object.h/c
//! VM objects represent backing store for virtual memory regions.
//! They can be backed by:
//! - Physical memory (anonymous memory)
//! - External pagers (files, devices)
//! - Shadow chains (copy-on-write)
//!
//! Reference counting is explicit: an `ObjectRef` is one counted reference
//! and the only way to hold one. Dropping the last `ObjectRef` either parks
//! a persistent object in the cache or terminates it, then releases the
//! reference it held on its shadow.
//!
//! Lock order is object before shadow. The object lock is a spin lock and
//! is never held across a pager call or a sleep.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;

use log::{debug, trace, warn};

use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::lock::{SimpleLock, SimpleLockGuard};
use crate::kern::sched_prim::{event_for, WaitEvent, WaitResult};
use crate::mach_vm::memory_object::{MemoryManager, MemoryObjectAttributes, PagerId};
use crate::mach_vm::vm_fault::vm_fault_page;
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{round_page, trunc_page, PageFlags, VmPage, PAGE_SIZE};
use crate::mach_vm::{VmContext, VmStats};

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
///
/// Slot index plus generation, so a stale id never resolves to a
/// different object that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId {
    index: u32,
    generation: u32,
}

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Object copy strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Symmetric copy (both share until modified)
    Symmetric,
    /// Asymmetric copy (delay source copy)
    Delay,
    /// No copy
    None,
}

// ============================================================================
// Object State
// ============================================================================

/// Fields protected by the object lock
pub(crate) struct ObjectState {
    pub(crate) size: u64,
    pub(crate) ref_count: u32,
    /// Resident pages (including absent placeholders) by offset
    pub(crate) pages: BTreeMap<u64, VmPage>,
    pub(crate) absent_count: u32,
    pub(crate) copy_strategy: CopyStrategy,

    pub(crate) pager: Option<Arc<dyn MemoryManager>>,
    pub(crate) pager_created: bool,
    pub(crate) pager_initialized: bool,
    pub(crate) pager_ready: bool,

    pub(crate) can_persist: bool,
    pub(crate) internal: bool,
    pub(crate) temporary: bool,
    pub(crate) paging_in_progress: u32,
    pub(crate) last_alloc: u64,

    pub(crate) shadow: Option<ObjectRef>,
    pub(crate) shadow_offset: u64,
    /// Object receiving original page contents before they change here
    pub(crate) copy: Option<VmObjectId>,
    /// Offsets the pager declared it has no data for
    pub(crate) existence: BTreeSet<u64>,

    pub(crate) alive: bool,
    pub(crate) cached: bool,
}

impl ObjectState {
    fn new(size: u64) -> Self {
        Self {
            size,
            ref_count: 1,
            pages: BTreeMap::new(),
            absent_count: 0,
            copy_strategy: CopyStrategy::Symmetric,
            pager: None,
            pager_created: false,
            pager_initialized: false,
            pager_ready: false,
            can_persist: false,
            internal: true,
            temporary: true,
            paging_in_progress: 0,
            last_alloc: 0,
            shadow: None,
            shadow_offset: 0,
            copy: None,
            existence: BTreeSet::new(),
            alive: true,
            cached: false,
        }
    }

    pub(crate) fn insert_page(&mut self, page: VmPage) {
        if page.is_absent() {
            self.absent_count += 1;
        }
        let offset = page.offset;
        if self.pages.insert(offset, page).is_some() {
            panic!("vm_object: page already present at offset {:#x}", offset);
        }
        self.last_alloc = offset;
    }

    pub(crate) fn remove_page(&mut self, offset: u64) -> Option<VmPage> {
        let page = self.pages.remove(&offset)?;
        if page.is_absent() {
            self.absent_count -= 1;
        }
        Some(page)
    }

    /// Clear the busy bit; returns whether a sleeper must be woken
    pub(crate) fn unbusy(&mut self, offset: u64) -> bool {
        match self.pages.get_mut(&offset) {
            Some(page) => {
                let wanted = page.flags.contains(PageFlags::WANTED);
                page.flags.remove(PageFlags::BUSY | PageFlags::WANTED);
                wanted
            }
            None => false,
        }
    }
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// Virtual Memory Object
pub struct VmObject {
    id: VmObjectId,
    ctx: Weak<VmContext>,
    state: SimpleLock<ObjectState>,
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject").field("id", &self.id).finish()
    }
}

const EVENT_PAGING: u64 = 2;
const EVENT_READY: u64 = 4;

impl VmObject {
    /// Allocate an anonymous object
    pub fn allocate(ctx: &Arc<VmContext>, size: u64) -> KernResult<ObjectRef> {
        let object = ctx
            .objects()
            .create(ctx, ObjectState::new(round_page(size)))?;
        trace!("vm_object {:?}: allocated, size {:#x}", object.id, size);
        Ok(ObjectRef::adopt(object))
    }

    /// Object backed by `pager`. The same pager always yields the same
    /// object; a cached one is reactivated.
    pub fn enter_pager(
        ctx: &Arc<VmContext>,
        pager: Arc<dyn MemoryManager>,
        size: u64,
    ) -> KernResult<ObjectRef> {
        if let Some(object) = ctx.objects().reactivate(pager.id(), round_page(size)) {
            return Ok(object);
        }
        let mut state = ObjectState::new(round_page(size));
        state.internal = false;
        state.temporary = false;
        state.copy_strategy = CopyStrategy::Delay;
        state.pager = Some(Arc::clone(&pager));
        state.pager_created = true;
        state.pager_initialized = true;
        let object = ctx.objects().create_for_pager(ctx, state, pager.id())?;
        debug!("vm_object {:?}: created for pager {:?}", object.id, pager.id());
        let object = ObjectRef::adopt(object);
        pager.init(object.id, PAGE_SIZE);
        Ok(object)
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub(crate) fn ctx(&self) -> KernResult<Arc<VmContext>> {
        self.ctx.upgrade().ok_or(KernError::MemoryFailure)
    }

    pub(crate) fn lock(&self) -> SimpleLockGuard<'_, ObjectState> {
        self.state.lock()
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    pub fn resident_page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn absent_count(&self) -> u32 {
        self.state.lock().absent_count
    }

    pub fn copy_strategy(&self) -> CopyStrategy {
        self.state.lock().copy_strategy
    }

    pub fn set_copy_strategy(&self, strategy: CopyStrategy) {
        self.state.lock().copy_strategy = strategy;
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn is_internal(&self) -> bool {
        self.state.lock().internal
    }

    pub fn is_temporary(&self) -> bool {
        self.state.lock().temporary
    }

    pub fn set_temporary(&self, temporary: bool) {
        self.state.lock().temporary = temporary;
    }

    pub fn can_persist(&self) -> bool {
        self.state.lock().can_persist
    }

    pub fn set_can_persist(&self, can_persist: bool) {
        self.state.lock().can_persist = can_persist;
    }

    pub fn paging_in_progress(&self) -> u32 {
        self.state.lock().paging_in_progress
    }

    /// Shadow object id and the offset into it
    pub fn shadow_id(&self) -> Option<(VmObjectId, u64)> {
        let st = self.state.lock();
        st.shadow.as_ref().map(|s| (s.id, st.shadow_offset))
    }

    /// The shadow object itself (no reference taken)
    pub fn shadow_object(&self) -> Option<Arc<VmObject>> {
        self.state.lock().shadow.as_ref().map(|s| Arc::clone(s.arc()))
    }

    pub fn copy_id(&self) -> Option<VmObjectId> {
        self.state.lock().copy
    }

    /// Number of objects below this one
    pub fn shadow_depth(&self) -> usize {
        let mut depth = 0;
        let mut next = self.shadow_object();
        while let Some(object) = next {
            depth += 1;
            next = object.shadow_object();
        }
        depth
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub(crate) fn page_event(&self, offset: u64) -> WaitEvent {
        event_for(self, trunc_page(offset) | 1)
    }

    pub(crate) fn paging_event(&self) -> WaitEvent {
        event_for(self, EVENT_PAGING)
    }

    pub(crate) fn ready_event(&self) -> WaitEvent {
        event_for(self, EVENT_READY)
    }

    /// Sleep on `event`, dropping the object lock meanwhile
    pub(crate) fn sleep<'a>(
        &'a self,
        st: SimpleLockGuard<'a, ObjectState>,
        event: WaitEvent,
        interruptible: bool,
    ) -> KernResult<SimpleLockGuard<'a, ObjectState>> {
        let ctx = self.ctx()?;
        let token = ctx.scheduler().assert_wait(event, interruptible);
        drop(st);
        match ctx.scheduler().thread_block(token) {
            WaitResult::Normal => Ok(self.state.lock()),
            WaitResult::Interrupted => Err(KernError::Aborted),
        }
    }

    pub(crate) fn wakeup(&self, event: WaitEvent) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.scheduler().wakeup(event);
        }
    }

    /// Finish one paging operation
    pub(crate) fn paging_end(&self) {
        let mut st = self.state.lock();
        if st.paging_in_progress == 0 {
            panic!("vm_object {:?}: paging_in_progress underflow", self.id);
        }
        st.paging_in_progress -= 1;
        if st.paging_in_progress == 0 {
            drop(st);
            self.wakeup(self.paging_event());
        }
    }

    // ========================================================================
    // Reference release and termination
    // ========================================================================

    fn release_reference(&self) -> Release {
        let mut st = self.state.lock();
        loop {
            if st.ref_count == 0 {
                panic!("vm_object {:?}: reference count underflow", self.id);
            }
            if st.ref_count > 1 {
                st.ref_count -= 1;
                return Release::Kept;
            }
            if st.can_persist && st.pager_ready && self.ctx.strong_count() > 0 {
                st.ref_count = 0;
                st.cached = true;
                return Release::Cached;
            }
            if st.paging_in_progress > 0 {
                let event = self.paging_event();
                st = match self.sleep(st, event, false) {
                    Ok(st) => st,
                    // Context gone: nobody can be paging any more
                    Err(_) => self.state.lock(),
                };
                continue;
            }
            st.ref_count = 0;
            st.alive = false;
            let shadow = st.shadow.take();
            if let Some(shadow) = &shadow {
                let mut sst = shadow.state.lock();
                if sst.copy == Some(self.id) {
                    sst.copy = None;
                }
            }
            return Release::Terminate(shadow.map(ObjectRef::into_arc));
        }
    }

    /// Free everything the object owns; the caller already marked it dead
    fn terminate(&self) {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        let (pages, pager, write_back) = {
            let mut st = self.state.lock();
            st.absent_count = 0;
            st.existence.clear();
            st.copy = None;
            (core::mem::take(&mut st.pages), st.pager.take(), !st.temporary)
        };

        let mut buf = vec![0u8; PAGE_SIZE];
        for page in pages.values() {
            let pa = match page.phys_addr {
                Some(pa) => pa,
                None => continue,
            };
            if let Some(pager) = &pager {
                let modified = page.is_dirty()
                    || page.flags.contains(PageFlags::PRECIOUS)
                    || ctx.pmaps().is_modified(pa);
                if write_back && modified && page.is_valid() {
                    ctx.frames().read(pa, 0, &mut buf);
                    pager.data_write(self.id, page.offset, &buf);
                }
            }
            ctx.pmaps().page_protect(pa, VmProt::NONE);
            ctx.pmaps().clear_modify(pa);
            ctx.frames().free(pa);
        }
        if let Some(pager) = pager {
            pager.terminate(self.id);
        }
        ctx.objects().release(self.id);
        debug!("vm_object {:?}: terminated, {} pages freed", self.id, pages.len());
    }

    // ========================================================================
    // Page operations
    // ========================================================================

    /// Snapshot of the page at `offset`
    pub fn page_lookup(&self, offset: u64) -> Option<VmPage> {
        self.state.lock().pages.get(&trunc_page(offset)).cloned()
    }

    /// Insert a resident page holding `frame`
    pub fn page_insert(&self, offset: u64, frame: u64) {
        let mut page = VmPage::new(trunc_page(offset), frame);
        page.set_dirty();
        self.state.lock().insert_page(page);
    }

    /// Remove (and free) the idle pages in `[start, end)`
    pub fn page_remove_range(&self, start: u64, end: u64) -> usize {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return 0,
        };
        let mut st = self.state.lock();
        let doomed: Vec<u64> = st
            .pages
            .range(start..end)
            .filter(|(_, p)| !p.is_busy())
            .map(|(&off, _)| off)
            .collect();
        for &offset in &doomed {
            if let Some(pa) = st.remove_page(offset).and_then(|p| p.phys_addr) {
                ctx.pmaps().page_protect(pa, VmProt::NONE);
                ctx.frames().free(pa);
            }
        }
        doomed.len()
    }

    /// Lower hardware access to pages in `[start, end)`, keeping them resident
    pub fn pmap_protect_range(&self, start: u64, end: u64, prot: VmProt) {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        let st = self.state.lock();
        for page in st.pages.range(start..end).map(|(_, p)| p) {
            if let Some(pa) = page.phys_addr {
                ctx.pmaps().page_protect(pa, prot);
            }
        }
    }

    /// Remove every hardware translation of pages in `[start, end)`
    pub fn pmap_remove_range(&self, start: u64, end: u64) {
        self.pmap_protect_range(start, end, VmProt::NONE);
    }

    /// Try to extend this object to also back `next_size` bytes after
    /// `[prev_offset, prev_offset + prev_size)`.
    pub fn coalesce(&self, prev_offset: u64, prev_size: u64, next_size: u64) -> bool {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut st = self.state.lock();
        if st.ref_count > 1
            || st.pager_created
            || st.shadow.is_some()
            || st.copy.is_some()
            || !st.internal
        {
            return false;
        }
        let start = prev_offset + prev_size;
        let end = start + next_size;
        let stale: Vec<u64> = st.pages.range(start..end).map(|(&o, _)| o).collect();
        for offset in stale {
            if let Some(pa) = st.remove_page(offset).and_then(|p| p.phys_addr) {
                ctx.pmaps().page_protect(pa, VmProt::NONE);
                ctx.frames().free(pa);
            }
        }
        if end > st.size {
            st.size = end;
        }
        true
    }

    // ========================================================================
    // Collapse
    // ========================================================================

    /// Compact the shadow chain below this object.
    ///
    /// A backing object referenced only by this object is merged into it
    /// (collapse); a backing object whose every page in our window is
    /// already covered here is skipped (bypass). Repeats until neither
    /// applies, so calling it again on a converged chain changes nothing.
    pub fn collapse(&self) {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        let (collapse_allowed, bypass_allowed) = {
            let config = ctx.config();
            (config.collapse_allowed, config.bypass_allowed)
        };
        loop {
            let mut graveyard: Vec<ObjectRef> = Vec::new();
            let progressed = self.collapse_step(&ctx, collapse_allowed, bypass_allowed, &mut graveyard);
            // References are released with no object lock held
            drop(graveyard);
            if !progressed {
                return;
            }
        }
    }

    fn collapse_step(
        &self,
        ctx: &Arc<VmContext>,
        collapse_allowed: bool,
        bypass_allowed: bool,
        graveyard: &mut Vec<ObjectRef>,
    ) -> bool {
        let mut st = self.state.lock();
        if !st.alive || st.paging_in_progress > 0 {
            return false;
        }
        let backing = match &st.shadow {
            Some(shadow) => Arc::clone(shadow.arc()),
            None => return false,
        };
        let mut bst = backing.state.lock();
        if !bst.internal
            || bst.pager_created
            || bst.paging_in_progress > 0
            || bst.copy.is_some()
            || bst.pages.values().any(|p| p.is_busy())
        {
            return false;
        }
        // A shadow below the backing object that still pushes into a copy
        // would lose track of it
        if let Some(grand) = &bst.shadow {
            if grand.state.lock().copy.is_some() {
                return false;
            }
        }

        let window_start = st.shadow_offset;
        let window_end = window_start + st.size;

        if bst.ref_count == 1 && collapse_allowed {
            let backing_pages = core::mem::take(&mut bst.pages);
            bst.absent_count = 0;
            let mut moved = 0usize;
            for (offset, mut page) in backing_pages {
                let inside = offset >= window_start && offset < window_end;
                let new_offset = offset.wrapping_sub(window_start);
                if inside && !st.pages.contains_key(&new_offset) {
                    page.offset = new_offset;
                    st.insert_page(page);
                    moved += 1;
                } else if let Some(pa) = page.phys_addr {
                    ctx.pmaps().page_protect(pa, VmProt::NONE);
                    ctx.frames().free(pa);
                }
            }
            let grand = bst.shadow.take();
            let grand_offset = bst.shadow_offset;
            bst.ref_count = 0;
            bst.alive = false;
            drop(bst);

            st.shadow_offset += grand_offset;
            let old = core::mem::replace(&mut st.shadow, grand);
            drop(st);
            // The reference on the backing object dies with it
            if let Some(old) = old {
                drop(old.into_arc());
            }
            ctx.objects().release(backing.id);
            VmStats::incr(&ctx.stats().collapses);
            debug!(
                "vm_object {:?}: collapsed {:?}, {} pages moved up",
                self.id, backing.id, moved
            );
            return true;
        }

        if !bypass_allowed {
            return false;
        }
        let covered = bst
            .pages
            .range(window_start..window_end)
            .all(|(&offset, _)| {
                st.pages
                    .get(&(offset - window_start))
                    .is_some_and(|p| p.is_valid())
            });
        if !covered {
            return false;
        }
        let grand = bst.shadow.clone();
        let grand_offset = bst.shadow_offset;
        drop(bst);
        st.shadow_offset += grand_offset;
        if let Some(old) = core::mem::replace(&mut st.shadow, grand) {
            graveyard.push(old);
        }
        drop(st);
        VmStats::incr(&ctx.stats().bypasses);
        debug!("vm_object {:?}: bypassed {:?}", self.id, backing.id);
        true
    }

    // ========================================================================
    // Pager replies
    // ========================================================================

    /// Pager is ready (memory_object_set_attributes)
    pub fn set_ready(&self, attributes: MemoryObjectAttributes) {
        {
            let mut st = self.state.lock();
            st.pager_ready = true;
            st.copy_strategy = attributes.copy_strategy;
            st.can_persist = attributes.may_cache;
        }
        self.wakeup(self.ready_event());
    }

    /// Pager supplies one page of data
    pub fn data_supply(&self, offset: u64, data: &[u8], precious: bool) -> KernResult<()> {
        let ctx = self.ctx()?;
        let offset = trunc_page(offset);
        let len = data.len().min(PAGE_SIZE);
        let mut st = self.state.lock();
        if !st.alive || offset >= st.size {
            return Ok(());
        }
        match st.pages.get(&offset) {
            Some(page) if !page.is_absent() => return Ok(()),
            _ => {}
        }
        let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
        ctx.frames().write(frame, 0, &data[..len]);
        if len < PAGE_SIZE {
            ctx.frames().write(frame, len, &vec![0u8; PAGE_SIZE - len]);
        }
        let mut page = VmPage::new(offset, frame);
        if precious {
            page.flags.insert(PageFlags::PRECIOUS);
        }
        let wanted = match st.remove_page(offset) {
            Some(placeholder) => placeholder.flags.contains(PageFlags::WANTED),
            None => false,
        };
        st.insert_page(page);
        st.existence.remove(&offset);
        drop(st);
        trace!("vm_object {:?}: data supplied at {:#x}", self.id, offset);
        if wanted {
            self.wakeup(self.page_event(offset));
        }
        Ok(())
    }

    /// Pager has no data for `[offset, offset + length)`
    pub fn data_unavailable(&self, offset: u64, length: u64) {
        let start = trunc_page(offset);
        let end = round_page(offset + length);
        let mut woken = Vec::new();
        {
            let mut st = self.state.lock();
            let mut cur = start;
            while cur < end {
                if st.pages.get(&cur).is_some_and(|p| p.is_absent()) {
                    st.remove_page(cur);
                    woken.push(cur);
                }
                st.existence.insert(cur);
                cur += PAGE;
            }
        }
        for offset in woken {
            self.wakeup(self.page_event(offset));
        }
    }

    /// Pager failed to provide `[offset, offset + length)`
    pub fn data_error(&self, offset: u64, length: u64) {
        let start = trunc_page(offset);
        let end = round_page(offset + length);
        let mut woken = Vec::new();
        {
            let mut st = self.state.lock();
            for page in st.pages.range_mut(start..end).map(|(_, p)| p) {
                if page.is_absent() {
                    page.flags.insert(PageFlags::ERROR);
                    page.flags.remove(PageFlags::BUSY | PageFlags::WANTED);
                    woken.push(page.offset);
                }
            }
        }
        if !woken.is_empty() {
            warn!("vm_object {:?}: pager error on {} pages", self.id, woken.len());
        }
        for offset in woken {
            self.wakeup(self.page_event(offset));
        }
    }

    /// Write dirty pages in `[offset, offset + length)` back to the pager.
    /// Returns the number of pages written.
    pub fn clean(&self, offset: u64, length: u64) -> KernResult<usize> {
        let ctx = self.ctx()?;
        let start = trunc_page(offset);
        let end = round_page(offset.saturating_add(length));
        let (pager, dirty) = {
            let mut st = self.state.lock();
            let pager = match &st.pager {
                Some(pager) => Arc::clone(pager),
                None => return Ok(0),
            };
            let mut dirty = Vec::new();
            for page in st.pages.range_mut(start..end).map(|(_, p)| p) {
                let pa = match page.phys_addr {
                    Some(pa) if page.is_valid() && !page.is_busy() => pa,
                    _ => continue,
                };
                if page.is_dirty() || ctx.pmaps().is_modified(pa) {
                    page.flags.insert(PageFlags::BUSY);
                    page.flags.remove(PageFlags::DIRTY);
                    ctx.pmaps().clear_modify(pa);
                    ctx.pmaps().page_protect(pa, VmProt::READ | VmProt::EXECUTE);
                    dirty.push((page.offset, pa));
                }
            }
            st.paging_in_progress += dirty.len() as u32;
            (pager, dirty)
        };

        let mut buf = vec![0u8; PAGE_SIZE];
        for &(offset, pa) in &dirty {
            ctx.frames().read(pa, 0, &mut buf);
            pager.data_write(self.id, offset, &buf);
        }

        for &(offset, _) in &dirty {
            let wanted = self.state.lock().unbusy(offset);
            if wanted {
                self.wakeup(self.page_event(offset));
            }
            self.paging_end();
        }
        Ok(dirty.len())
    }
}

enum Release {
    Kept,
    Cached,
    Terminate(Option<Arc<VmObject>>),
}

/// Drop one reference, terminating objects (and walking down the shadow
/// chain) iteratively rather than recursively.
fn vm_object_deallocate(object: Arc<VmObject>) {
    let mut object = object;
    loop {
        match object.release_reference() {
            Release::Kept => return,
            Release::Cached => {
                if let Some(ctx) = object.ctx.upgrade() {
                    let evicted = ctx.objects().cache_insert(object);
                    for victim in evicted {
                        VmStats::incr(&ctx.stats().cache_evictions);
                        warn!("vm_object {:?}: evicted from cache", victim.id);
                        vm_object_reap(victim);
                    }
                }
                return;
            }
            Release::Terminate(shadow) => {
                object.terminate();
                match shadow {
                    Some(shadow) => object = shadow,
                    None => return,
                }
            }
        }
    }
}

/// Terminate an object evicted from the cache
fn vm_object_reap(object: Arc<VmObject>) {
    let shadow = {
        let mut st = object.state.lock();
        st.alive = false;
        st.cached = false;
        st.shadow.take()
    };
    object.terminate();
    drop(shadow);
}

// ============================================================================
// Object references
// ============================================================================

/// One counted reference to a VM object
pub struct ObjectRef {
    object: ManuallyDrop<Arc<VmObject>>,
}

impl ObjectRef {
    /// Wrap a reference the caller already counted
    fn adopt(object: Arc<VmObject>) -> Self {
        Self {
            object: ManuallyDrop::new(object),
        }
    }

    /// Give up the counted reference without releasing it
    pub(crate) fn into_arc(self) -> Arc<VmObject> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the Arc is moved out exactly once
        unsafe { ManuallyDrop::take(&mut this.object) }
    }

    pub fn arc(&self) -> &Arc<VmObject> {
        &self.object
    }

    pub fn ptr_eq(a: &ObjectRef, b: &ObjectRef) -> bool {
        Arc::ptr_eq(&a.object, &b.object)
    }

    // ========================================================================
    // Shadowing and copying
    // ========================================================================

    /// Interpose a fresh object in front of this one for copy-on-write.
    ///
    /// The new object takes its own reference on this one; the caller
    /// normally drops its reference afterwards. Returns the new object with
    /// its offset, which is always zero.
    pub fn shadow(&self, offset: u64, length: u64) -> KernResult<(ObjectRef, u64)> {
        let ctx = self.ctx()?;
        let mut state = ObjectState::new(round_page(length));
        let source_id = self.id;
        state.shadow = Some(self.clone());
        state.shadow_offset = offset;
        let object = ctx.objects().create(&ctx, state)?;
        VmStats::incr(&ctx.stats().shadows);
        debug!(
            "vm_object {:?}: shadows {:?} at {:#x}",
            object.id, source_id, offset
        );
        Ok((ObjectRef::adopt(object), 0))
    }

    /// Make a copy of `[offset, offset + size)` the cheapest safe way.
    ///
    /// Returns the copy, its offset, and whether the caller must still
    /// arrange copy-on-write (symmetric strategy: the "copy" is this same
    /// object and both sides must be marked needs-copy).
    pub fn copy_strategically(&self, offset: u64, size: u64) -> KernResult<(ObjectRef, u64, bool)> {
        let (strategy, temporary, has_copy) = {
            let st = self.lock();
            (st.copy_strategy, st.temporary, st.copy.is_some())
        };
        match strategy {
            CopyStrategy::Symmetric if temporary && !has_copy => {
                // Both sides now read the same pages until one of them writes
                let end = round_page(offset.saturating_add(size));
                self.pmap_protect_range(trunc_page(offset), end, VmProt::READ | VmProt::EXECUTE);
                Ok((self.clone(), offset, true))
            }
            CopyStrategy::Delay => self.copy_delayed(offset, size),
            _ => {
                let copy = self.copy_slowly(offset, size, false)?;
                Ok((copy, 0, false))
            }
        }
    }

    /// Delayed copy: the copy shadows this object and receives original
    /// page contents before they are modified here.
    pub fn copy_delayed(&self, offset: u64, size: u64) -> KernResult<(ObjectRef, u64, bool)> {
        let ctx = self.ctx()?;
        let src_size = self.size().max(round_page(offset + size));
        let mut state = ObjectState::new(src_size);
        state.shadow = Some(self.clone());
        let new_copy = ObjectRef::adopt(ctx.objects().create(&ctx, state)?);

        let old_copy = self.copy_id().and_then(|id| ctx.objects().get(id));
        let mut released = None;
        if let Some(old) = old_copy {
            if chain_contains(new_copy.arc(), old.id) {
                panic!("vm_object {:?}: re-chaining copy would create a cycle", old.id);
            }
            let mut ost = old.lock();
            let behind_us = ost
                .shadow
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s.arc(), self.arc()));
            if ost.alive && behind_us {
                ost.shadow_offset = 0;
                released = core::mem::replace(&mut ost.shadow, Some(new_copy.clone()));
            }
        }
        drop(released);

        let frames: Vec<u64> = {
            let mut st = self.lock();
            st.copy = Some(new_copy.id);
            st.pages.values().filter_map(|p| p.phys_addr).collect()
        };
        for pa in frames {
            ctx.pmaps().page_protect(pa, VmProt::READ | VmProt::EXECUTE);
        }
        debug!("vm_object {:?}: delayed copy {:?}", self.id, new_copy.id);
        Ok((new_copy, offset, false))
    }

    /// Copy `[offset, offset + size)` page by page into a new object
    pub fn copy_slowly(&self, offset: u64, size: u64, interruptible: bool) -> KernResult<ObjectRef> {
        let ctx = self.ctx()?;
        let size = round_page(size);
        let copy = VmObject::allocate(&ctx, size)?;
        let mut cur = 0;
        while cur < size {
            let held = vm_fault_page(self.arc(), offset + cur, VmProt::READ, interruptible)?;
            let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
            ctx.frames().copy(held.phys_addr(), frame);
            drop(held);
            copy.page_insert(cur, frame);
            cur += PAGE;
        }
        debug!(
            "vm_object {:?}: copied slowly into {:?} ({:#x} bytes)",
            self.id, copy.id, size
        );
        Ok(copy)
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        let mut st = self.object.state.lock();
        if !st.alive || st.ref_count == 0 {
            panic!("vm_object {:?}: reference taken on a dead object", self.object.id);
        }
        st.ref_count += 1;
        drop(st);
        Self::adopt(Arc::clone(&self.object))
    }
}

impl Deref for ObjectRef {
    type Target = VmObject;

    fn deref(&self) -> &VmObject {
        &self.object
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        // SAFETY: the field is not touched again after drop
        let object = unsafe { ManuallyDrop::take(&mut self.object) };
        vm_object_deallocate(object);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.object.id).finish()
    }
}

/// Whether `id` appears in the shadow chain starting at `start`
fn chain_contains(start: &Arc<VmObject>, id: VmObjectId) -> bool {
    let mut next = Some(Arc::clone(start));
    while let Some(object) = next {
        if object.id == id {
            return true;
        }
        next = object.shadow_object();
    }
    false
}

// ============================================================================
// Object Manager
// ============================================================================

struct Slot {
    generation: u32,
    object: Option<Weak<VmObject>>,
}

struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pagers: BTreeMap<PagerId, VmObjectId>,
    /// Persistent objects with no references, oldest first
    cache: VecDeque<Arc<VmObject>>,
    live: usize,
}

impl ObjectTable {
    fn get(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_ref()?.upgrade()
    }
}

/// Table of all objects, by generation-checked id
pub struct ObjectManager {
    table: SimpleLock<ObjectTable>,
    cache_limit: usize,
}

impl ObjectManager {
    pub fn new(cache_limit: usize) -> Self {
        Self {
            table: SimpleLock::new(ObjectTable {
                slots: Vec::new(),
                free: Vec::new(),
                pagers: BTreeMap::new(),
                cache: VecDeque::new(),
                live: 0,
            }),
            cache_limit,
        }
    }

    fn insert(
        table: &mut ObjectTable,
        ctx: &Arc<VmContext>,
        state: ObjectState,
    ) -> KernResult<Arc<VmObject>> {
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(table.slots.len()).map_err(|_| KernError::ResourceShortage)?;
                if index == u32::MAX {
                    return Err(KernError::ResourceShortage);
                }
                table.slots.push(Slot {
                    generation: 0,
                    object: None,
                });
                index
            }
        };
        let slot = &mut table.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let id = VmObjectId {
            index,
            generation: slot.generation,
        };
        let object = Arc::new(VmObject {
            id,
            ctx: Arc::downgrade(ctx),
            state: SimpleLock::new(state),
        });
        slot.object = Some(Arc::downgrade(&object));
        table.live += 1;
        Ok(object)
    }

    fn create(&self, ctx: &Arc<VmContext>, state: ObjectState) -> KernResult<Arc<VmObject>> {
        let mut table = self.table.lock();
        Self::insert(&mut table, ctx, state)
    }

    fn create_for_pager(
        &self,
        ctx: &Arc<VmContext>,
        state: ObjectState,
        pager: PagerId,
    ) -> KernResult<Arc<VmObject>> {
        let mut table = self.table.lock();
        let object = Self::insert(&mut table, ctx, state)?;
        table.pagers.insert(pager, object.id);
        Ok(object)
    }

    /// Take a reference on the live or cached object of `pager`
    fn reactivate(&self, pager: PagerId, size: u64) -> Option<ObjectRef> {
        let mut table = self.table.lock();
        let id = *table.pagers.get(&pager)?;
        let object = table.get(id)?;
        let mut st = object.state.lock();
        if !st.alive {
            return None;
        }
        if st.cached {
            st.cached = false;
            st.ref_count = 1;
            drop(st);
            table.cache.retain(|o| o.id != id);
            if let Some(ctx) = object.ctx.upgrade() {
                VmStats::incr(&ctx.stats().cache_hits);
            }
            debug!("vm_object {:?}: reactivated from cache", id);
        } else {
            st.ref_count += 1;
            if size > st.size {
                st.size = size;
            }
            drop(st);
        }
        Some(ObjectRef::adopt(object))
    }

    /// Park a persistent object; returns objects pushed out of the cache
    fn cache_insert(&self, object: Arc<VmObject>) -> Vec<Arc<VmObject>> {
        let mut table = self.table.lock();
        let still_cached = {
            let st = object.state.lock();
            st.cached && st.ref_count == 0
        };
        if still_cached {
            trace!("vm_object {:?}: cached", object.id);
            table.cache.push_back(object);
        }
        let mut evicted = Vec::new();
        while table.cache.len() > self.cache_limit {
            if let Some(victim) = table.cache.pop_front() {
                let mut st = victim.state.lock();
                if st.cached && st.ref_count == 0 {
                    st.cached = false;
                    drop(st);
                    evicted.push(victim);
                }
            }
        }
        evicted
    }

    /// Forget a dead object
    fn release(&self, id: VmObjectId) {
        let mut table = self.table.lock();
        let slot = match table.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.object.is_some() => slot,
            _ => return,
        };
        slot.object = None;
        table.free.push(id.index);
        table.live -= 1;
        table.pagers.retain(|_, v| *v != id);
    }

    /// The object with `id`, without taking a reference
    pub fn get(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        let object = self.table.lock().get(id)?;
        object.is_alive().then_some(object)
    }

    /// Take a reference on a referenced, live object
    pub fn lookup(&self, id: VmObjectId) -> Option<ObjectRef> {
        let table = self.table.lock();
        let object = table.get(id)?;
        let mut st = object.state.lock();
        if !st.alive || st.ref_count == 0 {
            return None;
        }
        st.ref_count += 1;
        drop(st);
        Some(ObjectRef::adopt(object))
    }

    /// Objects not yet terminated (including cached ones)
    pub fn count(&self) -> usize {
        self.table.lock().live
    }

    pub fn cached_count(&self) -> usize {
        self.table.lock().cache.len()
    }

    pub fn ids(&self) -> Vec<VmObjectId> {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.object.is_some())
            .map(|(i, s)| VmObjectId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::memory_object::{InMemoryPager, ReplyMode};
    use crate::mach_vm::vm_page::PageFrameAllocator;
    use crate::mach_vm::VmConfig;

    fn ctx() -> Arc<VmContext> {
        VmContext::host(VmConfig::default(), 64)
    }

    fn fill(ctx: &Arc<VmContext>, object: &VmObject, offset: u64, byte: u8) {
        let frame = ctx.frames().alloc().unwrap();
        ctx.frames().write(frame, 0, &[byte; PAGE_SIZE]);
        object.page_insert(offset, frame);
    }

    fn byte_at(ctx: &Arc<VmContext>, object: &ObjectRef, offset: u64) -> u8 {
        let held = vm_fault_page(object.arc(), offset, VmProt::READ, false).unwrap();
        let mut b = [0u8; 1];
        ctx.frames().read(held.phys_addr(), 0, &mut b);
        b[0]
    }

    #[test]
    fn test_allocate_and_release() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, 3 * PAGE + 1).unwrap();
        assert_eq!(object.size(), 4 * PAGE);
        assert_eq!(object.ref_count(), 1);
        fill(&ctx, &object, 0, 1);
        assert_eq!(ctx.frames().allocated(), 1);

        let second = object.clone();
        assert_eq!(object.ref_count(), 2);
        drop(second);
        assert_eq!(object.ref_count(), 1);

        let id = object.id();
        drop(object);
        assert_eq!(ctx.frames().allocated(), 0);
        assert!(ctx.objects().get(id).is_none());
        assert_eq!(ctx.objects().count(), 0);
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let ctx = ctx();
        let first = VmObject::allocate(&ctx, PAGE).unwrap();
        let stale = first.id();
        drop(first);
        let second = VmObject::allocate(&ctx, PAGE).unwrap();
        assert_eq!(second.id().index(), stale.index());
        assert!(ctx.objects().get(stale).is_none());
        assert!(ctx.objects().lookup(second.id()).is_some());
    }

    #[test]
    fn test_resident_count_tracks_pages() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, 8 * PAGE).unwrap();
        for i in 0..5 {
            fill(&ctx, &object, i * PAGE, i as u8);
        }
        assert_eq!(object.resident_page_count(), 5);
        assert_eq!(object.page_remove_range(PAGE, 3 * PAGE), 2);
        assert_eq!(object.resident_page_count(), 3);
        assert!(object.page_lookup(PAGE).is_none());
        assert!(object.page_lookup(3 * PAGE).is_some());
        assert_eq!(ctx.frames().allocated(), 3);
    }

    #[test]
    #[should_panic(expected = "already present")]
    fn test_double_insert_panics() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, PAGE).unwrap();
        fill(&ctx, &object, 0, 1);
        fill(&ctx, &object, 0, 2);
    }

    #[test]
    fn test_shadow_reads_through() {
        let ctx = ctx();
        let base = VmObject::allocate(&ctx, 4 * PAGE).unwrap();
        fill(&ctx, &base, 2 * PAGE, 0x42);
        let base_id = base.id();
        let (top, offset) = base.shadow(PAGE, 2 * PAGE).unwrap();
        drop(base);
        assert_eq!(offset, 0);
        assert_eq!(top.shadow_id(), Some((base_id, PAGE)));
        assert_eq!(top.resident_page_count(), 0);
        assert_eq!(byte_at(&ctx, &top, PAGE), 0x42);
        assert_eq!(ctx.stats().snapshot().shadows, 1);

        drop(top);
        assert_eq!(ctx.objects().count(), 0);
        assert_eq!(ctx.frames().allocated(), 0);
    }

    #[test]
    fn test_collapse_moves_pages_and_is_idempotent() {
        let ctx = ctx();
        let base = VmObject::allocate(&ctx, 4 * PAGE).unwrap();
        fill(&ctx, &base, 0, 1);
        fill(&ctx, &base, PAGE, 2);
        let (top, _) = base.shadow(0, 4 * PAGE).unwrap();
        drop(base);
        fill(&ctx, &top, PAGE, 9);

        top.collapse();
        assert!(top.shadow_id().is_none());
        assert_eq!(top.resident_page_count(), 2);
        assert_eq!(byte_at(&ctx, &top, 0), 1);
        assert_eq!(byte_at(&ctx, &top, PAGE), 9);
        assert_eq!(ctx.frames().allocated(), 2);
        assert_eq!(ctx.stats().snapshot().collapses, 1);

        top.collapse();
        assert_eq!(ctx.stats().snapshot().collapses, 1);
        assert_eq!(ctx.objects().count(), 1);
    }

    #[test]
    fn test_bypass_skips_covered_shadow() {
        let ctx = ctx();
        let root = VmObject::allocate(&ctx, 2 * PAGE).unwrap();
        fill(&ctx, &root, 0, 7);
        fill(&ctx, &root, PAGE, 6);
        let root_id = root.id();
        let (middle, _) = root.shadow(0, 2 * PAGE).unwrap();
        drop(root);
        fill(&ctx, &middle, 0, 8);
        let (top, _) = middle.shadow(0, 2 * PAGE).unwrap();
        fill(&ctx, &top, 0, 9);

        top.collapse();
        assert_eq!(top.shadow_id().map(|(id, _)| id), Some(root_id));
        assert_eq!(ctx.stats().snapshot().bypasses, 1);
        assert_eq!(middle.ref_count(), 1);
        assert_eq!(byte_at(&ctx, &top, 0), 9);
        assert_eq!(byte_at(&ctx, &top, PAGE), 6);
    }

    #[test]
    fn test_collapse_disabled_leaves_chain() {
        let ctx = VmContext::host(VmConfig::default().with_collapse(false, false), 16);
        let base = VmObject::allocate(&ctx, PAGE).unwrap();
        let (top, _) = base.shadow(0, PAGE).unwrap();
        drop(base);
        top.collapse();
        assert_eq!(top.shadow_depth(), 1);
    }

    #[test]
    fn test_symmetric_copy_returns_same_object() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, 2 * PAGE).unwrap();
        let (copy, offset, needs_copy) = object.copy_strategically(PAGE, PAGE).unwrap();
        assert!(ObjectRef::ptr_eq(&copy, &object));
        assert_eq!(offset, PAGE);
        assert!(needs_copy);
        assert_eq!(object.ref_count(), 2);
    }

    #[test]
    fn test_slow_copy_duplicates_data() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, 2 * PAGE).unwrap();
        object.set_copy_strategy(CopyStrategy::None);
        fill(&ctx, &object, 0, 5);
        let (copy, offset, needs_copy) = object.copy_strategically(0, 2 * PAGE).unwrap();
        assert!(!ObjectRef::ptr_eq(&copy, &object));
        assert_eq!((offset, needs_copy), (0, false));
        assert_eq!(copy.resident_page_count(), 2);
        assert_eq!(byte_at(&ctx, &copy, 0), 5);
        assert!(copy.shadow_id().is_none());
    }

    #[test]
    fn test_slow_copy_resource_shortage() {
        let ctx = VmContext::host(VmConfig::default(), 2);
        let object = VmObject::allocate(&ctx, 2 * PAGE).unwrap();
        fill(&ctx, &object, 0, 1);
        fill(&ctx, &object, PAGE, 2);
        assert_eq!(
            object.copy_slowly(0, 2 * PAGE, false).err(),
            Some(KernError::ResourceShortage)
        );
        assert_eq!(ctx.frames().allocated(), 2);
        assert_eq!(ctx.objects().count(), 1);
    }

    #[test]
    fn test_delayed_copy_rechains_old_copy() {
        let ctx = ctx();
        let src = VmObject::allocate(&ctx, PAGE).unwrap();
        src.set_copy_strategy(CopyStrategy::Delay);
        let (first, _, _) = src.copy_strategically(0, PAGE).unwrap();
        assert_eq!(src.copy_id(), Some(first.id()));
        assert_eq!(first.shadow_id().map(|(id, _)| id), Some(src.id()));

        let (second, _, _) = src.copy_strategically(0, PAGE).unwrap();
        assert_eq!(src.copy_id(), Some(second.id()));
        assert_eq!(first.shadow_id().map(|(id, _)| id), Some(second.id()));
        assert_eq!(second.shadow_id().map(|(id, _)| id), Some(src.id()));
        assert_eq!(src.ref_count(), 2);

        drop(second);
        drop(first);
        assert!(src.copy_id().is_none());
        assert_eq!(src.ref_count(), 1);
    }

    #[test]
    fn test_persistent_object_is_cached_and_reactivated() {
        let ctx = VmContext::host(VmConfig::default().with_object_cache_limit(1), 8);
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        let object = VmObject::enter_pager(&ctx, pager.clone(), PAGE).unwrap();
        let id = object.id();
        assert!(object.can_persist());
        drop(object);
        assert_eq!(ctx.objects().cached_count(), 1);
        assert!(ctx.objects().lookup(id).is_none());
        assert!(!pager.is_terminated());

        let again = VmObject::enter_pager(&ctx, pager.clone(), PAGE).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.ref_count(), 1);
        assert_eq!(ctx.stats().snapshot().cache_hits, 1);

        let other_pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        let other = VmObject::enter_pager(&ctx, other_pager.clone(), PAGE).unwrap();
        drop(again);
        drop(other);
        assert_eq!(ctx.objects().cached_count(), 1);
        assert_eq!(ctx.stats().snapshot().cache_evictions, 1);
        assert!(pager.is_terminated());
    }

    #[test]
    fn test_termination_writes_back_dirty_pages() {
        let ctx = ctx();
        let attrs = MemoryObjectAttributes {
            copy_strategy: CopyStrategy::Delay,
            may_cache: false,
        };
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, attrs);
        let object = VmObject::enter_pager(&ctx, pager.clone(), 2 * PAGE).unwrap();
        fill(&ctx, &object, PAGE, 0x33);
        drop(object);
        assert!(pager.is_terminated());
        assert_eq!(pager.writes(), 1);
        assert_eq!(pager.page(PAGE).unwrap()[0], 0x33);
        assert_eq!(ctx.frames().allocated(), 0);
    }

    #[test]
    fn test_clean_writes_dirty_pages_once() {
        let ctx = ctx();
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        let object = VmObject::enter_pager(&ctx, pager.clone(), 2 * PAGE).unwrap();
        fill(&ctx, &object, 0, 0x11);
        assert_eq!(object.clean(0, 2 * PAGE).unwrap(), 1);
        assert_eq!(object.clean(0, 2 * PAGE).unwrap(), 0);
        assert_eq!(pager.page(0).unwrap()[0], 0x11);
        assert_eq!(object.paging_in_progress(), 0);
        assert!(!object.page_lookup(0).unwrap().is_busy());
    }

    #[test]
    fn test_unavailable_data_records_existence() {
        let ctx = ctx();
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        let object = VmObject::enter_pager(&ctx, pager, 2 * PAGE).unwrap();
        object.data_unavailable(0, PAGE);
        assert!(object.lock().existence.contains(&0));
        object.data_supply(0, b"x", false).unwrap();
        assert!(!object.lock().existence.contains(&0));
        assert_eq!(object.resident_page_count(), 1);
    }

    #[test]
    fn test_coalesce_extends_private_object() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, 2 * PAGE).unwrap();
        assert!(object.coalesce(0, 2 * PAGE, PAGE));
        assert_eq!(object.size(), 3 * PAGE);
        let other = object.clone();
        assert!(!object.coalesce(0, 3 * PAGE, PAGE));
        drop(other);
    }

    #[test]
    #[should_panic(expected = "reference taken on a dead object")]
    fn test_reference_on_dead_object_panics() {
        let ctx = ctx();
        let object = VmObject::allocate(&ctx, PAGE).unwrap();
        object.lock().alive = false;
        let _ = object.clone();
    }
}
