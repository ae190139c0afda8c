//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Handles page faults by walking an object's shadow chain and
//! coordinating with pagers to bring pages into memory.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: pages found nowhere in the chain are zero-filled in the
//!   first object
//! - **Page-in**: pages of pager-backed objects are requested with
//!   `data_request`; the faulting thread sleeps on the busy placeholder
//!   until the pager replies
//! - **Copy-on-write**: a write to a page found below the first object
//!   copies it up; a write to a page whose object has a copy object first
//!   pushes the original contents into the copy
//!
//! `vm_fault_page` returns the page busy inside a `HeldPage`, with a
//! paging reference on its object. Dropping the `HeldPage` releases both.

use alloc::sync::Arc;
use core::fmt;

use log::{debug, trace, warn};

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_map::{VmMap, VmProt};
use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{trunc_page, PageFlags, PhysAddr, VmPage, PAGE_SIZE};
use crate::mach_vm::{VmContext, VmStats};

// ============================================================================
// Fault Types
// ============================================================================

/// Fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Read fault
    Read,
    /// Write fault
    Write,
    /// Execute fault
    Execute,
}

impl FaultType {
    /// Convert to required protection
    pub fn to_protection(&self) -> VmProt {
        match self {
            FaultType::Read => VmProt::READ,
            FaultType::Write => VmProt::WRITE,
            FaultType::Execute => VmProt::EXECUTE,
        }
    }
}

// ============================================================================
// Held page
// ============================================================================

/// A page returned busy by `vm_fault_page`
pub struct HeldPage {
    object: Arc<VmObject>,
    offset: u64,
    phys_addr: PhysAddr,
    in_first: bool,
    copied: bool,
    released: bool,
}

impl HeldPage {
    fn new(object: Arc<VmObject>, offset: u64, phys_addr: PhysAddr, in_first: bool) -> Self {
        Self {
            object,
            offset,
            phys_addr,
            in_first,
            copied: false,
            released: false,
        }
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// Offset of the page within its object
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// Whether the page belongs to the object the fault started in
    pub fn in_first_object(&self) -> bool {
        self.in_first
    }

    /// Whether this fault made a copy-on-write copy
    pub fn copied(&self) -> bool {
        self.copied
    }

    pub fn wire(&self) {
        if let Some(page) = self.object.lock().pages.get_mut(&self.offset) {
            page.wire();
        }
    }

    pub fn unwire(&self) {
        if let Some(page) = self.object.lock().pages.get_mut(&self.offset) {
            page.unwire();
        }
    }

    /// Take the frame out of its object. A wired page cannot be stolen and
    /// is handed back.
    pub(crate) fn steal(mut self) -> Result<PhysAddr, HeldPage> {
        {
            let mut st = self.object.lock();
            if st.pages.get(&self.offset).map_or(true, |p| p.is_wired()) {
                drop(st);
                return Err(self);
            }
            st.remove_page(self.offset);
        }
        if let Ok(ctx) = self.object.ctx() {
            ctx.pmaps().page_protect(self.phys_addr, VmProt::NONE);
            ctx.pmaps().clear_modify(self.phys_addr);
        }
        self.released = true;
        self.object.wakeup(self.object.page_event(self.offset));
        self.object.paging_end();
        Ok(self.phys_addr)
    }
}

impl fmt::Debug for HeldPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldPage")
            .field("object", &self.object.id())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .finish()
    }
}

impl Drop for HeldPage {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let wanted = self.object.lock().unbusy(self.offset);
        if wanted {
            self.object.wakeup(self.object.page_event(self.offset));
        }
        self.object.paging_end();
    }
}

// ============================================================================
// Object-level fault
// ============================================================================

/// Drop the paging reference taken on a lower object of the chain
fn leave(object: &Arc<VmObject>, first: &Arc<VmObject>) {
    if !Arc::ptr_eq(object, first) {
        object.paging_end();
    }
}

/// Find or create the page at `offset` of `first` for `access` and return
/// it busy.
///
/// For writes the page is always in `first` on return, copied up from the
/// shadow chain if needed, and its original contents have been pushed into
/// `first`'s copy object.
pub fn vm_fault_page(
    first: &Arc<VmObject>,
    offset: u64,
    access: VmProt,
    interruptible: bool,
) -> KernResult<HeldPage> {
    let ctx = first.ctx()?;
    {
        let mut st = first.lock();
        if !st.alive {
            return Err(KernError::MemoryFailure);
        }
        st.paging_in_progress += 1;
    }
    let result = fault_page(&ctx, first, trunc_page(offset), access, interruptible);
    first.paging_end();
    result
}

fn fault_page(
    ctx: &Arc<VmContext>,
    first: &Arc<VmObject>,
    first_offset: u64,
    access: VmProt,
    interruptible: bool,
) -> KernResult<HeldPage> {
    let write = access.contains(VmProt::WRITE);
    'restart: loop {
        let mut held = match find_page(ctx, first, first_offset, access, interruptible)? {
            Some(held) => held,
            None => continue 'restart,
        };

        if write && !held.in_first {
            let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
            ctx.frames().copy(held.phys_addr, frame);
            // Mappings of the original must refault and find the copy
            ctx.pmaps().page_protect(held.phys_addr, VmProt::NONE);
            drop(held);

            let mut st = first.lock();
            if !st.alive || st.pages.contains_key(&first_offset) {
                let alive = st.alive;
                drop(st);
                ctx.frames().free(frame);
                if !alive {
                    return Err(KernError::MemoryFailure);
                }
                continue 'restart;
            }
            let mut page = VmPage::new(first_offset, frame);
            page.flags.insert(PageFlags::BUSY);
            st.insert_page(page);
            st.paging_in_progress += 1;
            drop(st);
            VmStats::incr(&ctx.stats().cow);
            trace!("vm_fault: copied {:?}@{:#x} on write", first.id(), first_offset);
            held = HeldPage::new(Arc::clone(first), first_offset, frame, true);
            held.copied = true;
        }

        if write {
            push_to_copy(ctx, first, first_offset, held.phys_addr)?;
            if let Some(page) = first.lock().pages.get_mut(&first_offset) {
                page.set_dirty();
            }
        }
        return Ok(held);
    }
}

/// Walk the chain from `first` to the page. `None` asks the caller to
/// start over (the chain changed underneath).
fn find_page(
    ctx: &Arc<VmContext>,
    first: &Arc<VmObject>,
    first_offset: u64,
    access: VmProt,
    interruptible: bool,
) -> KernResult<Option<HeldPage>> {
    let mut object = Arc::clone(first);
    let mut offset = first_offset;
    loop {
        let mut st = object.lock();
        if !st.alive {
            drop(st);
            if Arc::ptr_eq(&object, first) {
                return Err(KernError::MemoryFailure);
            }
            object.paging_end();
            return Ok(None);
        }

        if let Some(page) = st.pages.get_mut(&offset) {
            if page.is_error() {
                st.remove_page(offset);
                drop(st);
                leave(&object, first);
                return Err(KernError::MemoryError);
            }
            if page.is_busy() {
                page.flags.insert(PageFlags::WANTED);
                let event = object.page_event(offset);
                match object.sleep(st, event, interruptible) {
                    Ok(st) => drop(st),
                    Err(err) => {
                        leave(&object, first);
                        return Err(err);
                    }
                }
                continue;
            }
            let phys_addr = match page.phys_addr {
                Some(pa) => pa,
                None => {
                    drop(st);
                    leave(&object, first);
                    return Err(KernError::MemoryError);
                }
            };
            page.flags.insert(PageFlags::BUSY | PageFlags::REFERENCED);
            st.paging_in_progress += 1;
            drop(st);
            leave(&object, first);
            let in_first = Arc::ptr_eq(&object, first);
            return Ok(Some(HeldPage::new(object, offset, phys_addr, in_first)));
        }

        // Ask the pager unless it already said it has nothing here
        if st.pager.is_some() && offset < st.size && !st.existence.contains(&offset) {
            if !st.pager_ready {
                let event = object.ready_event();
                match object.sleep(st, event, interruptible) {
                    Ok(st) => drop(st),
                    Err(err) => {
                        leave(&object, first);
                        return Err(err);
                    }
                }
                continue;
            }
            let pager = st.pager.clone();
            st.insert_page(VmPage::absent(offset));
            drop(st);
            VmStats::incr(&ctx.stats().page_in);
            trace!("vm_fault: data_request {:?}@{:#x}", object.id(), offset);
            let requested = match &pager {
                Some(pager) => pager.data_request(object.id(), offset, PAGE_SIZE as u64, access),
                None => Err(KernError::MemoryFailure),
            };
            if let Err(err) = requested {
                warn!("vm_fault: pager of {:?} unreachable: {}", object.id(), err);
                {
                    let mut st = object.lock();
                    if st.pages.get(&offset).is_some_and(|p| p.is_absent()) {
                        st.remove_page(offset);
                    }
                }
                object.wakeup(object.page_event(offset));
                leave(&object, first);
                return Err(KernError::MemoryFailure);
            }
            // The placeholder stays busy until the reply lands
            continue;
        }

        let next = match st.shadow.as_ref() {
            Some(shadow) => {
                let next = Arc::clone(shadow.arc());
                next.lock().paging_in_progress += 1;
                Some((next, offset + st.shadow_offset))
            }
            None => None,
        };
        drop(st);
        leave(&object, first);

        match next {
            Some((next, next_offset)) => {
                object = next;
                offset = next_offset;
            }
            None => return zero_fill(ctx, first, first_offset),
        }
    }
}

/// The page exists nowhere in the chain: give `first` a zeroed one
fn zero_fill(ctx: &Arc<VmContext>, first: &Arc<VmObject>, offset: u64) -> KernResult<Option<HeldPage>> {
    let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
    ctx.frames().zero(frame);
    let mut st = first.lock();
    if !st.alive || st.pages.contains_key(&offset) {
        let alive = st.alive;
        drop(st);
        ctx.frames().free(frame);
        return if alive { Ok(None) } else { Err(KernError::MemoryFailure) };
    }
    let mut page = VmPage::new(offset, frame);
    page.flags.insert(PageFlags::BUSY);
    st.insert_page(page);
    st.paging_in_progress += 1;
    drop(st);
    VmStats::incr(&ctx.stats().zero_fill);
    Ok(Some(HeldPage::new(Arc::clone(first), offset, frame, true)))
}

/// Give `object`'s copy object the current contents of the page at
/// `offset` before it is written.
fn push_to_copy(ctx: &Arc<VmContext>, object: &Arc<VmObject>, offset: u64, phys_addr: PhysAddr) -> KernResult<()> {
    let copy = match object.copy_id().and_then(|id| ctx.objects().get(id)) {
        Some(copy) => copy,
        None => return Ok(()),
    };
    {
        let mut cst = copy.lock();
        if !cst.alive || offset >= cst.size || cst.pages.contains_key(&offset) {
            return Ok(());
        }
        let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
        ctx.frames().copy(phys_addr, frame);
        let mut page = VmPage::new(offset, frame);
        page.set_dirty();
        cst.insert_page(page);
    }
    // Readers of the copy were mapping the original
    ctx.pmaps().page_protect(phys_addr, VmProt::NONE);
    trace!("vm_fault: pushed {:?}@{:#x} into copy {:?}", object.id(), offset, copy.id());
    Ok(())
}

// ============================================================================
// Map-level fault
// ============================================================================

/// Resolve `vaddr` in `map`, enter the translation and return the page
/// still busy.
pub fn vm_fault_hold(
    map: &VmMap,
    vaddr: u64,
    access: VmProt,
    wire: bool,
    interruptible: bool,
) -> KernResult<HeldPage> {
    let ctx = Arc::clone(map.context());
    loop {
        let result = map.lookup(vaddr, access)?;
        let held = vm_fault_page(result.object.arc(), result.offset, access, interruptible)?;

        // Never block on the map while holding a busy page
        let guard = match map.try_lock_read() {
            Some(guard) => guard,
            None => {
                drop(held);
                drop(map.lock_read());
                VmStats::incr(&ctx.stats().retries);
                continue;
            }
        };
        if !map.verify(&result.version) {
            drop(guard);
            drop(held);
            VmStats::incr(&ctx.stats().retries);
            trace!("vm_fault: map {:?} changed, retrying {:#x}", map.id(), vaddr);
            continue;
        }

        let mut protection = result.protection;
        let read_only_copy = !access.contains(VmProt::WRITE) && result.object.copy_id().is_some();
        if !held.in_first_object() || read_only_copy {
            protection.remove(VmProt::WRITE);
        }
        if wire {
            held.wire();
        }
        map.pmap()
            .enter(trunc_page(vaddr), held.phys_addr(), protection, result.wired || wire);
        drop(guard);
        return Ok(held);
    }
}

/// Handle a page fault at `vaddr`
pub fn vm_fault(
    map: &VmMap,
    vaddr: u64,
    fault_type: FaultType,
    change_wiring: bool,
    interruptible: bool,
) -> KernResult<()> {
    VmStats::incr(&map.context().stats().faults);
    let held = match vm_fault_hold(map, vaddr, fault_type.to_protection(), change_wiring, interruptible) {
        Ok(held) => held,
        Err(err) => {
            debug!("vm_fault: {:#x} in {:?} failed: {}", vaddr, map.id(), err);
            return Err(err);
        }
    };
    let collapse = held.copied().then(|| Arc::clone(held.object()));
    drop(held);
    if let Some(object) = collapse {
        object.collapse();
    }
    Ok(())
}
