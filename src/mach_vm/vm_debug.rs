//! VM Debug Interface
//!
//! Based on Mach4 vm/vm_debug.c
//!
//! Read-only snapshots for user-level tools. Each query holds a lock only
//! long enough to copy one snapshot out, so the answers may be stale by the
//! time the caller looks at them.

use alloc::vec::Vec;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_map::{VmInherit, VmMap, VmProt};
use crate::mach_vm::vm_object::{CopyStrategy, VmObjectId};
use crate::mach_vm::vm_page::{PageFlags, PhysAddr};
use crate::mach_vm::VmContext;

/// One map entry, as seen by `region_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub start: u64,
    pub end: u64,
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
    /// Backing object; `None` for lazily allocated memory and submaps
    pub object: Option<VmObjectId>,
    pub offset: u64,
    pub is_submap: bool,
    pub is_shared: bool,
    /// Copy-on-write still pending
    pub needs_copy: bool,
    pub wired_count: u32,
    pub user_wired_count: u32,
}

impl RegionInfo {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Snapshot of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: VmObjectId,
    pub size: u64,
    pub ref_count: u32,
    pub resident_count: usize,
    pub absent_count: u32,
    pub paging_in_progress: u32,
    pub copy_strategy: CopyStrategy,
    /// Backing object and the offset into it
    pub shadow: Option<(VmObjectId, u64)>,
    pub copy: Option<VmObjectId>,
    pub internal: bool,
    pub temporary: bool,
    pub can_persist: bool,
    pub pager_ready: bool,
    pub cached: bool,
}

/// One resident page descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub offset: u64,
    pub phys_addr: Option<PhysAddr>,
    pub flags: PageFlags,
    pub wire_count: u32,
}

impl PageInfo {
    pub fn is_busy(&self) -> bool {
        self.flags.contains(PageFlags::BUSY)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    pub fn is_wired(&self) -> bool {
        self.wire_count > 0
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(PageFlags::ACTIVE)
    }

    pub fn is_inactive(&self) -> bool {
        self.flags.contains(PageFlags::INACTIVE)
    }
}

/// The region containing `address`, or the first one above it
pub fn region_info(map: &VmMap, address: u64) -> KernResult<RegionInfo> {
    let guard = map.lock_read();
    let key = match guard.containing(address) {
        Some(key) => key,
        None => *guard
            .entries
            .range(address..)
            .next()
            .ok_or(KernError::InvalidAddress)?
            .0,
    };
    let entry = &guard.entries[&key];
    Ok(RegionInfo {
        start: entry.start,
        end: entry.end,
        protection: entry.protection,
        max_protection: entry.max_protection,
        inheritance: entry.inheritance,
        object: entry.object().map(|o| o.id()),
        offset: entry.offset,
        is_submap: entry.is_submap(),
        is_shared: entry.is_shared,
        needs_copy: entry.needs_copy,
        wired_count: entry.wired_count,
        user_wired_count: entry.user_wired_count,
    })
}

/// Snapshot of the object with `id`
pub fn object_info(ctx: &VmContext, id: VmObjectId) -> KernResult<ObjectInfo> {
    let object = ctx.objects().get(id).ok_or(KernError::InvalidArgument)?;
    let st = object.lock();
    Ok(ObjectInfo {
        id,
        size: st.size,
        ref_count: st.ref_count,
        resident_count: st.pages.len(),
        absent_count: st.absent_count,
        paging_in_progress: st.paging_in_progress,
        copy_strategy: st.copy_strategy,
        shadow: st.shadow.as_ref().map(|s| (s.id(), st.shadow_offset)),
        copy: st.copy,
        internal: st.internal,
        temporary: st.temporary,
        can_persist: st.can_persist,
        pager_ready: st.pager_ready,
        cached: st.cached,
    })
}

/// Up to `max` pages of object `id` at offsets `>= cursor`, plus the cursor
/// for the next call (`None` once the object is exhausted).
pub fn object_pages(
    ctx: &VmContext,
    id: VmObjectId,
    cursor: u64,
    max: usize,
) -> KernResult<(Vec<PageInfo>, Option<u64>)> {
    if max == 0 {
        return Err(KernError::InvalidArgument);
    }
    let object = ctx.objects().get(id).ok_or(KernError::InvalidArgument)?;
    let st = object.lock();
    let mut pages = st.pages.range(cursor..).map(|(_, page)| PageInfo {
        offset: page.offset,
        phys_addr: page.phys_addr,
        flags: page.flags,
        wire_count: page.wire_count,
    });
    let batch: Vec<PageInfo> = pages.by_ref().take(max).collect();
    let next = pages.next().map(|page| page.offset);
    Ok((batch, next))
}
