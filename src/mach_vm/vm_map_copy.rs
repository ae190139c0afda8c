//! Copy Objects
//!
//! Based on Mach4 vm/vm_map.h (`vm_map_copy`) and the copyin/copyout paths
//! of vm/vm_map.c.
//!
//! A `VmMapCopy` carries memory between maps. It comes in three forms:
//! - entry list: map entries detached from a source map, sharing objects
//!   copy-on-write with it
//! - object: a single object owned by the copy
//! - page list: up to `PAGE_LIST_MAX` physical pages, plus a continuation
//!   that gathers the next batch on demand
//!
//! A copy is consumed by value. Dropping one that was not consumed discards
//! it: page-list frames are freed and a pending continuation is aborted.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, trace, warn};

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_fault::{vm_fault_hold, vm_fault_page};
use crate::mach_vm::vm_map::{EnterFlags, EntryAttributes, EntryTarget, MapRef, VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_object::{ObjectRef, VmObject};
use crate::mach_vm::vm_page::{checked_round_page, round_page, trunc_page, PhysAddr, PAGE_MASK, PAGE_SIZE};
use crate::mach_vm::{VmContext, VmStats, PAGE_LIST_MAX};

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// Copy object types
// ============================================================================

/// Where a page-list copy resumes
pub struct PageListResume {
    map: MapRef,
    /// Next page to gather
    next_addr: u64,
    /// End of the data (exclusive, unaligned)
    end: u64,
    steal_pages: bool,
}

impl PageListResume {
    pub fn next_addr(&self) -> u64 {
        self.next_addr
    }

    /// Bytes of data not yet gathered
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next_addr)
    }
}

impl fmt::Debug for PageListResume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageListResume")
            .field("map", &self.map.id())
            .field("next_addr", &format_args!("{:#x}", self.next_addr))
            .field("end", &format_args!("{:#x}", self.end))
            .field("steal_pages", &self.steal_pages)
            .finish()
    }
}

/// Continuation of a page-list copy
#[derive(Debug)]
pub enum CopyContinuation {
    /// More batches to gather
    Pending(PageListResume),
    /// All data is in this or earlier batches
    Done,
    /// Gathering failed or the copy was discarded
    Aborted,
}

/// Payload of a copy object
#[derive(Debug)]
pub enum VmMapCopyKind {
    /// Entries in copy coordinates (0 is the first page of the data)
    EntryList(Vec<VmMapEntry>),
    /// One object holding the data starting at `offset`
    Object { object: ObjectRef, offset: u64 },
    /// Physical pages owned by the copy
    PageList {
        pages: heapless::Vec<PhysAddr, PAGE_LIST_MAX>,
        continuation: CopyContinuation,
    },
    /// Payload handed over
    Consumed,
}

/// Copy object
pub struct VmMapCopy {
    ctx: Arc<VmContext>,
    /// Offset of the data within its first page
    offset: u64,
    /// Bytes of data carried by this copy (one batch for page lists)
    size: u64,
    kind: VmMapCopyKind,
}

impl fmt::Debug for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapCopy")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

impl VmMapCopy {
    fn new(ctx: &Arc<VmContext>, offset: u64, size: u64, kind: VmMapCopyKind) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            offset,
            size,
            kind,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> &VmMapCopyKind {
        &self.kind
    }

    /// Whether more batches can still be gathered
    pub fn has_continuation(&self) -> bool {
        matches!(
            self.kind,
            VmMapCopyKind::PageList {
                continuation: CopyContinuation::Pending(_),
                ..
            }
        )
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Detach the entries covering `[start, start + len)` of `map`.
    ///
    /// Objects are shared copy-on-write (wired or shared memory is copied
    /// eagerly). With `steal` the source range is unmapped and its entries
    /// move into the copy instead.
    pub fn make_from_entries(map: &VmMap, start: u64, len: u64, steal: bool) -> KernResult<VmMapCopy> {
        let ctx = map.context();
        if len == 0 {
            return Ok(VmMapCopy::new(ctx, 0, 0, VmMapCopyKind::EntryList(Vec::new())));
        }
        let (base, top) = page_range(map, start, len)?;
        loop {
            let mut guard = map.lock_write();
            if guard.has_hole(base, top) {
                return Err(KernError::InvalidAddress);
            }
            if let Some(key) = VmMap::transition_key(&guard, base, top) {
                map.wait_for_entry(guard, key, false)?;
                continue;
            }
            for key in guard.keys_in(base, top) {
                if !guard.entries[&key].protection.contains(VmProt::READ) {
                    return Err(KernError::ProtectionFailure);
                }
            }
            guard.clip(base);
            guard.clip(top);

            let mut entries = Vec::new();
            for key in guard.keys_in(base, top) {
                let entry = match guard.entries.get_mut(&key) {
                    Some(entry) => entry,
                    None => continue,
                };
                if let EntryTarget::Submap(submap) = &entry.target {
                    let submap = Arc::clone(submap);
                    let shift = entry.start - base;
                    let nested = VmMapCopy::make_from_entries(&submap, entry.offset, entry.size(), false)?;
                    for mut inner in nested.into_entries() {
                        inner.start += shift;
                        inner.end += shift;
                        entries.push(inner);
                    }
                    continue;
                }
                let mut copy = if steal && entry.wired_count == 0 && !entry.is_shared {
                    entry.duplicate()
                } else {
                    map.copy_entry(entry)?
                };
                copy.start -= base;
                copy.end -= base;
                entries.push(copy);
            }

            let removed = if steal {
                map.delete_range(&mut guard, base, top).unwrap_or_default()
            } else {
                Vec::new()
            };
            drop(guard);
            if !removed.is_empty() {
                drop(removed);
                ctx.scheduler().wakeup(map.space_event());
            }
            debug!(
                "vm_map_copy: {} entries from {:?} [{:#x}, {:#x}){}",
                entries.len(),
                map.id(),
                base,
                top,
                if steal { " (moved)" } else { "" }
            );
            return Ok(VmMapCopy::new(ctx, start - base, len, VmMapCopyKind::EntryList(entries)));
        }
    }

    /// Copy carrying `[offset, offset + size)` of `object`
    pub fn make_from_object(ctx: &Arc<VmContext>, object: ObjectRef, offset: u64, size: u64) -> VmMapCopy {
        VmMapCopy::new(
            ctx,
            offset & PAGE_MASK,
            size,
            VmMapCopyKind::Object {
                object,
                offset: trunc_page(offset),
            },
        )
    }

    /// Copy of `data` in a fresh object
    pub fn from_bytes(ctx: &Arc<VmContext>, data: &[u8]) -> KernResult<VmMapCopy> {
        let len = data.len() as u64;
        let object = VmObject::allocate(ctx, len)?;
        for (index, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
            ctx.frames().write(frame, 0, chunk);
            object.page_insert(index as u64 * PAGE, frame);
        }
        Ok(VmMapCopy::make_from_object(ctx, object, 0, len))
    }

    /// Gather the first batch of pages covering `[addr, addr + len)`.
    ///
    /// With `steal_pages`, pages private to the source are taken out of it
    /// instead of copied.
    pub fn make_from_pages(map: &MapRef, addr: u64, len: u64, steal_pages: bool) -> KernResult<VmMapCopy> {
        let ctx = map.context();
        if len == 0 {
            let kind = VmMapCopyKind::PageList {
                pages: heapless::Vec::new(),
                continuation: CopyContinuation::Done,
            };
            return Ok(VmMapCopy::new(ctx, 0, 0, kind));
        }
        let (base, _) = page_range(map, addr, len)?;
        let resume = PageListResume {
            map: Arc::clone(map),
            next_addr: base,
            end: addr + len,
            steal_pages,
        };
        gather(resume, addr - base)
    }

    // ========================================================================
    // Continuations
    // ========================================================================

    /// Gather the next batch. `Ok(None)` when there is nothing left.
    ///
    /// On failure the continuation is aborted and this copy keeps only the
    /// pages already gathered.
    pub fn invoke_continuation(&mut self) -> KernResult<Option<VmMapCopy>> {
        let continuation = match &mut self.kind {
            VmMapCopyKind::PageList { continuation, .. } => continuation,
            _ => return Ok(None),
        };
        match core::mem::replace(continuation, CopyContinuation::Done) {
            CopyContinuation::Pending(resume) => {
                let next_addr = resume.next_addr;
                match gather(resume, 0) {
                    Ok(next) => Ok(Some(next)),
                    Err(err) => {
                        warn!("vm_map_copy: continuation at {:#x} failed: {}", next_addr, err);
                        *continuation = CopyContinuation::Aborted;
                        Err(err)
                    }
                }
            }
            other => {
                *continuation = other;
                Ok(None)
            }
        }
    }

    /// Release everything the copy holds
    pub fn discard(self) {
        drop(self);
    }

    // ========================================================================
    // Consumption
    // ========================================================================

    fn take_kind(&mut self) -> VmMapCopyKind {
        core::mem::replace(&mut self.kind, VmMapCopyKind::Consumed)
    }

    fn into_entries(mut self) -> Vec<VmMapEntry> {
        match self.take_kind() {
            VmMapCopyKind::EntryList(entries) => entries,
            _ => Vec::new(),
        }
    }

    /// All the data of this copy and its continuations
    pub fn read_into(mut self, buf: &mut Vec<u8>) -> KernResult<()> {
        loop {
            let mut pages = vec![0u8; round_page(self.offset + self.size) as usize];
            self.fill_pages(&mut pages)?;
            let start = self.offset as usize;
            buf.extend_from_slice(&pages[start..start + self.size as usize]);
            match self.invoke_continuation()? {
                Some(next) => self = next,
                None => return Ok(()),
            }
        }
    }

    /// Copy the page-aligned contents of this copy into `out`
    fn fill_pages(&self, out: &mut [u8]) -> KernResult<()> {
        let frames = self.ctx.frames();
        match &self.kind {
            VmMapCopyKind::PageList { pages, .. } => {
                for (chunk, &pa) in out.chunks_mut(PAGE_SIZE).zip(pages.iter()) {
                    frames.read(pa, 0, chunk);
                }
            }
            VmMapCopyKind::Object { object, offset } => {
                for (index, chunk) in out.chunks_mut(PAGE_SIZE).enumerate() {
                    let held = vm_fault_page(object.arc(), offset + index as u64 * PAGE, VmProt::READ, false)?;
                    frames.read(held.phys_addr(), 0, chunk);
                }
            }
            VmMapCopyKind::EntryList(entries) => {
                for entry in entries {
                    let object = match entry.object() {
                        Some(object) => object,
                        None => continue,
                    };
                    let mut rel = entry.start;
                    while rel < entry.end && (rel as usize) < out.len() {
                        let held = vm_fault_page(object.arc(), entry.offset + (rel - entry.start), VmProt::READ, false)?;
                        let at = rel as usize;
                        frames.read(held.phys_addr(), 0, &mut out[at..at + PAGE_SIZE]);
                        rel += PAGE;
                    }
                }
            }
            VmMapCopyKind::Consumed => {}
        }
        Ok(())
    }
}

impl Drop for VmMapCopy {
    fn drop(&mut self) {
        if let VmMapCopyKind::PageList { pages, continuation } = &mut self.kind {
            let freed = pages.len();
            while let Some(pa) = pages.pop() {
                self.ctx.frames().free(pa);
            }
            if let CopyContinuation::Pending(resume) = continuation {
                VmStats::incr(&self.ctx.stats().continuation_aborts);
                debug!(
                    "vm_map_copy: discarded with {:#x} bytes not gathered ({} pages freed)",
                    resume.remaining(),
                    freed
                );
                *continuation = CopyContinuation::Aborted;
            }
        }
    }
}

/// Page-aligned bounds of `[start, start + len)`, checked against `map`
fn page_range(map: &VmMap, start: u64, len: u64) -> KernResult<(u64, u64)> {
    let end = start.checked_add(len).ok_or(KernError::InvalidAddress)?;
    let base = trunc_page(start);
    let top = checked_round_page(end).ok_or(KernError::InvalidAddress)?;
    if base < map.min_offset() || top > map.max_offset() {
        return Err(KernError::InvalidAddress);
    }
    Ok((base, top))
}

/// Gather one batch starting at `resume.next_addr`
fn gather(resume: PageListResume, offset: u64) -> KernResult<VmMapCopy> {
    let map = Arc::clone(&resume.map);
    let ctx = map.context();
    let top = round_page(resume.end);
    let batch_end = top.min(resume.next_addr + (PAGE_LIST_MAX as u64) * PAGE);

    let mut pages: heapless::Vec<PhysAddr, PAGE_LIST_MAX> = heapless::Vec::new();
    let mut va = resume.next_addr;
    while va < batch_end {
        let frame = match page_out(&map, va, resume.steal_pages) {
            Ok(frame) => frame,
            Err(err) => {
                while let Some(pa) = pages.pop() {
                    ctx.frames().free(pa);
                }
                return Err(err);
            }
        };
        if let Err(frame) = pages.push(frame) {
            ctx.frames().free(frame);
        }
        va += PAGE;
    }

    let size = batch_end.min(resume.end) - (resume.next_addr + offset);
    let continuation = if batch_end < top {
        CopyContinuation::Pending(PageListResume {
            next_addr: batch_end,
            ..resume
        })
    } else {
        CopyContinuation::Done
    };
    trace!("vm_map_copy: gathered {} pages from {:?}", pages.len(), map.id());
    Ok(VmMapCopy::new(ctx, offset, size, VmMapCopyKind::PageList { pages, continuation }))
}

/// A frame holding the page at `va` of `map`, owned by the caller
fn page_out(map: &VmMap, va: u64, steal: bool) -> KernResult<PhysAddr> {
    let ctx = map.context();
    let result = map.lookup(va, VmProt::READ)?;
    let held = vm_fault_page(result.object.arc(), result.offset, VmProt::READ, false)?;
    // The entry's reference and ours
    let private = result.object.ref_count() == 2 && result.object.is_internal() && result.object.is_temporary();
    let held = if steal && private && held.in_first_object() {
        match held.steal() {
            Ok(frame) => return Ok(frame),
            Err(held) => held,
        }
    } else {
        held
    };
    let frame = ctx.frames().alloc().ok_or(KernError::ResourceShortage)?;
    ctx.frames().copy(held.phys_addr(), frame);
    Ok(frame)
}

// ============================================================================
// Map operations
// ============================================================================

impl VmMap {
    /// Copy `[start, start + len)` out of this map as an entry list.
    /// With `steal_pages` the range is moved out and unmapped.
    pub fn copyin(&self, start: u64, len: u64, steal_pages: bool) -> KernResult<VmMapCopy> {
        VmMapCopy::make_from_entries(self, start, len, steal_pages)
    }

    /// Copy `[start, start + len)` out of this map as a page list
    pub fn copyin_page_list(self: &Arc<Self>, start: u64, len: u64, steal_pages: bool) -> KernResult<VmMapCopy> {
        VmMapCopy::make_from_pages(self, start, len, steal_pages)
    }

    /// Map `copy` into this map at or above `dest_hint`; returns the
    /// address of the data.
    pub fn copyout(&self, dest_hint: u64, mut copy: VmMapCopy) -> KernResult<u64> {
        let ctx = Arc::clone(self.context());
        let offset = copy.offset;
        if copy.size == 0 {
            return Ok(dest_hint);
        }
        match copy.take_kind() {
            VmMapCopyKind::EntryList(entries) => {
                let size = round_page(offset + copy.size);
                let (mut guard, addr) = match self.reserve_space(dest_hint, size, PAGE_MASK) {
                    Ok(found) => found,
                    Err(err) => {
                        copy.kind = VmMapCopyKind::EntryList(entries);
                        return Err(err);
                    }
                };
                for mut entry in entries {
                    entry.start += addr;
                    entry.end += addr;
                    guard.insert(entry);
                }
                self.finish_insert(guard, addr, addr + size, VmProt::NONE)?;
                debug!("vm_map_copy: entry list copied out to {:?} at {:#x}", self.id(), addr);
                Ok(addr + offset)
            }
            VmMapCopyKind::Object { object, offset: object_offset } => {
                let size = round_page(offset + copy.size);
                let addr = self.enter(
                    dest_hint,
                    size,
                    0,
                    EnterFlags::ANYWHERE,
                    Some(object),
                    object_offset,
                    false,
                    EntryAttributes::default(),
                )?;
                Ok(addr + offset)
            }
            kind @ VmMapCopyKind::PageList { .. } => {
                copy.kind = kind;
                let object = self.collect_page_list(&ctx, copy)?;
                let size = object.size();
                let addr = self.enter(
                    dest_hint,
                    size,
                    0,
                    EnterFlags::ANYWHERE,
                    Some(object),
                    0,
                    false,
                    EntryAttributes::default(),
                )?;
                Ok(addr + offset)
            }
            VmMapCopyKind::Consumed => Err(KernError::InvalidArgument),
        }
    }

    /// Move every batch of a page-list copy into one new object
    fn collect_page_list(&self, ctx: &Arc<VmContext>, mut copy: VmMapCopy) -> KernResult<ObjectRef> {
        let mut frames = Vec::new();
        loop {
            let next = copy.invoke_continuation();
            if let VmMapCopyKind::PageList { pages, .. } = &mut copy.kind {
                frames.extend(pages.iter().copied());
                pages.clear();
            }
            match next {
                Ok(Some(more)) => copy = more,
                Ok(None) => break,
                Err(err) => {
                    for pa in frames {
                        ctx.frames().free(pa);
                    }
                    return Err(err);
                }
            }
        }
        let object = match VmObject::allocate(ctx, frames.len() as u64 * PAGE) {
            Ok(object) => object,
            Err(err) => {
                for pa in frames {
                    ctx.frames().free(pa);
                }
                return Err(err);
            }
        };
        for (index, pa) in frames.into_iter().enumerate() {
            object.page_insert(index as u64 * PAGE, pa);
        }
        Ok(object)
    }

    /// Write the `length` bytes of `copy` over the existing mapping at `dst`
    pub fn copy_overwrite(&self, dst: u64, length: u64, copy: VmMapCopy, interruptible: bool) -> KernResult<()> {
        let size = copy.size;
        if length != size {
            return Err(KernError::InvalidArgument);
        }
        if size == 0 {
            return Ok(());
        }
        let end = dst.checked_add(size).ok_or(KernError::InvalidAddress)?;
        {
            let guard = self.lock_read();
            let (base, top) = (trunc_page(dst), round_page(end));
            if guard.has_hole(base, top) {
                return Err(KernError::InvalidAddress);
            }
            for key in guard.keys_in(base, top) {
                if !guard.entries[&key].protection.contains(VmProt::WRITE) {
                    return Err(KernError::ProtectionFailure);
                }
            }
        }

        let mut data = Vec::with_capacity(size as usize);
        copy.read_into(&mut data)?;

        let frames = self.context().frames();
        let mut written = 0usize;
        while written < data.len() {
            let va = dst + written as u64;
            let in_page = (va & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - written);
            let held = vm_fault_hold(self, va, VmProt::WRITE, false, interruptible)?;
            frames.write(held.phys_addr(), in_page, &data[written..written + chunk]);
            drop(held);
            written += chunk;
        }
        trace!("vm_map_copy: overwrote {:#x} bytes at {:#x} in {:?}", size, dst, self.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::vm_map::VmInherit;
    use crate::mach_vm::VmConfig;

    fn setup(frames: usize) -> (Arc<VmContext>, MapRef) {
        let ctx = VmContext::host(VmConfig::default(), frames);
        let map = VmMap::create(&ctx, 0x1000, 0x1000_0000).unwrap();
        (ctx, map)
    }

    fn fill(map: &VmMap, addr: u64, data: &[u8]) {
        let copy = VmMapCopy::from_bytes(map.context(), data).unwrap();
        map.copy_overwrite(addr, data.len() as u64, copy, false).unwrap();
    }

    fn read(map: &MapRef, addr: u64, len: u64) -> Vec<u8> {
        let mut out = Vec::new();
        map.copyin_page_list(addr, len, false)
            .unwrap()
            .read_into(&mut out)
            .unwrap();
        out
    }

    fn anon(map: &VmMap, addr: u64, len: u64) {
        map.enter(addr, len, 0, EnterFlags::empty(), None, 0, false, EntryAttributes::default())
            .unwrap();
    }

    #[test]
    fn test_overwrite_and_page_list_read() {
        let (_ctx, map) = setup(16);
        anon(&map, 0x10_000, 3 * PAGE);
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        fill(&map, 0x10_100, &data);
        assert_eq!(read(&map, 0x10_100, 5000), data);
        assert_eq!(read(&map, 0x10_000, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_overwrite_checks_range() {
        let (ctx, map) = setup(16);
        anon(&map, 0x10_000, PAGE);
        let copy = VmMapCopy::from_bytes(&ctx, &[1; 8]).unwrap();
        assert_eq!(map.copy_overwrite(0x20_000, 8, copy, false), Err(KernError::InvalidAddress));
        map.protect(0x10_000, 0x11_000, VmProt::READ, false).unwrap();
        let copy = VmMapCopy::from_bytes(&ctx, &[1; 8]).unwrap();
        assert_eq!(map.copy_overwrite(0x10_000, 8, copy, false), Err(KernError::ProtectionFailure));
    }

    #[test]
    fn test_entry_list_copy_is_isolated() {
        let (_ctx, map) = setup(32);
        anon(&map, 0x10_000, 2 * PAGE);
        fill(&map, 0x10_000, b"original");
        let copy = map.copyin(0x10_000, 2 * PAGE, false).unwrap();
        assert!(matches!(copy.kind(), VmMapCopyKind::EntryList(e) if e.len() == 1));
        let addr = map.copyout(0x40_000, copy).unwrap();
        assert!(addr >= 0x40_000);

        fill(&map, 0x10_000, b"changed!");
        assert_eq!(read(&map, addr, 8), b"original".to_vec());
        fill(&map, addr, b"copy....");
        assert_eq!(read(&map, 0x10_000, 8), b"changed!".to_vec());
    }

    #[test]
    fn test_copyin_steal_moves_range() {
        let (_ctx, map) = setup(16);
        anon(&map, 0x10_000, PAGE);
        fill(&map, 0x10_000, b"moved");
        let copy = map.copyin(0x10_000, 5, true).unwrap();
        assert_eq!(map.entry_count(), 0);
        let addr = map.copyout(0x80_000, copy).unwrap();
        assert_eq!(read(&map, addr, 5), b"moved".to_vec());
    }

    #[test]
    fn test_copyin_rejects_holes_and_unreadable() {
        let (_ctx, map) = setup(16);
        anon(&map, 0x10_000, PAGE);
        assert_eq!(map.copyin(0x10_000, 2 * PAGE, false).err(), Some(KernError::InvalidAddress));
        map.protect(0x10_000, 0x11_000, VmProt::NONE, false).unwrap();
        assert_eq!(map.copyin(0x10_000, PAGE, false).err(), Some(KernError::ProtectionFailure));
    }

    #[test]
    fn test_copyin_descends_submap() {
        let (ctx, map) = setup(16);
        let nested = VmMap::create(&ctx, 0x1000, 0x100_000).unwrap();
        anon(&nested, 0x2000, PAGE);
        fill(&nested, 0x2000, b"nested");
        map.submap(0x50_000, 0x51_000, Arc::clone(&nested), 0x2000).unwrap();
        let copy = map.copyin(0x50_000, 6, false).unwrap();
        let addr = map.copyout(0x90_000, copy).unwrap();
        assert_eq!(read(&map, addr, 6), b"nested".to_vec());
    }

    #[test]
    fn test_object_copyout() {
        let (ctx, map) = setup(16);
        let copy = VmMapCopy::from_bytes(&ctx, b"hello").unwrap();
        assert_eq!(copy.size(), 5);
        let addr = map.copyout(0x20_000, copy).unwrap();
        assert_eq!(read(&map, addr, 5), b"hello".to_vec());
    }

    #[test]
    fn test_page_list_batches_and_copyout() {
        let (ctx, map) = setup(64);
        let len = (PAGE_LIST_MAX as u64 + 2) * PAGE;
        anon(&map, 0x10_000, len);
        fill(&map, 0x10_000 + len - 3, b"end");
        let copy = map.copyin_page_list(0x10_000, len, false).unwrap();
        assert!(copy.has_continuation());
        match copy.kind() {
            VmMapCopyKind::PageList { pages, .. } => assert_eq!(pages.len(), PAGE_LIST_MAX),
            other => panic!("unexpected {:?}", other),
        }
        let addr = map.copyout(0x100_000, copy).unwrap();
        assert_eq!(read(&map, addr + len - 3, 3), b"end".to_vec());
        assert_eq!(ctx.stats().snapshot().continuation_aborts, 0);
    }

    #[test]
    fn test_page_list_steal_takes_private_pages() {
        let (ctx, map) = setup(16);
        anon(&map, 0x10_000, PAGE);
        fill(&map, 0x10_000, b"stolen");
        let before = ctx.frames().allocated();
        let copy = map.copyin_page_list(0x10_000, PAGE, true).unwrap();
        assert_eq!(ctx.frames().allocated(), before);
        let object = map.lookup(0x10_000, VmProt::READ).unwrap().object;
        assert!(object.page_lookup(0).is_none());
        let mut out = Vec::new();
        copy.read_into(&mut out).unwrap();
        assert_eq!(&out[..6], b"stolen");
    }

    #[test]
    fn test_discard_aborts_pending_continuation() {
        let (ctx, map) = setup(64);
        let len = 3 * PAGE_LIST_MAX as u64 * PAGE;
        anon(&map, 0x10_000, len);
        map.wire(0x10_000, 0x10_000 + len, VmProt::READ, false).unwrap();
        let baseline = ctx.frames().allocated();

        let mut copy = map.copyin_page_list(0x10_000, len, false).unwrap();
        assert_eq!(ctx.frames().allocated(), baseline + PAGE_LIST_MAX);
        let next = copy.invoke_continuation().unwrap().unwrap();
        drop(copy);
        next.discard();
        assert_eq!(ctx.frames().allocated(), baseline);
        assert_eq!(ctx.stats().snapshot().continuation_aborts, 1);
    }

    #[test]
    fn test_fork_copy_entries_stay_isolated() {
        let (_ctx, map) = setup(32);
        anon(&map, 0x10_000, PAGE);
        map.inherit(0x10_000, 0x11_000, VmInherit::Copy).unwrap();
        fill(&map, 0x10_000, b"parent");
        let child = map.fork().unwrap();
        fill(&child, 0x10_000, b"child!");
        assert_eq!(read(&map, 0x10_000, 6), b"parent".to_vec());
        assert_eq!(read(&child, 0x10_000, 6), b"child!".to_vec());
    }
}
