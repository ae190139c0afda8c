//! VM Page Management - Physical Page Abstraction
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! Two halves:
//! - `VmPage`: the resident-page descriptor kept in an object's page table
//! - `PageFrameAllocator`: the physical page allocator collaborator, with
//!   `FrameTable` as the in-crate implementation backed by heap frames

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use bitflags::bitflags;

use crate::kern::lock::SimpleLock;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the offset-within-page bits
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Physical address of a page frame
pub type PhysAddr = u64;

// ============================================================================
// Page Flags
// ============================================================================

bitflags! {
    /// Page state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        /// Page is in active queue
        const ACTIVE = 0x0001;
        /// Page is in inactive queue
        const INACTIVE = 0x0002;
        /// Page is busy (I/O or copy in progress)
        const BUSY = 0x0010;
        /// Someone sleeps on this page
        const WANTED = 0x0020;
        /// Page is dirty (modified)
        const DIRTY = 0x0200;
        /// Page was referenced recently
        const REFERENCED = 0x0400;
        /// Page is precious (pager wants it back even if clean)
        const PRECIOUS = 0x1000;
        /// Page is absent (requested from the pager, data not yet supplied)
        const ABSENT = 0x2000;
        /// Pager reported an error for this page
        const ERROR = 0x4000;
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Resident page descriptor.
///
/// Lives in the page table of exactly one object and is only touched with
/// that object's lock held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPage {
    /// Offset within the owning object
    pub offset: u64,
    /// Backing frame; `None` for an absent placeholder
    pub phys_addr: Option<PhysAddr>,
    /// Page flags
    pub flags: PageFlags,
    /// Wire count (reference count for wiring)
    pub wire_count: u32,
}

impl VmPage {
    /// Resident page holding `frame`
    pub fn new(offset: u64, frame: PhysAddr) -> Self {
        Self {
            offset,
            phys_addr: Some(frame),
            flags: PageFlags::ACTIVE,
            wire_count: 0,
        }
    }

    /// Busy placeholder for data requested from a pager
    pub fn absent(offset: u64) -> Self {
        Self {
            offset,
            phys_addr: None,
            flags: PageFlags::BUSY | PageFlags::ABSENT,
            wire_count: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.flags.contains(PageFlags::BUSY)
    }

    pub fn is_absent(&self) -> bool {
        self.flags.contains(PageFlags::ABSENT)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(PageFlags::ERROR)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    pub fn is_wired(&self) -> bool {
        self.wire_count > 0
    }

    /// Usable data: resident, not absent, not in error
    pub fn is_valid(&self) -> bool {
        self.phys_addr.is_some() && !self.flags.intersects(PageFlags::ABSENT | PageFlags::ERROR)
    }

    pub fn wire(&mut self) {
        self.wire_count += 1;
    }

    pub fn unwire(&mut self) {
        if self.wire_count == 0 {
            panic!("vm_page: unwire of an unwired page at offset {:#x}", self.offset);
        }
        self.wire_count -= 1;
    }

    pub fn set_dirty(&mut self) {
        self.flags.insert(PageFlags::DIRTY | PageFlags::REFERENCED);
    }
}

// ============================================================================
// Physical Page Allocator
// ============================================================================

/// Physical page allocator collaborator
///
/// Frames are whole pages; byte access is offset-within-frame.
pub trait PageFrameAllocator: Send + Sync {
    /// Allocate a zeroed frame
    fn alloc(&self) -> Option<PhysAddr>;

    /// Return a frame to the free pool
    fn free(&self, frame: PhysAddr);

    /// Fill a frame with zeroes
    fn zero(&self, frame: PhysAddr);

    /// Copy one whole frame into another
    fn copy(&self, src: PhysAddr, dst: PhysAddr);

    /// Read bytes starting at `offset` within `frame`
    fn read(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]);

    /// Write bytes starting at `offset` within `frame`
    fn write(&self, frame: PhysAddr, offset: usize, data: &[u8]);

    /// Frames currently handed out
    fn allocated(&self) -> usize;
}

/// Frame statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub allocated: usize,
}

struct FrameTableInner {
    /// Free frame numbers, reused first-in first-out
    free_queue: VecDeque<u32>,
    /// Contents of frames handed out, by frame number
    frames: BTreeMap<u32, Box<[u8]>>,
    /// Next never-used frame number
    next_frame: u32,
    /// Total frames this table may hand out
    capacity: usize,
}

/// Heap-backed physical memory for hosts and tests
pub struct FrameTable {
    inner: SimpleLock<FrameTableInner>,
    base_page: u32,
}

impl FrameTable {
    /// Table with room for `capacity` frames, numbered from physical 0x100000
    pub fn new(capacity: usize) -> Self {
        Self::with_base(0x100000, capacity)
    }

    /// Table whose first frame sits at physical address `base`
    pub fn with_base(base: PhysAddr, capacity: usize) -> Self {
        Self {
            inner: SimpleLock::new(FrameTableInner {
                free_queue: VecDeque::new(),
                frames: BTreeMap::new(),
                next_frame: 0,
                capacity,
            }),
            base_page: addr_to_page(base),
        }
    }

    fn frame_number(&self, frame: PhysAddr) -> u32 {
        addr_to_page(frame) - self.base_page
    }

    fn with_frame<R>(&self, frame: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let num = self.frame_number(frame);
        let mut inner = self.inner.lock();
        match inner.frames.get_mut(&num) {
            Some(data) => f(data),
            None => panic!("vm_page: access to unallocated frame {:#x}", frame),
        }
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total: inner.capacity,
            free: inner.capacity - inner.frames.len(),
            allocated: inner.frames.len(),
        }
    }
}

impl PageFrameAllocator for FrameTable {
    fn alloc(&self) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= inner.capacity {
            return None;
        }
        let num = match inner.free_queue.pop_front() {
            Some(num) => num,
            None => {
                let num = inner.next_frame;
                inner.next_frame += 1;
                num
            }
        };
        inner.frames.insert(num, vec![0u8; PAGE_SIZE].into_boxed_slice());
        Some(page_to_addr(self.base_page + num))
    }

    fn free(&self, frame: PhysAddr) {
        let num = self.frame_number(frame);
        let mut inner = self.inner.lock();
        if inner.frames.remove(&num).is_none() {
            panic!("vm_page: double free of frame {:#x}", frame);
        }
        inner.free_queue.push_back(num);
    }

    fn zero(&self, frame: PhysAddr) {
        self.with_frame(frame, |data| data.fill(0));
    }

    fn copy(&self, src: PhysAddr, dst: PhysAddr) {
        let src_num = self.frame_number(src);
        let dst_num = self.frame_number(dst);
        let mut inner = self.inner.lock();
        let data = match inner.frames.get(&src_num) {
            Some(data) => data.clone(),
            None => panic!("vm_page: copy from unallocated frame {:#x}", src),
        };
        match inner.frames.get_mut(&dst_num) {
            Some(dst_data) => dst_data.copy_from_slice(&data),
            None => panic!("vm_page: copy to unallocated frame {:#x}", dst),
        }
    }

    fn read(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]) {
        self.with_frame(frame, |data| buf.copy_from_slice(&data[offset..offset + buf.len()]));
    }

    fn write(&self, frame: PhysAddr, offset: usize, src: &[u8]) {
        self.with_frame(frame, |data| data[offset..offset + src.len()].copy_from_slice(src));
    }

    fn allocated(&self) -> usize {
        self.inner.lock().frames.len()
    }
}

// ============================================================================
// Address helpers
// ============================================================================

/// Convert address to page number
pub const fn addr_to_page(addr: u64) -> u32 {
    (addr >> PAGE_SHIFT) as u32
}

/// Convert page number to address
pub const fn page_to_addr(page: u32) -> u64 {
    (page as u64) << PAGE_SHIFT
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Round up, or `None` if that would wrap
pub const fn checked_round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Check page alignment
pub const fn page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

/// Number of pages covering `len` bytes
pub const fn atop(len: u64) -> u64 {
    len >> PAGE_SHIFT
}

/// Bytes covered by `pages` pages
pub const fn ptoa(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}
