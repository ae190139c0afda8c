//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Provides memory management including:
//! - vm_page: resident page descriptors and the physical page allocator
//! - vm_object: memory objects with shadow/copy chains
//! - vm_map: address space management
//! - vm_map_copy: copy objects moving memory between maps
//! - vm_fault: page fault resolution
//! - pmap: physical map (hardware page table) interface
//! - memory_object: external memory manager (pager) interface
//! - vm_user: the user-visible allocate/deallocate/protect/... calls
//! - vm_debug: read-only introspection
//!
//! All collaborators are reached through a `VmContext`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::lock::DEFAULT_SPIN_BUDGET;
use crate::kern::sched_prim::Scheduler;

pub mod memory_object;
pub mod pmap;
pub mod vm_debug;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_map_copy;
pub mod vm_object;
pub mod vm_page;
pub mod vm_user;

pub use memory_object::{InMemoryPager, MemoryManager, MemoryObjectAttributes, PagerId, ReplyMode};
pub use pmap::{Pmap, PmapDomain, PmapId, SoftPmap, SoftPmapDomain};
pub use vm_debug::{object_info, object_pages, region_info, ObjectInfo, PageInfo, RegionInfo};
pub use vm_fault::{vm_fault, vm_fault_hold, vm_fault_page, FaultType, HeldPage};
pub use vm_map::{
    EnterFlags, EntryAttributes, EntryHandle, EntryLookup, EntryTarget, LookupResult, MapRef, MapVersion,
    VmInherit, VmMap, VmMapEntry, VmMapId, VmProt,
};
pub use vm_map_copy::{CopyContinuation, PageListResume, VmMapCopy, VmMapCopyKind};
pub use vm_object::{CopyStrategy, ObjectManager, ObjectRef, VmObject, VmObjectId};
pub use vm_page::{FrameTable, PageFlags, PageFrameAllocator, PhysAddr, VmPage, PAGE_SHIFT, PAGE_SIZE};

/// Pages gathered per page-list copy batch
pub const PAGE_LIST_MAX: usize = 8;

/// Default lowest user address
pub const VM_MIN_USER_ADDRESS: u64 = 0x1000;

/// Default highest user address (exclusive)
pub const VM_MAX_USER_ADDRESS: u64 = 0x0000_8000_0000_0000;

// ============================================================================
// Configuration
// ============================================================================

/// VM tunables
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Spins before a sleep lock blocks
    pub lock_spin_budget: u32,
    /// Persistent objects kept alive at zero references
    pub object_cache_limit: usize,
    /// Allow merging a sole-referenced shadow into its parent
    pub collapse_allowed: bool,
    /// Allow skipping a shadow the parent fully covers
    pub bypass_allowed: bool,
    /// Default bounds of user maps
    pub user_min: u64,
    pub user_max: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            lock_spin_budget: DEFAULT_SPIN_BUDGET,
            object_cache_limit: 32,
            collapse_allowed: true,
            bypass_allowed: true,
            user_min: VM_MIN_USER_ADDRESS,
            user_max: VM_MAX_USER_ADDRESS,
        }
    }
}

impl VmConfig {
    pub fn with_lock_spin_budget(mut self, spins: u32) -> Self {
        self.lock_spin_budget = spins;
        self
    }

    pub fn with_object_cache_limit(mut self, limit: usize) -> Self {
        self.object_cache_limit = limit;
        self
    }

    pub fn with_collapse(mut self, collapse: bool, bypass: bool) -> Self {
        self.collapse_allowed = collapse;
        self.bypass_allowed = bypass;
        self
    }

    pub fn with_user_bounds(mut self, min: u64, max: u64) -> Self {
        self.user_min = min;
        self.user_max = max;
        self
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// VM statistics counters
#[derive(Debug, Default)]
pub struct VmStats {
    /// Total faults
    pub faults: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Page-in faults (from pager)
    pub page_in: AtomicU64,
    /// Faults restarted after a failed map verification
    pub retries: AtomicU64,
    /// Shadow objects merged into their parent
    pub collapses: AtomicU64,
    /// Shadow objects skipped over
    pub bypasses: AtomicU64,
    /// Shadow objects created
    pub shadows: AtomicU64,
    /// Page-list continuations aborted by discard
    pub continuation_aborts: AtomicU64,
    /// Persistent objects reactivated from the cache
    pub cache_hits: AtomicU64,
    /// Persistent objects evicted from the cache
    pub cache_evictions: AtomicU64,
}

/// Point-in-time copy of `VmStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub faults: u64,
    pub zero_fill: u64,
    pub cow: u64,
    pub page_in: u64,
    pub retries: u64,
    pub collapses: u64,
    pub bypasses: u64,
    pub shadows: u64,
    pub continuation_aborts: u64,
    pub cache_hits: u64,
    pub cache_evictions: u64,
}

impl VmStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        VmStatsSnapshot {
            faults: get(&self.faults),
            zero_fill: get(&self.zero_fill),
            cow: get(&self.cow),
            page_in: get(&self.page_in),
            retries: get(&self.retries),
            collapses: get(&self.collapses),
            bypasses: get(&self.bypasses),
            shadows: get(&self.shadows),
            continuation_aborts: get(&self.continuation_aborts),
            cache_hits: get(&self.cache_hits),
            cache_evictions: get(&self.cache_evictions),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Everything the VM core needs from its surroundings
pub struct VmContext {
    config: VmConfig,
    sched: Arc<dyn Scheduler>,
    frames: Arc<dyn PageFrameAllocator>,
    pmaps: Arc<dyn PmapDomain>,
    objects: ObjectManager,
    stats: VmStats,
}

impl VmContext {
    pub fn new(
        config: VmConfig,
        sched: Arc<dyn Scheduler>,
        frames: Arc<dyn PageFrameAllocator>,
        pmaps: Arc<dyn PmapDomain>,
    ) -> Arc<Self> {
        let cache_limit = config.object_cache_limit;
        Arc::new(Self {
            config,
            sched,
            frames,
            pmaps,
            objects: ObjectManager::new(cache_limit),
            stats: VmStats::default(),
        })
    }

    /// Context over host threads, heap frames and software pmaps
    #[cfg(any(test, feature = "std"))]
    pub fn host(config: VmConfig, frame_capacity: usize) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(crate::kern::sched_prim::HostScheduler::new()),
            Arc::new(FrameTable::new(frame_capacity)),
            Arc::new(SoftPmapDomain::new()),
        )
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    pub fn frames(&self) -> &dyn PageFrameAllocator {
        &*self.frames
    }

    pub fn pmaps(&self) -> &dyn PmapDomain {
        &*self.pmaps
    }

    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }
}

// ============================================================================
// Global State
// ============================================================================

static VM_CONTEXT: spin::Once<Arc<VmContext>> = spin::Once::new();

/// Install the global VM context. Later calls keep the first context.
pub fn init(ctx: Arc<VmContext>) -> &'static Arc<VmContext> {
    let installed = VM_CONTEXT.call_once(|| ctx);
    log::debug!("mach_vm: context installed");
    installed
}

/// The global VM context, if `init` ran
pub fn context() -> Option<&'static Arc<VmContext>> {
    VM_CONTEXT.get()
}
