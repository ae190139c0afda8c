//! Physical Map (pmap) - Hardware Page Table Interface
//!
//! Based on Mach4 vm/pmap.h
//!
//! The VM core never touches page tables itself. It drives them through
//! two traits:
//!
//! - `Pmap`: one per address map; `enter`, `remove`, `protect`, `extract`
//! - `PmapDomain`: the machine-wide side, creating pmaps and answering
//!   per-physical-page questions (`page_protect`, `is_modified`,
//!   `is_referenced`)
//!
//! `SoftPmapDomain` implements both in software: a mapping table per pmap
//! and modify/reference bits per frame.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::lock::SimpleLock;
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{trunc_page, PhysAddr, PAGE_SIZE};

// ============================================================================
// Pmap ID
// ============================================================================

/// Pmap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(pub u64);

impl PmapId {
    pub const NULL: Self = Self(0);
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Per-address-space physical map
pub trait Pmap: Send + Sync {
    fn id(&self) -> PmapId;

    /// Install a translation for the page containing `va`
    fn enter(&self, va: u64, pa: PhysAddr, prot: VmProt, wired: bool);

    /// Remove translations in `[start, end)`
    fn remove(&self, start: u64, end: u64);

    /// Reduce protection in `[start, end)`; `VmProt::NONE` removes
    fn protect(&self, start: u64, end: u64, prot: VmProt);

    /// Physical page and protection for `va`, if mapped
    fn extract(&self, va: u64) -> Option<(PhysAddr, VmProt)>;

    /// Number of translations installed
    fn resident_count(&self) -> usize;
}

/// Machine-wide physical map operations
pub trait PmapDomain: Send + Sync {
    /// Create an empty pmap for a new address map
    fn create(&self) -> Arc<dyn Pmap>;

    /// Lower the protection of every translation of `pa`
    fn page_protect(&self, pa: PhysAddr, prot: VmProt);

    fn is_modified(&self, pa: PhysAddr) -> bool;

    fn is_referenced(&self, pa: PhysAddr) -> bool;

    fn clear_modify(&self, pa: PhysAddr);

    fn clear_reference(&self, pa: PhysAddr);
}

// ============================================================================
// Software pmap
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Translation {
    pa: PhysAddr,
    prot: VmProt,
    wired: bool,
}

#[derive(Default)]
struct DomainState {
    pmaps: Vec<Weak<SoftPmap>>,
    modified: BTreeSet<PhysAddr>,
    referenced: BTreeSet<PhysAddr>,
}

struct DomainShared {
    state: SimpleLock<DomainState>,
    next_id: AtomicU64,
}

/// Software physical map domain
pub struct SoftPmapDomain {
    shared: Arc<DomainShared>,
}

impl SoftPmapDomain {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DomainShared {
                state: SimpleLock::new(DomainState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Record a hardware access to `pa` (what an MMU would do)
    pub fn touch(&self, pa: PhysAddr, write: bool) {
        let mut state = self.shared.state.lock();
        state.referenced.insert(pa);
        if write {
            state.modified.insert(pa);
        }
    }

    fn live_pmaps(&self) -> Vec<Arc<SoftPmap>> {
        let mut state = self.shared.state.lock();
        state.pmaps.retain(|p| p.strong_count() > 0);
        state.pmaps.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Default for SoftPmapDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl PmapDomain for SoftPmapDomain {
    fn create(&self) -> Arc<dyn Pmap> {
        let pmap = Arc::new(SoftPmap {
            id: PmapId(self.shared.next_id.fetch_add(1, Ordering::Relaxed)),
            mappings: SimpleLock::new(BTreeMap::new()),
        });
        self.shared.state.lock().pmaps.push(Arc::downgrade(&pmap));
        pmap
    }

    fn page_protect(&self, pa: PhysAddr, prot: VmProt) {
        for pmap in self.live_pmaps() {
            let mut mappings = pmap.mappings.lock();
            if prot.is_empty() {
                mappings.retain(|_, t| t.pa != pa);
            } else {
                for t in mappings.values_mut().filter(|t| t.pa == pa) {
                    t.prot &= prot;
                }
            }
        }
    }

    fn is_modified(&self, pa: PhysAddr) -> bool {
        self.shared.state.lock().modified.contains(&pa)
    }

    fn is_referenced(&self, pa: PhysAddr) -> bool {
        self.shared.state.lock().referenced.contains(&pa)
    }

    fn clear_modify(&self, pa: PhysAddr) {
        self.shared.state.lock().modified.remove(&pa);
    }

    fn clear_reference(&self, pa: PhysAddr) {
        self.shared.state.lock().referenced.remove(&pa);
    }
}

/// Software pmap: a table of page translations
pub struct SoftPmap {
    id: PmapId,
    mappings: SimpleLock<BTreeMap<u64, Translation>>,
}

impl Pmap for SoftPmap {
    fn id(&self) -> PmapId {
        self.id
    }

    fn enter(&self, va: u64, pa: PhysAddr, prot: VmProt, wired: bool) {
        self.mappings.lock().insert(
            trunc_page(va),
            Translation {
                pa: trunc_page(pa),
                prot,
                wired,
            },
        );
    }

    fn remove(&self, start: u64, end: u64) {
        let mut mappings = self.mappings.lock();
        let doomed: Vec<u64> = mappings.range(start..end).map(|(&va, _)| va).collect();
        for va in doomed {
            mappings.remove(&va);
        }
    }

    fn protect(&self, start: u64, end: u64, prot: VmProt) {
        if prot.is_empty() {
            self.remove(start, end);
            return;
        }
        for (_, t) in self.mappings.lock().range_mut(start..end) {
            t.prot &= prot;
        }
    }

    fn extract(&self, va: u64) -> Option<(PhysAddr, VmProt)> {
        let offset = va & (PAGE_SIZE as u64 - 1);
        self.mappings
            .lock()
            .get(&trunc_page(va))
            .map(|t| (t.pa + offset, t.prot))
    }

    fn resident_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

impl SoftPmap {
    /// Number of wired translations
    pub fn wired_count(&self) -> usize {
        self.mappings.lock().values().filter(|t| t.wired).count()
    }
}
