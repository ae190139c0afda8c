//! External Memory Objects
//!
//! Based on Mach4 mach/memory_object.h by Michael Wayne Young
//!
//! External memory management (EMM) allows user-space "pagers" to
//! provide the backing store for memory objects.
//!
//! The memory object protocol, as the VM core uses it:
//! 1. Kernel sends `init` to the pager when the object is created
//! 2. Pager replies with `VmObject::set_ready` (the set_attributes reply)
//! 3. On page fault, kernel sends `data_request`
//! 4. Pager replies with `data_supply`, `data_unavailable` or `data_error`
//! 5. On clean or termination, kernel sends `data_write`
//! 6. Kernel sends `terminate` when the object is destroyed
//!
//! Replies are never assumed to be synchronous: the faulting thread sleeps
//! on the page until one arrives.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::lock::SimpleLock;
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_object::{CopyStrategy, VmObjectId};
use crate::mach_vm::vm_page::{trunc_page, PAGE_SIZE};
use crate::mach_vm::VmContext;

// ============================================================================
// Pager identity and attributes
// ============================================================================

/// Identity of a memory manager (the pager port, in Mach terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PagerId(pub u64);

/// Attributes the pager supplies with its ready reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryObjectAttributes {
    /// How copies of this object are made
    pub copy_strategy: CopyStrategy,
    /// May the kernel cache the object after its last reference goes?
    pub may_cache: bool,
}

impl Default for MemoryObjectAttributes {
    fn default() -> Self {
        Self {
            copy_strategy: CopyStrategy::Delay,
            may_cache: true,
        }
    }
}

// ============================================================================
// Memory manager collaborator
// ============================================================================

/// Kernel-to-pager calls
pub trait MemoryManager: Send + Sync {
    fn id(&self) -> PagerId;

    /// First contact for a newly created object
    fn init(&self, object: VmObjectId, page_size: usize);

    /// Ask for the data in `[offset, offset + length)`.
    ///
    /// An `Err` means the pager cannot be reached at all.
    fn data_request(
        &self,
        object: VmObjectId,
        offset: u64,
        length: u64,
        desired_access: VmProt,
    ) -> KernResult<()>;

    /// Hand modified data back to the pager
    fn data_write(&self, object: VmObjectId, offset: u64, data: &[u8]);

    /// The object is gone
    fn terminate(&self, object: VmObjectId);
}

// ============================================================================
// In-memory pager
// ============================================================================

/// When an `InMemoryPager` answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Reply from inside the request
    Immediate,
    /// Queue requests until `reply_pending`
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingReply {
    Ready(VmObjectId),
    Data {
        object: VmObjectId,
        offset: u64,
        length: u64,
    },
}

#[derive(Default)]
struct PagerStore {
    pages: BTreeMap<u64, Vec<u8>>,
    errors: BTreeSet<u64>,
    pending: VecDeque<PendingReply>,
    writes: u64,
}

/// Pager keeping its backing store in memory, for hosts and tests
pub struct InMemoryPager {
    id: PagerId,
    ctx: Weak<VmContext>,
    mode: ReplyMode,
    attributes: MemoryObjectAttributes,
    store: SimpleLock<PagerStore>,
    requests: AtomicU64,
    dead: AtomicBool,
    terminated: AtomicBool,
}

static NEXT_PAGER: AtomicU64 = AtomicU64::new(1);

impl InMemoryPager {
    pub fn new(ctx: &Arc<VmContext>, mode: ReplyMode, attributes: MemoryObjectAttributes) -> Arc<Self> {
        Arc::new(Self {
            id: PagerId(NEXT_PAGER.fetch_add(1, Ordering::Relaxed)),
            ctx: Arc::downgrade(ctx),
            mode,
            attributes,
            store: SimpleLock::new(PagerStore::default()),
            requests: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    /// Preload backing data for the page at `offset`
    pub fn set_page(&self, offset: u64, data: &[u8]) {
        let mut page = data.to_vec();
        page.resize(PAGE_SIZE, 0);
        self.store.lock().pages.insert(trunc_page(offset), page);
    }

    /// Backing data currently held for `offset`
    pub fn page(&self, offset: u64) -> Option<Vec<u8>> {
        self.store.lock().pages.get(&trunc_page(offset)).cloned()
    }

    /// Answer requests for `offset` with an error
    pub fn fail_offset(&self, offset: u64) {
        self.store.lock().errors.insert(trunc_page(offset));
    }

    /// Stop answering; later requests fail as unreachable
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.store.lock().pending.len()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.store.lock().writes
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Deliver every queued reply; returns how many were delivered
    pub fn reply_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.store.lock().pending.pop_front();
            match next {
                Some(reply) => {
                    self.deliver(reply);
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }

    fn deliver(&self, reply: PendingReply) {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        match reply {
            PendingReply::Ready(id) => {
                if let Some(object) = ctx.objects().get(id) {
                    object.set_ready(self.attributes);
                }
            }
            PendingReply::Data { object, offset, length } => {
                let object = match ctx.objects().get(object) {
                    Some(object) => object,
                    None => {
                        log::warn!("pager {:?}: reply for vanished object", self.id);
                        return;
                    }
                };
                let mut cur = offset;
                while cur < offset + length {
                    let (failed, data) = {
                        let store = self.store.lock();
                        (store.errors.contains(&cur), store.pages.get(&cur).cloned())
                    };
                    let result = if failed {
                        object.data_error(cur, PAGE_SIZE as u64);
                        Ok(())
                    } else if let Some(data) = data {
                        object.data_supply(cur, &data, false)
                    } else {
                        object.data_unavailable(cur, PAGE_SIZE as u64);
                        Ok(())
                    };
                    if let Err(err) = result {
                        log::warn!("pager {:?}: supply at {:#x} failed: {}", self.id, cur, err);
                        object.data_error(cur, PAGE_SIZE as u64);
                    }
                    cur += PAGE_SIZE as u64;
                }
            }
        }
    }

    fn post(&self, reply: PendingReply) {
        match self.mode {
            ReplyMode::Immediate => self.deliver(reply),
            ReplyMode::Deferred => self.store.lock().pending.push_back(reply),
        }
    }
}

impl MemoryManager for InMemoryPager {
    fn id(&self) -> PagerId {
        self.id
    }

    fn init(&self, object: VmObjectId, _page_size: usize) {
        self.post(PendingReply::Ready(object));
    }

    fn data_request(
        &self,
        object: VmObjectId,
        offset: u64,
        length: u64,
        _desired_access: VmProt,
    ) -> KernResult<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(KernError::MemoryFailure);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.post(PendingReply::Data { object, offset, length });
        Ok(())
    }

    fn data_write(&self, _object: VmObjectId, offset: u64, data: &[u8]) {
        let mut store = self.store.lock();
        store.pages.insert(trunc_page(offset), data.to_vec());
        store.writes += 1;
    }

    fn terminate(&self, _object: VmObjectId) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::VmConfig;

    #[test]
    fn test_default_attributes() {
        let attrs = MemoryObjectAttributes::default();
        assert_eq!(attrs.copy_strategy, CopyStrategy::Delay);
        assert!(attrs.may_cache);
    }

    #[test]
    fn test_store_and_write_back() {
        let ctx = VmContext::host(VmConfig::default(), 4);
        let pager = InMemoryPager::new(&ctx, ReplyMode::Deferred, MemoryObjectAttributes::default());
        pager.set_page(0x1000, b"abc");
        let page = pager.page(0x1000).unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(&page[..3], b"abc");

        pager.data_write(VmObjectId::NULL, 0x2000, &[7u8; PAGE_SIZE]);
        assert_eq!(pager.writes(), 1);
        assert_eq!(pager.page(0x2000).unwrap()[0], 7);
    }

    #[test]
    fn test_deferred_requests_queue_until_replied() {
        let ctx = VmContext::host(VmConfig::default(), 4);
        let pager = InMemoryPager::new(&ctx, ReplyMode::Deferred, MemoryObjectAttributes::default());
        pager
            .data_request(VmObjectId::NULL, 0, PAGE_SIZE as u64, VmProt::READ)
            .unwrap();
        assert_eq!(pager.pending(), 1);
        assert_eq!(pager.requests(), 1);
        // No such object: the reply is dropped, not delivered anywhere
        assert_eq!(pager.reply_pending(), 1);
        assert_eq!(pager.pending(), 0);
    }

    #[test]
    fn test_dead_pager_is_unreachable() {
        let ctx = VmContext::host(VmConfig::default(), 4);
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        pager.kill();
        assert_eq!(
            pager.data_request(VmObjectId::NULL, 0, PAGE_SIZE as u64, VmProt::READ),
            Err(KernError::MemoryFailure)
        );
    }
}
