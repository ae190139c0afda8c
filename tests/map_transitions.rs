//! Entries in transition while a wiring waits on its pager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mach_r_vm::kern::HostScheduler;
use mach_r_vm::mach_vm::vm_user::vm_write;
use mach_r_vm::mach_vm::{
    EnterFlags, EntryAttributes, FrameTable, InMemoryPager, MemoryObjectAttributes, ReplyMode, SoftPmapDomain,
    VmConfig, VmContext, VmInherit, VmMap, VmObject, VmProt, PAGE_SIZE,
};

const PAGE: u64 = PAGE_SIZE as u64;
const PAGED: u64 = 0x10_0000;
const ANON: u64 = 0x20_0000;

fn context() -> Arc<VmContext> {
    VmContext::new(
        VmConfig::default(),
        Arc::new(HostScheduler::new()),
        Arc::new(FrameTable::new(64)),
        Arc::new(SoftPmapDomain::new()),
    )
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryState {
    in_transition: bool,
    needs_wakeup: bool,
    wired_count: u32,
}

fn entry_at(map: &VmMap, addr: u64) -> Option<EntryState> {
    let mut found = None;
    map.for_each_entry(|entry| {
        if entry.contains(addr) {
            found = Some(EntryState {
                in_transition: entry.in_transition,
                needs_wakeup: entry.needs_wakeup,
                wired_count: entry.wired_count,
            });
        }
    });
    found
}

/// Map with one page backed by a deferred pager at `PAGED` and one
/// anonymous page at `ANON`
fn setup(ctx: &Arc<VmContext>) -> (Arc<VmMap>, Arc<InMemoryPager>) {
    let map = VmMap::create(ctx, 0x1000, 0x100_0000).unwrap();
    let pager = InMemoryPager::new(ctx, ReplyMode::Deferred, MemoryObjectAttributes::default());
    pager.set_page(0, b"paged in");
    let object = VmObject::enter_pager(ctx, pager.clone(), PAGE).unwrap();
    assert_eq!(pager.reply_pending(), 1);

    let read_only = EntryAttributes::new(VmProt::READ, VmProt::ALL, VmInherit::Copy);
    map.enter(PAGED, PAGE, 0, EnterFlags::empty(), Some(object), 0, false, read_only)
        .unwrap();
    map.enter(ANON, PAGE, 0, EnterFlags::empty(), None, 0, false, EntryAttributes::default())
        .unwrap();
    (map, pager)
}

#[test]
fn remove_waits_for_wiring_and_other_faults_proceed() {
    let ctx = context();
    let (map, pager) = setup(&ctx);

    let wirer = {
        let map = Arc::clone(&map);
        thread::spawn(move || map.wire(PAGED, PAGED + PAGE, VmProt::READ, false))
    };
    wait_until("the page-in request", || pager.pending() == 1);
    let state = entry_at(&map, PAGED).unwrap();
    assert!(state.in_transition);
    assert_eq!(state.wired_count, 1);

    // The map stays usable while the pager sits on the request
    assert_eq!(vm_write(&map, ANON, b"elsewhere"), 0);
    map.protect(ANON, ANON + PAGE, VmProt::READ, false).unwrap();

    let removed = Arc::new(AtomicBool::new(false));
    let remover = {
        let map = Arc::clone(&map);
        let removed = Arc::clone(&removed);
        thread::spawn(move || {
            let result = map.remove(PAGED, PAGED + PAGE);
            removed.store(true, Ordering::SeqCst);
            result
        })
    };
    wait_until("remove to park on the entry", || {
        entry_at(&map, PAGED).is_some_and(|state| state.needs_wakeup)
    });
    thread::sleep(Duration::from_millis(20));
    assert!(!removed.load(Ordering::SeqCst), "remove went ahead of the wiring");
    assert!(entry_at(&map, PAGED).is_some());

    assert_eq!(pager.reply_pending(), 1);
    assert_eq!(wirer.join().unwrap(), Ok(()));
    assert_eq!(remover.join().unwrap(), Ok(()));
    assert!(entry_at(&map, PAGED).is_none());
    assert_eq!(map.entry_count(), 1);
}

#[test]
fn wiring_settles_the_entry() {
    let ctx = context();
    let (map, pager) = setup(&ctx);

    let wirer = {
        let map = Arc::clone(&map);
        thread::spawn(move || map.wire(PAGED, PAGED + PAGE, VmProt::READ, false))
    };
    wait_until("the page-in request", || pager.pending() == 1);
    assert_eq!(pager.reply_pending(), 1);
    assert_eq!(wirer.join().unwrap(), Ok(()));

    let state = entry_at(&map, PAGED).unwrap();
    assert!(!state.in_transition);
    assert!(!state.needs_wakeup);
    assert_eq!(state.wired_count, 1);
    assert!(map.pmap().extract(PAGED).is_some());
    map.unwire(PAGED, PAGED + PAGE, false).unwrap();
    assert_eq!(entry_at(&map, PAGED).unwrap().wired_count, 0);
}

#[test]
fn failed_page_in_unwinds_the_wiring() {
    let ctx = context();
    let (map, pager) = setup(&ctx);
    pager.fail_offset(0);

    let wirer = {
        let map = Arc::clone(&map);
        thread::spawn(move || map.wire(PAGED, PAGED + PAGE, VmProt::READ, false))
    };
    wait_until("the page-in request", || pager.pending() == 1);
    assert_eq!(pager.reply_pending(), 1);
    assert!(wirer.join().unwrap().is_err());

    let state = entry_at(&map, PAGED).unwrap();
    assert_eq!(state, EntryState { in_transition: false, needs_wakeup: false, wired_count: 0 });
    map.remove(PAGED, PAGED + PAGE).unwrap();
}
