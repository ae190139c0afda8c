//! Property tests for address map and object bookkeeping
//!
//! Random operation sequences are applied to a map (or an object) and the
//! structural invariants are checked after every step.

use std::collections::BTreeSet;
use std::sync::Arc;

use mach_r_vm::mach_vm::{
    EnterFlags, EntryAttributes, VmConfig, VmContext, VmInherit, VmMap, VmObject, VmProt, PAGE_SIZE,
};
use proptest::prelude::*;

const PAGE: u64 = PAGE_SIZE as u64;
const MAP_MIN: u64 = 0x1000;
const MAP_PAGES: u64 = 64;

// ════════════════════════════════════════════════════════════
// Strategies
// ════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum MapOp {
    Enter { page: u64, pages: u64, prot: VmProt, max: VmProt, anywhere: bool },
    Remove { page: u64, pages: u64 },
    Protect { page: u64, pages: u64, prot: VmProt, set_max: bool },
    Inherit { page: u64, pages: u64, inheritance: VmInherit },
    Fork,
}

fn protection() -> impl Strategy<Value = VmProt> {
    (0u32..8).prop_map(VmProt::from_bits_truncate)
}

fn inheritance() -> impl Strategy<Value = VmInherit> {
    prop_oneof![Just(VmInherit::Share), Just(VmInherit::Copy), Just(VmInherit::None)]
}

fn map_op() -> impl Strategy<Value = MapOp> {
    let page = 0..MAP_PAGES + 2;
    let pages = 1u64..9;
    prop_oneof![
        4 => (page.clone(), pages.clone(), protection(), protection(), any::<bool>()).prop_map(
            |(page, pages, prot, max, anywhere)| MapOp::Enter { page, pages, prot, max, anywhere }
        ),
        2 => (page.clone(), pages.clone()).prop_map(|(page, pages)| MapOp::Remove { page, pages }),
        2 => (page.clone(), pages.clone(), protection(), any::<bool>())
            .prop_map(|(page, pages, prot, set_max)| MapOp::Protect { page, pages, prot, set_max }),
        1 => (page, pages, inheritance())
            .prop_map(|(page, pages, inheritance)| MapOp::Inherit { page, pages, inheritance }),
        1 => Just(MapOp::Fork),
    ]
}

#[derive(Debug, Clone)]
enum PageOp {
    Insert(u64),
    RemoveRange(u64, u64),
}

fn page_op() -> impl Strategy<Value = PageOp> {
    prop_oneof![
        3 => (0u64..32).prop_map(PageOp::Insert),
        1 => (0u64..32, 1u64..8).prop_map(|(start, len)| PageOp::RemoveRange(start, len)),
    ]
}

// ════════════════════════════════════════════════════════════
// Invariant checks
// ════════════════════════════════════════════════════════════

fn check_map(map: &VmMap) {
    let mut last_end = map.min_offset();
    let mut total = 0;
    map.for_each_entry(|entry| {
        assert!(entry.start < entry.end, "empty entry at {:#x}", entry.start);
        assert!(entry.start >= last_end, "entry {:#x} overlaps or is out of order", entry.start);
        assert!(entry.end <= map.max_offset());
        assert!(
            entry.max_protection.contains(entry.protection),
            "protection {:?} exceeds max {:?}",
            entry.protection,
            entry.max_protection
        );
        total += entry.size();
        last_end = entry.end;
    });
    assert_eq!(total, map.size());
}

fn apply(map: &Arc<VmMap>, op: &MapOp, forks: &mut Vec<Arc<VmMap>>) {
    let addr = |page: u64| MAP_MIN + page * PAGE;
    match *op {
        MapOp::Enter { page, pages, prot, max, anywhere } => {
            let flags = if anywhere { EnterFlags::ANYWHERE } else { EnterFlags::empty() };
            let attrs = EntryAttributes::new(prot, max, VmInherit::Copy);
            let _ = map.enter(addr(page), pages * PAGE, 0, flags, None, 0, false, attrs);
        }
        MapOp::Remove { page, pages } => {
            let _ = map.remove(addr(page), addr(page + pages));
        }
        MapOp::Protect { page, pages, prot, set_max } => {
            let _ = map.protect(addr(page), addr(page + pages), prot, set_max);
        }
        MapOp::Inherit { page, pages, inheritance } => {
            let _ = map.inherit(addr(page), addr(page + pages), inheritance);
        }
        MapOp::Fork => {
            if let Ok(child) = map.fork() {
                forks.push(child);
            }
        }
    }
}

// ════════════════════════════════════════════════════════════
// Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Entries stay ordered, disjoint and within their max protection
    #[test]
    fn map_entries_stay_ordered(ops in prop::collection::vec(map_op(), 1..40)) {
        let ctx = VmContext::host(VmConfig::default(), 8);
        let map = VmMap::create(&ctx, MAP_MIN, MAP_MIN + MAP_PAGES * PAGE).unwrap();
        let mut forks = Vec::new();
        for op in &ops {
            apply(&map, op, &mut forks);
            check_map(&map);
            for child in &forks {
                check_map(child);
            }
        }
    }

    /// Resident page count matches the pages actually present
    #[test]
    fn resident_count_matches_pages(ops in prop::collection::vec(page_op(), 1..60)) {
        let ctx = VmContext::host(VmConfig::default(), 64);
        let object = VmObject::allocate(&ctx, 32 * PAGE).unwrap();
        let mut model = BTreeSet::new();
        for op in &ops {
            match *op {
                PageOp::Insert(page) => {
                    if model.insert(page) {
                        let frame = ctx.frames().alloc().unwrap();
                        object.page_insert(page * PAGE, frame);
                    }
                }
                PageOp::RemoveRange(start, len) => {
                    let removed = object.page_remove_range(start * PAGE, (start + len) * PAGE);
                    let expected = model.range(start..start + len).count();
                    prop_assert_eq!(removed, expected);
                    model.retain(|p| *p < start || *p >= start + len);
                }
            }
            prop_assert_eq!(object.resident_page_count(), model.len());
            prop_assert_eq!(ctx.frames().allocated(), model.len());
            for page in 0..32 {
                prop_assert_eq!(object.page_lookup(page * PAGE).is_some(), model.contains(&page));
            }
        }
    }
}
