//! VM User Interface - Mach VM System Calls
//!
//! Based on Mach4 vm/vm_user.c
//!
//! These are the calls a task makes on an address map. Each one validates
//! its arguments, runs the map operation and flattens the outcome into a
//! `KernReturn`.
//!
//! ## Key Operations
//!
//! - `vm_allocate`: Allocate zero-filled memory
//! - `vm_deallocate`: Release memory
//! - `vm_protect`: Change memory protection
//! - `vm_inherit`: Set inheritance on fork
//! - `vm_read`: Copy memory out of a map
//! - `vm_write`: Copy data over existing memory
//! - `vm_copy`: Copy memory within a map
//! - `vm_wire`: Wire or unwire memory
//! - `vm_clean`: Push modified pages back to their pager
//! - `vm_region`: Query information about a memory region

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::trace;

use crate::kern::kern_return::{kern_return, KernError, KernResult, KernReturn, KERN_SUCCESS};
use crate::mach_vm::vm_debug::{region_info, RegionInfo};
use crate::mach_vm::vm_map::{EnterFlags, EntryAttributes, VmInherit, VmMap, VmProt};
use crate::mach_vm::vm_map_copy::VmMapCopy;
use crate::mach_vm::vm_page::{checked_round_page, trunc_page};

/// Page-aligned `[start, end)` covering `size` bytes at `address`
fn page_bounds(address: u64, size: u64) -> KernResult<(u64, u64)> {
    let end = address.checked_add(size).ok_or(KernError::InvalidArgument)?;
    let end = checked_round_page(end).ok_or(KernError::InvalidArgument)?;
    Ok((trunc_page(address), end))
}

// ============================================================================
// VM Allocate / Deallocate
// ============================================================================

/// Allocate zero-filled memory in `target_map`
///
/// With `anywhere` the address is only a hint and the chosen address is
/// stored back; otherwise the memory goes at `*address` (rounded down).
pub fn vm_allocate(target_map: &Arc<VmMap>, address: &mut u64, size: u64, anywhere: bool) -> KernReturn {
    if size == 0 {
        *address = 0;
        return KERN_SUCCESS;
    }
    let (start, end) = match page_bounds(*address, size) {
        Ok(bounds) => bounds,
        Err(err) => return err.into(),
    };
    let flags = if anywhere { EnterFlags::ANYWHERE } else { EnterFlags::empty() };
    match target_map.enter(start, end - start, 0, flags, None, 0, false, EntryAttributes::default()) {
        Ok(addr) => {
            trace!("vm_allocate: {:?} [{:#x}, {:#x})", target_map.id(), addr, addr + (end - start));
            *address = addr;
            KERN_SUCCESS
        }
        Err(err) => err.into(),
    }
}

/// Release `[address, address + size)`; unmapped parts are ignored
pub fn vm_deallocate(target_map: &Arc<VmMap>, address: u64, size: u64) -> KernReturn {
    if size == 0 {
        return KERN_SUCCESS;
    }
    kern_return(page_bounds(address, size).and_then(|(start, end)| target_map.remove(start, end)))
}

// ============================================================================
// Attributes
// ============================================================================

/// Change the protection of a range; `set_maximum` changes the ceiling
pub fn vm_protect(
    target_map: &Arc<VmMap>,
    address: u64,
    size: u64,
    set_maximum: bool,
    new_protection: VmProt,
) -> KernReturn {
    if new_protection.bits() & !VmProt::ALL.bits() != 0 {
        return KernError::InvalidArgument.into();
    }
    kern_return(
        page_bounds(address, size)
            .and_then(|(start, end)| target_map.protect(start, end, new_protection, set_maximum)),
    )
}

/// Set the fork inheritance of a range
pub fn vm_inherit(target_map: &Arc<VmMap>, address: u64, size: u64, new_inheritance: VmInherit) -> KernReturn {
    kern_return(page_bounds(address, size).and_then(|(start, end)| target_map.inherit(start, end, new_inheritance)))
}

// ============================================================================
// Data transfer
// ============================================================================

/// Read `size` bytes at `address` into `data`
pub fn vm_read(target_map: &Arc<VmMap>, address: u64, size: u64, data: &mut Vec<u8>) -> KernReturn {
    data.clear();
    if size == 0 {
        return KERN_SUCCESS;
    }
    let result = target_map
        .copyin_page_list(address, size, false)
        .and_then(|copy| copy.read_into(data));
    if result.is_err() {
        data.clear();
    }
    kern_return(result)
}

/// Write `data` over the memory at `address`, which must be mapped writable
pub fn vm_write(target_map: &Arc<VmMap>, address: u64, data: &[u8]) -> KernReturn {
    if data.is_empty() {
        return KERN_SUCCESS;
    }
    kern_return(
        VmMapCopy::from_bytes(target_map.context(), data)
            .and_then(|copy| target_map.copy_overwrite(address, data.len() as u64, copy, true)),
    )
}

/// Copy `size` bytes from `source_address` over `dest_address`
pub fn vm_copy(target_map: &Arc<VmMap>, source_address: u64, size: u64, dest_address: u64) -> KernReturn {
    if size == 0 {
        return KERN_SUCCESS;
    }
    kern_return(
        target_map
            .copyin(source_address, size, false)
            .and_then(|copy| target_map.copy_overwrite(dest_address, size, copy, true)),
    )
}

// ============================================================================
// VM Wire
// ============================================================================

/// Wire a range for `access`, or unwire it when `access` is empty.
///
/// These are user wirings: they nest, and each needs its own unwire.
pub fn vm_wire(target_map: &Arc<VmMap>, address: u64, size: u64, access: VmProt) -> KernReturn {
    if size == 0 {
        return KERN_SUCCESS;
    }
    kern_return(page_bounds(address, size).and_then(|(start, end)| {
        if access.is_empty() {
            target_map.unwire(start, end, true)
        } else {
            target_map.wire(start, end, access, true)
        }
    }))
}

// ============================================================================
// VM Clean
// ============================================================================

/// Write modified pages in a range back to their pagers
pub fn vm_clean(target_map: &Arc<VmMap>, address: u64, size: u64) -> KernReturn {
    if size == 0 {
        return KERN_SUCCESS;
    }
    let (start, end) = match page_bounds(address, size) {
        Ok(bounds) => bounds,
        Err(err) => return err.into(),
    };

    // Snapshot the objects first; pagers are never called under the map lock
    let mut targets = Vec::new();
    {
        let guard = target_map.lock_read();
        if guard.has_hole(start, end) {
            return KernError::InvalidAddress.into();
        }
        for key in guard.keys_in(start, end) {
            let entry = &guard.entries[&key];
            let object = match entry.object() {
                Some(object) => object.clone(),
                None => continue,
            };
            let lo = start.max(entry.start);
            let hi = end.min(entry.end);
            targets.push((object, entry.offset + (lo - entry.start), hi - lo));
        }
    }

    for (object, offset, length) in &targets {
        if let Err(err) = object.clean(*offset, *length) {
            return err.into();
        }
    }
    KERN_SUCCESS
}

// ============================================================================
// VM Region
// ============================================================================

/// Describe the region containing `*address`, or the next one above it.
/// `*address` is moved to the start of the region found.
pub fn vm_region(target_map: &Arc<VmMap>, address: &mut u64) -> Result<RegionInfo, KernReturn> {
    let info = region_info(target_map, *address).map_err(KernReturn::from)?;
    *address = info.start;
    Ok(info)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::kern_return::{
        KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_MEMORY_PRESENT, KERN_PROTECTION_FAILURE,
    };
    use crate::mach_vm::memory_object::{InMemoryPager, MemoryObjectAttributes, ReplyMode};
    use crate::mach_vm::vm_object::VmObject;
    use crate::mach_vm::vm_page::PAGE_SIZE;
    use crate::mach_vm::{VmConfig, VmContext};

    fn map() -> Arc<VmMap> {
        let ctx = VmContext::host(VmConfig::default(), 32);
        VmMap::create(&ctx, 0x1000, 0x1000_0000).unwrap()
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let map = map();
        let mut addr = 0x5000;
        assert_eq!(vm_allocate(&map, &mut addr, 0x1800, false), KERN_SUCCESS);
        assert_eq!(addr, 0x5000);
        assert_eq!(map.size(), 0x2000);

        let mut again = 0x5000;
        assert_eq!(vm_allocate(&map, &mut again, 0x1000, false), KERN_MEMORY_PRESENT);
        assert_eq!(vm_allocate(&map, &mut again, 0x1000, true), KERN_SUCCESS);
        assert_ne!(again, 0x5000);

        let mut none = 0x1234;
        assert_eq!(vm_allocate(&map, &mut none, 0, true), KERN_SUCCESS);
        assert_eq!(none, 0);

        assert_eq!(vm_deallocate(&map, 0x5000, 0x2000), KERN_SUCCESS);
        assert_eq!(map.size(), 0x1000);
        assert_eq!(vm_deallocate(&map, 0x5000, 0), KERN_SUCCESS);
    }

    #[test]
    fn test_read_write_copy() {
        let map = map();
        let mut addr = 0;
        assert_eq!(vm_allocate(&map, &mut addr, 4 * PAGE_SIZE as u64, true), KERN_SUCCESS);
        assert_eq!(vm_write(&map, addr + 10, b"mach"), KERN_SUCCESS);

        let mut data = Vec::new();
        assert_eq!(vm_read(&map, addr + 8, 8, &mut data), KERN_SUCCESS);
        assert_eq!(data, [0, 0, b'm', b'a', b'c', b'h', 0, 0]);

        let page = PAGE_SIZE as u64;
        assert_eq!(vm_copy(&map, addr, page, addr + 2 * page), KERN_SUCCESS);
        assert_eq!(vm_read(&map, addr + 2 * page + 10, 4, &mut data), KERN_SUCCESS);
        assert_eq!(data, b"mach");

        assert_eq!(vm_read(&map, 0x900_0000, 4, &mut data), KERN_INVALID_ADDRESS);
        assert!(data.is_empty());
    }

    #[test]
    fn test_protect_and_inherit() {
        let map = map();
        let mut addr = 0;
        assert_eq!(vm_allocate(&map, &mut addr, 0x2000, true), KERN_SUCCESS);
        assert_eq!(vm_protect(&map, addr, 0x1000, false, VmProt::READ), KERN_SUCCESS);
        assert_eq!(vm_write(&map, addr, b"x"), KERN_PROTECTION_FAILURE);
        assert_eq!(vm_write(&map, addr + 0x1000, b"x"), KERN_SUCCESS);

        assert_eq!(vm_protect(&map, addr, 0x1000, true, VmProt::READ), KERN_SUCCESS);
        assert_eq!(vm_protect(&map, addr, 0x1000, false, VmProt::DEFAULT), KERN_PROTECTION_FAILURE);
        assert_eq!(
            vm_protect(&map, addr, 0x1000, false, VmProt::from_bits_retain(0x10)),
            KERN_INVALID_ARGUMENT
        );

        assert_eq!(vm_inherit(&map, addr, 0x2000, VmInherit::None), KERN_SUCCESS);
        let child = map.fork().unwrap();
        assert_eq!(child.entry_count(), 0);
    }

    #[test]
    fn test_wire_and_unwire() {
        let map = map();
        let mut addr = 0;
        assert_eq!(vm_allocate(&map, &mut addr, 0x2000, true), KERN_SUCCESS);
        assert_eq!(vm_wire(&map, addr, 0x2000, VmProt::READ), KERN_SUCCESS);
        let info = vm_region(&map, &mut addr.clone()).unwrap();
        assert_eq!((info.wired_count, info.user_wired_count), (1, 1));
        assert_eq!(map.resident_count(), 2);

        assert_eq!(vm_wire(&map, addr, 0x2000, VmProt::NONE), KERN_SUCCESS);
        let info = vm_region(&map, &mut addr.clone()).unwrap();
        assert_eq!(info.wired_count, 0);
    }

    #[test]
    fn test_region_moves_address() {
        let map = map();
        let mut addr = 0x8000;
        assert_eq!(vm_allocate(&map, &mut addr, 0x3000, false), KERN_SUCCESS);
        let mut query = 0x2000;
        let info = vm_region(&map, &mut query).unwrap();
        assert_eq!(query, 0x8000);
        assert_eq!(info.size(), 0x3000);
        let mut past = 0xb000;
        assert_eq!(vm_region(&map, &mut past).err(), Some(KERN_INVALID_ADDRESS));
    }

    #[test]
    fn test_clean_writes_back_to_pager() {
        let map = map();
        let ctx = Arc::clone(map.context());
        let pager = InMemoryPager::new(&ctx, ReplyMode::Immediate, MemoryObjectAttributes::default());
        pager.set_page(0, b"before");
        let object = VmObject::enter_pager(&ctx, pager.clone(), 0x1000).unwrap();
        let addr = map
            .enter(0x4000, 0x1000, 0, EnterFlags::empty(), Some(object), 0, false, EntryAttributes::default())
            .unwrap();

        assert_eq!(vm_write(&map, addr, b"after!"), KERN_SUCCESS);
        assert_eq!(vm_clean(&map, addr, 0x1000), KERN_SUCCESS);
        assert_eq!(pager.writes(), 1);
        assert_eq!(&pager.page(0).unwrap()[..6], b"after!");
        assert_eq!(vm_clean(&map, 0x9000, 0x1000), KERN_INVALID_ADDRESS);
    }
}
