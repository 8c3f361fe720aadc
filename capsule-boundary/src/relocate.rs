//! GOT slot rewriting for already-loaded objects
//!
//! Only resolved `JUMP_SLOT` and `GLOB_DAT` relocations are touched, which is
//! where every call or address-of through the PLT/GOT lands once the loader
//! has bound it. Slots on pages the loader made read-only (`PT_GNU_RELRO`)
//! are unprotected for the write and returned to read-only afterwards.
//!
//! Describing objects calls into the loader and patching does not, so callers
//! can take the first step before any lock they hold across the second.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_void};
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::time::SystemTime;

use capsule_core::{AddressRange, BoundaryEvent, Error, Result};
use capsule_namespace::{LinkMapEntry, ObjectSegments, images};
use nix::sys::mman::{ProtFlags, mprotect};
use nix::unistd::{SysconfVar, sysconf};
use tracing::{debug, trace};

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_STRSZ: i64 = 10;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

#[cfg(target_arch = "x86_64")]
const R_GLOB_DAT: u32 = 6;
#[cfg(target_arch = "x86_64")]
const R_JUMP_SLOT: u32 = 7;

#[cfg(target_arch = "aarch64")]
const R_GLOB_DAT: u32 = 1025;
#[cfg(target_arch = "aarch64")]
const R_JUMP_SLOT: u32 = 1026;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const R_GLOB_DAT: u32 = u32::MAX;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const R_JUMP_SLOT: u32 = u32::MAX;

#[repr(C)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct Elf64Rela {
    r_offset: u64,
    r_info: u64,
    r_addend: i64,
}

#[repr(C)]
#[allow(dead_code)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

/// A symbol to point somewhere else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Symbol name as referenced by importing objects
    pub symbol: CString,
    /// New target address
    pub address: usize,
}

impl Redirect {
    /// Create a redirect
    #[must_use]
    pub const fn new(symbol: CString, address: usize) -> Self {
        Self { symbol, address }
    }
}

/// A GOT slot bound to one of the requested symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Address of the slot itself
    pub address: usize,
    /// Index into the redirect list the slot matched
    pub redirect: usize,
}

#[derive(Debug, Default)]
struct DynamicInfo {
    strtab: usize,
    strsz: usize,
    symtab: usize,
    rela: Option<AddressRange>,
    jmprel: Option<AddressRange>,
}

/// Rebase a dynamic-section pointer the loader left unrelocated
const fn absolute(base: usize, ptr: usize) -> usize {
    if ptr < base { base + ptr } else { ptr }
}

/// Parse the dynamic section of an object
///
/// # Safety
/// `dynamic` must be the runtime address of a mapped `DT_NULL`-terminated
/// dynamic section belonging to the object loaded at `base`.
unsafe fn read_dynamic(base: usize, dynamic: usize) -> DynamicInfo {
    let mut info = DynamicInfo::default();
    let mut rela_addr = None;
    let mut rela_size = 0;
    let mut jmprel_addr = None;
    let mut plt_size = 0;
    let mut plt_is_rela = true;

    let mut entry = dynamic as *const Elf64Dyn;
    // SAFETY: caller guarantees a terminated, mapped array.
    unsafe {
        while (*entry).d_tag != DT_NULL {
            let value = (*entry).d_val as usize;
            match (*entry).d_tag {
                DT_STRTAB => info.strtab = absolute(base, value),
                DT_STRSZ => info.strsz = value,
                DT_SYMTAB => info.symtab = absolute(base, value),
                DT_RELA => rela_addr = Some(absolute(base, value)),
                DT_RELASZ => rela_size = value,
                DT_JMPREL => jmprel_addr = Some(absolute(base, value)),
                DT_PLTRELSZ => plt_size = value,
                DT_PLTREL => plt_is_rela = value == DT_RELA as usize,
                _ => {}
            }
            entry = entry.add(1);
        }
    }

    info.rela = rela_addr.map(|start| AddressRange::new(start, start + rela_size));
    if plt_is_rela {
        info.jmprel = jmprel_addr.map(|start| AddressRange::new(start, start + plt_size));
    }
    info
}

/// Program headers of every object `skip` does not reject
///
/// Fails when an object's headers cannot be read, since its read-only pages
/// would then be unknown.
pub fn describe_objects(
    entries: &[LinkMapEntry],
    mut skip: impl FnMut(&LinkMapEntry) -> bool,
) -> Result<Vec<ObjectSegments>> {
    let mut objects = Vec::with_capacity(entries.len());
    for entry in entries {
        if skip(entry) {
            trace!(object = %entry.name, "Relocation skipped");
            continue;
        }
        let segments = images::segments_of(entry).ok_or_else(|| Error::Relocation {
            object: entry.name.clone(),
            message: "cannot read program headers".to_string(),
        })?;
        objects.push(segments);
    }
    Ok(objects)
}

/// Find the GOT slots of one object that refer to any of `redirects`
///
/// # Safety
/// `object` must describe an object that stays mapped for the call.
pub unsafe fn find_slots(object: &ObjectSegments, redirects: &[Redirect]) -> Vec<Slot> {
    let Some(dynamic) = object.dynamic else {
        return Vec::new();
    };
    if redirects.is_empty() {
        return Vec::new();
    }

    let base = object.image.base;
    // SAFETY: PT_DYNAMIC of a mapped object.
    let info = unsafe { read_dynamic(base, dynamic) };
    if info.strtab == 0 || info.symtab == 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    for table in [info.rela, info.jmprel].into_iter().flatten() {
        let count = table.len() / std::mem::size_of::<Elf64Rela>();
        let relocs = table.start as *const Elf64Rela;

        for i in 0..count {
            // SAFETY: `count` entries lie inside the object's relocation table.
            let rela = unsafe { &*relocs.add(i) };
            let kind = (rela.r_info & 0xffff_ffff) as u32;
            if kind != R_JUMP_SLOT && kind != R_GLOB_DAT {
                continue;
            }

            let sym_index = (rela.r_info >> 32) as usize;
            // SAFETY: relocations only index symbols of their own object.
            let sym = unsafe { &*(info.symtab as *const Elf64Sym).add(sym_index) };
            let name_offset = sym.st_name as usize;
            if info.strsz != 0 && name_offset >= info.strsz {
                continue;
            }

            // SAFETY: string table entries are NUL-terminated.
            let name = unsafe { CStr::from_ptr((info.strtab + name_offset) as *const c_char) };
            if let Some(redirect) = redirects.iter().position(|r| r.symbol.as_c_str() == name) {
                slots.push(Slot {
                    address: base.wrapping_add(rela.r_offset as usize),
                    redirect,
                });
            }
        }
    }
    slots
}

fn page_size() -> Result<usize> {
    Ok(sysconf(SysconfVar::PAGE_SIZE)?
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(4096))
}

/// Whether the page holding `slot` is one the loader made read-only
///
/// The loader protects whole pages only: the last, partial page of the RELRO
/// span shares its page with writable data and stays writable.
const fn read_only_page(slot: usize, relro: Option<AddressRange>, page: usize) -> bool {
    let Some(relro) = relro else {
        return false;
    };
    let page_start = slot & !(page - 1);
    let first = relro.start & !(page - 1);
    let end = relro.end & !(page - 1);
    page_start >= first && page_start < end
}

/// Point one slot at `value`
///
/// Returns whether the slot changed.
///
/// # Safety
/// `slot` must be an aligned GOT entry of a mapped object and `value` a valid
/// target for every caller that reads it.
unsafe fn write_slot(slot: usize, value: usize, relro: Option<AddressRange>, page: usize) -> nix::Result<bool> {
    let ptr = slot as *mut usize;
    // SAFETY: caller guarantees the slot is mapped and readable.
    if unsafe { ptr.read_volatile() } == value {
        return Ok(false);
    }

    let protected = read_only_page(slot, relro, page);
    let page_ptr = NonNull::new((slot & !(page - 1)) as *mut c_void).ok_or(nix::Error::EINVAL)?;

    // SAFETY: an aligned slot never straddles pages; the page is returned to
    // read-only straight after the store.
    unsafe {
        if protected {
            mprotect(page_ptr, page, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        }
        ptr.write_volatile(value);
        if protected {
            mprotect(page_ptr, page, ProtFlags::PROT_READ)?;
        }
    }
    Ok(true)
}

/// Rewrite matching GOT slots in `objects`
///
/// Returns the number of slots that changed. Objects already pointing at the
/// requested addresses are left alone, so repeating a pass is harmless.
///
/// # Safety
/// Every redirect address must be ABI-compatible with the symbol it replaces,
/// and `objects` must stay mapped for the call.
pub unsafe fn patch_objects(objects: &[ObjectSegments], redirects: &[Redirect]) -> Result<usize> {
    let page = page_size()?;
    let mut total = 0;

    for object in objects {
        // SAFETY: forwarded caller contract.
        let slots = unsafe { find_slots(object, redirects) };
        if slots.is_empty() {
            continue;
        }

        let name = object.image.display_name();
        let mut changed = 0;
        for slot in &slots {
            let value = redirects[slot.redirect].address;
            // SAFETY: slot found in the object's own relocation table.
            let wrote = unsafe { write_slot(slot.address, value, object.relro, page) }.map_err(|e| {
                Error::Relocation {
                    object: name.to_string(),
                    message: format!("cannot write slot {:#x}: {e}", slot.address),
                }
            })?;
            if wrote {
                changed += 1;
            }
        }

        if changed > 0 {
            BoundaryEvent::SlotsPatched {
                object: name.to_string(),
                slots: changed,
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        }
        total += changed;
    }

    debug!(slots = total, objects = objects.len(), "Relocation pass complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_namespace::dl;

    fn main_object() -> ObjectSegments {
        let handle = dl::main_program().unwrap();
        let entry = dl::link_map_chain(handle).into_iter().next().unwrap();
        images::segments_of(&entry).unwrap()
    }

    #[test]
    fn test_absolute_rebases_offsets() {
        assert_eq!(absolute(0x7000_0000, 0x1234), 0x7000_1234);
        assert_eq!(absolute(0x7000_0000, 0x7000_1234), 0x7000_1234);
        assert_eq!(absolute(0, 0x40_1000), 0x40_1000);
    }

    #[test]
    fn test_page_size_is_a_power_of_two() {
        let page = page_size().unwrap();
        assert!(page >= 4096 && page.is_power_of_two());
    }

    #[test]
    fn test_read_only_page_covers_whole_pages_only() {
        let page = 0x1000;
        let relro = Some(AddressRange::new(0x1_0d38, 0x1_3000 + 0x2c8));

        assert!(read_only_page(0x1_0d40, relro, page));
        assert!(read_only_page(0x1_2ff8, relro, page));
        assert!(!read_only_page(0x1_3008, relro, page));
        assert!(!read_only_page(0x1_4000, relro, page));
        assert!(!read_only_page(0x0_f000, relro, page));
        assert!(!read_only_page(0x1_0d40, None, page));
    }

    #[test]
    fn test_describe_objects_honors_skip() {
        let handle = dl::main_program().unwrap();
        let entries = dl::link_map_chain(handle);

        let all = describe_objects(&entries, |_| false).unwrap();
        assert_eq!(all.len(), entries.len());
        assert!(describe_objects(&entries, |_| true).unwrap().is_empty());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_main_program_free_slot_is_bound_to_libc() {
        let free = dl::default_symbol(c"free").unwrap().as_ptr() as usize;
        let redirects = [Redirect::new(CString::new("free").unwrap(), free)];

        let slots = unsafe { find_slots(&main_object(), &redirects) };
        assert!(!slots.is_empty());
        for slot in slots {
            let bound = unsafe { (slot.address as *const usize).read_volatile() };
            assert_eq!(bound, free);
        }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_patch_to_current_value_changes_nothing() {
        let free = dl::default_symbol(c"free").unwrap().as_ptr() as usize;
        let redirects = [Redirect::new(CString::new("free").unwrap(), free)];

        let changed = unsafe { patch_objects(&[main_object()], &redirects) }.unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_unrequested_symbols_have_no_slots() {
        let redirects = [Redirect::new(
            CString::new("capsule_symbol_nobody_imports").unwrap(),
            1,
        )];
        let slots = unsafe { find_slots(&main_object(), &redirects) };
        assert!(slots.is_empty());
    }
}
