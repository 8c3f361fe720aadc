//! Program headers of loaded objects
//!
//! `dl_iterate_phdr` only reports the caller's own link-map namespace, so
//! objects of a capsule are described from their own program headers: the
//! table the loader recorded (`dlinfo`), or the ELF header mapped at the load
//! bias. The walk threads its visitor through the callback's user-data
//! pointer, so each walk carries its own state.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_void};
use std::ops::ControlFlow;
use std::os::raw::c_int;
use std::ptr::NonNull;

use capsule_core::{AddressRange, LoadedImage};

use crate::dl::{self, LinkMapEntry};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;

#[repr(C)]
#[allow(dead_code)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// Segments of one loaded object that the boundary cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSegments {
    /// Name, load bias and `PT_LOAD` span
    pub image: LoadedImage,
    /// `PT_GNU_RELRO` span, made read-only after relocation
    pub relro: Option<AddressRange>,
    /// Runtime address of the dynamic section
    pub dynamic: Option<usize>,
}

impl ObjectSegments {
    /// Summarize a program header table of an object loaded at `base`
    #[must_use]
    pub fn from_headers(name: String, base: usize, phdrs: &[libc::Elf64_Phdr]) -> Self {
        let mut range = AddressRange::default();
        let mut relro = None;
        let mut dynamic = None;

        for phdr in phdrs {
            let start = base.wrapping_add(phdr.p_vaddr as usize);
            let span = AddressRange::new(start, start.wrapping_add(phdr.p_memsz as usize));
            match phdr.p_type {
                libc::PT_LOAD => range = range.union(span),
                libc::PT_GNU_RELRO => relro = Some(span),
                libc::PT_DYNAMIC => dynamic = Some(start),
                _ => {}
            }
        }

        Self {
            image: LoadedImage { name, base, range },
            relro,
            dynamic,
        }
    }
}

struct WalkContext<'a> {
    visit: &'a mut dyn FnMut(ObjectSegments) -> ControlFlow<()>,
}

unsafe extern "C" fn visit_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `data` is the `WalkContext` passed by `walk`, alive for the
    // whole iteration; `info` is provided by the loader for this callback.
    let (ctx, info) = unsafe { (&mut *data.cast::<WalkContext<'_>>(), &*info) };

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        // SAFETY: loader-owned NUL-terminated string.
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };

    let phdrs: &[libc::Elf64_Phdr] = if info.dlpi_phdr.is_null() {
        &[]
    } else {
        // SAFETY: the loader guarantees `dlpi_phnum` entries.
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
    };

    let segments = ObjectSegments::from_headers(name, info.dlpi_addr as usize, phdrs);
    match (ctx.visit)(segments) {
        ControlFlow::Continue(()) => 0,
        ControlFlow::Break(()) => 1,
    }
}

/// Visit every object of the caller's namespace until `visit` breaks
pub fn walk(mut visit: impl FnMut(ObjectSegments) -> ControlFlow<()>) {
    let mut ctx = WalkContext { visit: &mut visit };
    // SAFETY: the callback only dereferences `ctx`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(visit_object), (&raw mut ctx).cast::<c_void>());
    }
}

/// Segments of an object of the caller's namespace loaded at `base`
///
/// `name` disambiguates objects sharing a load bias (only possible for
/// non-relocatable executables); pass an empty string to match on base alone.
#[must_use]
pub fn segments_for(base: usize, name: &str) -> Option<ObjectSegments> {
    let mut found = None;
    walk(|segments| {
        if segments.image.base == base && (name.is_empty() || segments.image.name == name) {
            found = Some(segments);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found
}

/// Program headers read from the ELF header mapped at a shared object's bias
///
/// # Safety
/// `base` must be the load bias of a mapped `ET_DYN` object whose first
/// segment starts at file offset zero.
unsafe fn mapped_headers(base: usize) -> Option<&'static [libc::Elf64_Phdr]> {
    if base == 0 {
        return None;
    }
    // SAFETY: forwarded caller contract.
    let header = unsafe { &*(base as *const Elf64Ehdr) };
    if header.e_ident[..4] != ELF_MAGIC
        || header.e_ident[4] != ELF_CLASS_64
        || usize::from(header.e_phentsize) != std::mem::size_of::<libc::Elf64_Phdr>()
    {
        return None;
    }

    let table = base.checked_add(usize::try_from(header.e_phoff).ok()?)?;
    // SAFETY: the header table sits in the first segment right after the
    // ELF header for every object the loader maps.
    Some(unsafe {
        std::slice::from_raw_parts(table as *const libc::Elf64_Phdr, usize::from(header.e_phnum))
    })
}

/// Segments of any object on a link-map chain, whichever namespace it is in
#[must_use]
pub fn segments_of(entry: &LinkMapEntry) -> Option<ObjectSegments> {
    if let Some(phdrs) = dl::program_headers(entry) {
        return Some(ObjectSegments::from_headers(entry.name.clone(), entry.base, phdrs));
    }
    if let Some(segments) = segments_for(entry.base, &entry.name) {
        return Some(segments);
    }
    // SAFETY: anything not in the caller's namespace was mapped by dlmopen,
    // which only accepts shared objects.
    unsafe { mapped_headers(entry.base) }
        .map(|phdrs| ObjectSegments::from_headers(entry.name.clone(), entry.base, phdrs))
}

/// Image whose loaded span contains `addr`
#[must_use]
pub fn image_containing(addr: usize) -> Option<LoadedImage> {
    let mut found = None;
    walk(|segments| {
        if segments.image.contains(addr) {
            found = Some(segments.image);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found
}

/// Count of objects in every known namespace whose file name starts with
/// `prefix`
///
/// `also` names handles whose namespaces must be included even when the
/// loader does not announce them.
#[must_use]
pub fn count_named(prefix: &str, also: &[NonNull<c_void>]) -> usize {
    dl::namespace_chains(also)
        .iter()
        .flatten()
        .filter(|entry| entry.file_name().starts_with(prefix))
        .count()
}
