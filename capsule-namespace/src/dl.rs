//! Thin wrappers over the platform `dlfcn` primitives
//!
//! `dlmopen` and `dlinfo` are glibc extensions; on other targets the
//! wrappers report the primitive as unavailable instead of failing to link.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_void};
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use capsule_core::{LoadFlags, NamespaceId};

/// `dlinfo` request: namespace id of a handle
const RTLD_DI_LMID: c_int = 1;
/// `dlinfo` request: `struct link_map *` of a handle
const RTLD_DI_LINKMAP: c_int = 2;
/// `dlinfo` request: program header table of a handle (glibc 2.36)
const RTLD_DI_PHDR: c_int = 11;

type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

/// Public prefix of glibc's `struct link_map`
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *const c_void,
    l_next: *const LinkMap,
    l_prev: *const LinkMap,
}

/// glibc's `struct r_debug_extended`; `r_next` is only valid from version 2
#[repr(C)]
struct RDebug {
    r_version: c_int,
    r_map: *const LinkMap,
    r_brk: usize,
    r_state: c_int,
    r_ldbase: usize,
    r_next: *const RDebug,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod sys {
    use std::ffi::c_void;
    use std::os::raw::{c_char, c_int, c_long};

    unsafe extern "C" {
        pub fn dlmopen(lmid: c_long, filename: *const c_char, flags: c_int) -> *mut c_void;
        pub fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod sys {
    use std::ffi::c_void;
    use std::os::raw::{c_char, c_int, c_long};

    pub unsafe fn dlmopen(_lmid: c_long, _filename: *const c_char, _flags: c_int) -> *mut c_void {
        std::ptr::null_mut()
    }

    pub unsafe fn dlinfo(_handle: *mut c_void, _request: c_int, _info: *mut c_void) -> c_int {
        -1
    }
}

/// Whether this target offers link-map namespaces at all
#[must_use]
pub const fn namespaces_available() -> bool {
    cfg!(all(target_os = "linux", target_env = "gnu"))
}

/// One object on a namespace's link-map chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMapEntry {
    /// Path recorded by the loader (empty for the main program)
    pub name: String,
    /// Load bias
    pub base: usize,
    /// Address of the object's dynamic section
    pub dynamic: usize,
    /// Address of the loader's node, which glibc accepts as a handle
    pub node: usize,
}

impl LinkMapEntry {
    /// Final path component, or the whole name
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Take and clear the loader's pending error message
///
/// Consumes the thread's `dlerror` state, so shims that must stay transparent
/// never call this on their failure path.
#[must_use]
pub fn take_error() -> Option<String> {
    // SAFETY: dlerror returns null or a NUL-terminated thread-local string
    // that stays valid until the next dl* call on this thread.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            None
        } else {
            Some(CStr::from_ptr(msg).to_string_lossy().into_owned())
        }
    }
}

/// The C library's own `dlopen`, bypassing this object's GOT
///
/// Host redirection may point the GOT entry at a trampoline that calls back
/// into [`open`].
fn platform_dlopen() -> DlopenFn {
    static DLOPEN: OnceLock<Option<DlopenFn>> = OnceLock::new();
    let resolved = DLOPEN.get_or_init(|| {
        // SAFETY: RTLD_NEXT is a valid pseudo-handle; `dlopen` has this
        // signature in every C library.
        unsafe {
            let found = libc::dlsym(libc::RTLD_NEXT, c"dlopen".as_ptr());
            (!found.is_null()).then(|| std::mem::transmute::<*mut c_void, DlopenFn>(found))
        }
    });
    (*resolved).unwrap_or(libc::dlopen)
}

/// `dlopen` in the caller's default namespace
///
/// # Safety
/// Loading a library runs its constructors.
#[must_use]
pub unsafe fn open(name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
    let name = name.map_or(ptr::null(), CStr::as_ptr);
    // SAFETY: name is null or NUL-terminated; caller accepts constructors.
    unsafe { platform_dlopen()(name, flags.bits()) }
}

/// `dlmopen` into `namespace`
///
/// # Safety
/// Loading a library runs its constructors.
#[must_use]
pub unsafe fn open_in(namespace: NamespaceId, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
    let name = name.map_or(ptr::null(), CStr::as_ptr);
    // SAFETY: as for `open`; the namespace id is validated by the loader.
    unsafe { sys::dlmopen(namespace.as_raw(), name, flags.bits()) }
}

/// Release a handle obtained from `open`/`open_in`
///
/// # Safety
/// `handle` must be a live loader handle not used afterwards.
pub unsafe fn close(handle: NonNull<c_void>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        libc::dlclose(handle.as_ptr());
    }
}

/// Resolve `name` in the default scope of the calling namespace
#[must_use]
pub fn default_symbol(name: &CStr) -> Option<NonNull<c_void>> {
    // SAFETY: RTLD_DEFAULT is a valid pseudo-handle.
    NonNull::new(unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) })
}

/// Namespace a loader handle belongs to
#[must_use]
pub fn namespace_of(handle: NonNull<c_void>) -> Option<NamespaceId> {
    let mut lmid: std::os::raw::c_long = 0;
    // SAFETY: RTLD_DI_LMID writes one Lmid_t into the pointed-to value.
    let rc = unsafe {
        sys::dlinfo(
            handle.as_ptr(),
            RTLD_DI_LMID,
            (&raw mut lmid).cast::<c_void>(),
        )
    };
    (rc == 0).then(|| NamespaceId::from_raw(lmid))
}

fn own_link_map(handle: NonNull<c_void>) -> Option<NonNull<LinkMap>> {
    let mut map: *mut LinkMap = ptr::null_mut();
    // SAFETY: RTLD_DI_LINKMAP writes one `struct link_map *`.
    let rc = unsafe {
        sys::dlinfo(
            handle.as_ptr(),
            RTLD_DI_LINKMAP,
            (&raw mut map).cast::<c_void>(),
        )
    };
    if rc == 0 { NonNull::new(map) } else { None }
}

/// Read one link-map node
///
/// # Safety
/// `map` must point to a live node of the loader's chain.
unsafe fn entry_at(map: NonNull<LinkMap>) -> LinkMapEntry {
    // SAFETY: forwarded caller contract; names are NUL-terminated.
    unsafe {
        let map = map.as_ref();
        let name = if map.l_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(map.l_name).to_string_lossy().into_owned()
        };
        LinkMapEntry {
            name,
            base: map.l_addr,
            dynamic: map.l_ld as usize,
            node: ptr::from_ref(map) as usize,
        }
    }
}

/// Read a whole chain starting from any of its nodes
///
/// # Safety
/// `map` must point to a live node of the loader's chain.
unsafe fn chain_from(mut map: NonNull<LinkMap>) -> Vec<LinkMapEntry> {
    let mut entries = Vec::new();
    // SAFETY: the chain is owned by the loader; objects on it are not
    // unloaded while we walk, since capsules are never closed.
    unsafe {
        while let Some(prev) = NonNull::new(map.as_ref().l_prev.cast_mut()) {
            map = prev;
        }
        let mut cursor = Some(map);
        while let Some(node) = cursor {
            entries.push(entry_at(node));
            cursor = NonNull::new(node.as_ref().l_next.cast_mut());
        }
    }
    entries
}

/// The link-map node of the object `handle` refers to
#[must_use]
pub fn link_map_entry(handle: NonNull<c_void>) -> Option<LinkMapEntry> {
    // SAFETY: the node belongs to a handle the caller still holds.
    own_link_map(handle).map(|map| unsafe { entry_at(map) })
}

/// Every object on the link-map chain that `handle` belongs to, in load order
#[must_use]
pub fn link_map_chain(handle: NonNull<c_void>) -> Vec<LinkMapEntry> {
    // SAFETY: the node belongs to a handle the caller still holds.
    own_link_map(handle).map_or_else(Vec::new, |map| unsafe { chain_from(map) })
}

/// Link-map chains of every namespace the loader knows about
///
/// Namespaces are listed through the debugger interface (`_r_debug`), which
/// links one record per namespace from glibc 2.35. Chains reachable from
/// `also` are added when the loader does not announce them, so older loaders
/// still see at least the base namespace and those handles' namespaces.
#[must_use]
pub fn namespace_chains(also: &[NonNull<c_void>]) -> Vec<Vec<LinkMapEntry>> {
    let mut chains = Vec::new();

    if let Some(debug) = default_symbol(c"_r_debug") {
        let mut cursor = debug.as_ptr().cast::<RDebug>().cast_const();
        // SAFETY: `_r_debug` is the loader's record; `r_next` is only read
        // once the version says the extended layout is in place.
        unsafe {
            let extended = (*cursor).r_version >= 2;
            while !cursor.is_null() {
                if let Some(head) = NonNull::new((*cursor).r_map.cast_mut()) {
                    chains.push(chain_from(head));
                }
                if !extended {
                    break;
                }
                cursor = (*cursor).r_next;
            }
        }
    }

    for handle in main_program().into_iter().chain(also.iter().copied()) {
        let chain = link_map_chain(handle);
        if !chain.is_empty() && !chains.iter().any(|known| known.first() == chain.first()) {
            chains.push(chain);
        }
    }
    chains
}

/// Program header table of a loaded object, as the loader recorded it
///
/// Needs glibc 2.36 or later; `None` on older loaders.
#[must_use]
pub fn program_headers(entry: &LinkMapEntry) -> Option<&'static [libc::Elf64_Phdr]> {
    let node = NonNull::new(entry.node as *mut c_void)?;
    let mut phdr: *const libc::Elf64_Phdr = ptr::null();
    // SAFETY: a link-map node doubles as a handle on glibc; RTLD_DI_PHDR
    // stores one pointer and returns the entry count.
    let count = unsafe { sys::dlinfo(node.as_ptr(), RTLD_DI_PHDR, (&raw mut phdr).cast::<c_void>()) };
    if count <= 0 || phdr.is_null() {
        // Older loaders reject the request and leave a message behind.
        let _ = take_error();
        return None;
    }
    let count = usize::try_from(count).ok()?;
    // SAFETY: the table lives as long as the object, and capsules are never
    // unloaded.
    Some(unsafe { std::slice::from_raw_parts(phdr, count) })
}

/// Handle for the main program (`dlopen(NULL)`)
#[must_use]
pub fn main_program() -> Option<NonNull<c_void>> {
    // SAFETY: dlopen(NULL) loads nothing new.
    NonNull::new(unsafe { platform_dlopen()(ptr::null(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) })
}
