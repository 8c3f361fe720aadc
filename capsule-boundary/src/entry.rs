//! C-ABI entry points behind the installed trampolines
//!
//! [`declare_capsule!`](crate::declare_capsule) expands to a static
//! [`CapsuleCell`] plus `extern "C"` trampolines calling into this module.
//! When the capsule is unavailable the plain primitives are used, so an
//! installed trampoline never makes a call fail that would otherwise succeed.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_void};
use std::os::raw::{c_char, c_int};

use capsule_core::LoadFlags;
use capsule_namespace::{dl, images};

use crate::alloc::FreeFn;
use crate::cell::CapsuleCell;
use crate::relocate::Redirect;
use crate::shims::{BoundaryShims, CapsuleShims};

/// A C `dlopen`-shaped entry point
pub type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

/// The trampolines generated for one capsule
#[derive(Debug, Clone, Copy)]
pub struct Trampolines {
    /// Replaces `dlopen` in host objects
    pub external_dlopen: DlopenFn,
    /// Replaces `dlopen` in capsule objects
    pub internal_dlopen: DlopenFn,
    /// Replaces `free` in capsule objects
    pub free: FreeFn,
}

impl Trampolines {
    /// Redirects installed inside the capsule's namespace
    #[must_use]
    pub fn capsule_redirects(&self) -> Vec<Redirect> {
        vec![
            Redirect::new(CString::from(c"dlopen"), self.internal_dlopen as usize),
            Redirect::new(CString::from(c"free"), self.free as usize),
        ]
    }

    /// Redirects installed in host objects
    #[must_use]
    pub fn host_redirects(&self) -> Vec<Redirect> {
        vec![Redirect::new(
            CString::from(c"dlopen"),
            self.external_dlopen as usize,
        )]
    }

    /// Load bias of the object the trampolines were compiled into
    ///
    /// Pass it in `keep` to leave that object's own calls unshimmed. The
    /// shims reach the real `dlopen` without going through any GOT, so this
    /// is not needed to avoid recursion.
    #[must_use]
    pub fn home(&self) -> Option<usize> {
        images::image_containing(self.external_dlopen as usize).map(|image| image.base)
    }
}

fn name_arg<'a>(name: *const c_char) -> Option<&'a CStr> {
    // SAFETY: loader entry points receive null or a NUL-terminated string.
    (!name.is_null()).then(|| unsafe { CStr::from_ptr(name) })
}

/// Forward a raw `dlopen` call to the host-side shim
///
/// # Safety
/// Arguments must be valid for `dlopen`.
pub unsafe fn dispatch_external(
    shims: &dyn BoundaryShims,
    name: *const c_char,
    flags: c_int,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { shims.external_load(name_arg(name), LoadFlags::from_bits(flags)) }
}

/// Forward a raw `dlopen` call to the capsule-side shim
///
/// # Safety
/// Arguments must be valid for `dlopen`.
pub unsafe fn dispatch_internal(
    shims: &dyn BoundaryShims,
    name: *const c_char,
    flags: c_int,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { shims.internal_load(name_arg(name), LoadFlags::from_bits(flags)) }
}

/// Forward a raw `free` call to the deallocation shim
///
/// # Safety
/// Arguments must be valid for `free`.
pub unsafe fn dispatch_free(shims: &dyn BoundaryShims, ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe { shims.deallocate(ptr) }
}

/// Host `dlopen` through `cell`'s capsule, constructing it on first use
///
/// # Safety
/// Arguments must be valid for `dlopen`.
pub unsafe fn external_dlopen(cell: &CapsuleCell, name: *const c_char, flags: c_int) -> *mut c_void {
    match cell.get() {
        // SAFETY: forwarded caller contract.
        Ok(capsule) => unsafe { dispatch_external(&CapsuleShims::new(capsule), name, flags) },
        // SAFETY: as above.
        Err(_) => unsafe { dl::open(name_arg(name), LoadFlags::from_bits(flags)) },
    }
}

/// Capsule `dlopen` through `cell`'s capsule
///
/// # Safety
/// Arguments must be valid for `dlopen`.
pub unsafe fn internal_dlopen(cell: &CapsuleCell, name: *const c_char, flags: c_int) -> *mut c_void {
    match cell.get_if_ready() {
        // SAFETY: forwarded caller contract.
        Some(capsule) => unsafe { dispatch_internal(&CapsuleShims::new(capsule), name, flags) },
        // SAFETY: as above.
        None => unsafe { dl::open(name_arg(name), LoadFlags::from_bits(flags)) },
    }
}

/// Capsule `free` through `cell`'s allocator dispatcher
///
/// # Safety
/// Arguments must be valid for `free`.
pub unsafe fn free(cell: &CapsuleCell, ptr: *mut c_void) {
    match cell.get_if_ready() {
        // SAFETY: forwarded caller contract.
        Some(capsule) => unsafe { dispatch_free(&CapsuleShims::new(capsule), ptr) },
        // SAFETY: as above.
        None => unsafe { libc::free(ptr) },
    }
}

/// Declare a capsule and its trampolines
///
/// ```ignore
/// capsule_boundary::declare_capsule! {
///     /// Shadow copy of the host's GLX
///     pub static HOST_GLX = capsule("/usr/lib/libGLX.so.0", ["glXGetProcAddress"]);
///     pub fn host_glx_trampolines;
/// }
///
/// let capsule = HOST_GLX.get()?;
/// let trampolines = host_glx_trampolines();
/// unsafe {
///     // Code inside the capsule loads into its own namespace and frees
///     // through the allocator dispatcher.
///     capsule.install_shims(&trampolines)?;
///     // Host calls to the exports and to `dlopen` cross the boundary.
///     capsule.redirect_host(&trampolines.host_redirects(), &[])?;
/// }
/// ```
#[macro_export]
macro_rules! declare_capsule {
    (
        $(#[$meta:meta])*
        $vis:vis static $cell:ident = capsule($target:expr, [$($export:expr),* $(,)?]);
        $(#[$tmeta:meta])*
        $tvis:vis fn $trampolines:ident;
    ) => {
        $(#[$meta])*
        $vis static $cell: $crate::CapsuleCell = $crate::CapsuleCell::new($target, &[$($export),*]);

        $(#[$tmeta])*
        $tvis fn $trampolines() -> $crate::Trampolines {
            unsafe extern "C" fn external_dlopen(
                name: *const ::std::os::raw::c_char,
                flags: ::std::os::raw::c_int,
            ) -> *mut ::std::ffi::c_void {
                // SAFETY: called in place of `dlopen`.
                unsafe { $crate::entry::external_dlopen(&$cell, name, flags) }
            }

            unsafe extern "C" fn internal_dlopen(
                name: *const ::std::os::raw::c_char,
                flags: ::std::os::raw::c_int,
            ) -> *mut ::std::ffi::c_void {
                // SAFETY: called in place of `dlopen`.
                unsafe { $crate::entry::internal_dlopen(&$cell, name, flags) }
            }

            unsafe extern "C" fn free(ptr: *mut ::std::ffi::c_void) {
                // SAFETY: called in place of `free`.
                unsafe { $crate::entry::free(&$cell, ptr) }
            }

            $crate::Trampolines {
                external_dlopen,
                internal_dlopen,
                free,
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shims::{RecordingShims, ShimCall};

    crate::declare_capsule! {
        static MISSING = capsule("/nonexistent/libmissing.so.1", ["missing_call"]);
        fn missing_trampolines;
    }

    #[test]
    fn test_dispatch_converts_arguments() {
        let shims = RecordingShims::new();
        let flags = libc::RTLD_NOW | libc::RTLD_GLOBAL;

        unsafe {
            dispatch_external(&shims, c"libfoo.so.1".as_ptr(), flags);
            dispatch_internal(&shims, std::ptr::null(), libc::RTLD_LAZY);
            dispatch_free(&shims, std::ptr::null_mut());
        }

        assert_eq!(
            shims.calls(),
            vec![
                ShimCall::External {
                    library: Some("libfoo.so.1".to_string()),
                    flags: LoadFlags::from_bits(flags),
                },
                ShimCall::Internal {
                    library: None,
                    flags: LoadFlags::LAZY,
                },
                ShimCall::Deallocate { address: 0 },
            ]
        );
    }

    #[test]
    fn test_trampolines_fall_back_without_capsule() {
        let trampolines = missing_trampolines();

        let main = unsafe { (trampolines.external_dlopen)(std::ptr::null(), libc::RTLD_NOW) };
        assert!(!main.is_null());
        assert!(MISSING.get().is_err());

        let internal = unsafe { (trampolines.internal_dlopen)(std::ptr::null(), libc::RTLD_NOW) };
        assert_eq!(main, internal);

        let missing =
            unsafe { (trampolines.internal_dlopen)(c"/nonexistent/libnope.so".as_ptr(), libc::RTLD_NOW) };
        assert!(missing.is_null());

        unsafe {
            (trampolines.free)(libc::malloc(16));
            (trampolines.free)(std::ptr::null_mut());
        }
        assert_eq!(MISSING.attempts(), 1);
    }

    #[test]
    fn test_trampolines_live_in_this_object() {
        let trampolines = missing_trampolines();
        let home = trampolines.home();

        assert!(home.is_some());
        assert_eq!(
            home,
            images::image_containing(test_trampolines_live_in_this_object as usize).map(|i| i.base)
        );
        assert_eq!(trampolines.capsule_redirects().len(), 2);
        assert_eq!(trampolines.host_redirects()[0].address, trampolines.external_dlopen as usize);
    }
}
