//! Loader and allocator shims on either side of the boundary

#![allow(unsafe_code)]

use std::ffi::{CStr, c_void};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use capsule_core::{BoundaryEvent, LoadFlags, NamespaceId, Provenance};
use capsule_namespace::dl;
use tracing::warn;

use crate::capsule::Capsule;
use crate::diagnostics::{DiagnosticSink, StderrSink};

/// Entry points that replace `dlopen` and `free` at the boundary
///
/// Loads return null with the loader's error state set on failure, exactly as
/// the primitive they stand in for.
pub trait BoundaryShims: Send + Sync {
    /// `dlopen` as seen by the host
    ///
    /// # Safety
    /// Loading a library runs its constructors.
    unsafe fn external_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void;

    /// `dlopen` as seen by code inside the capsule
    ///
    /// # Safety
    /// Loading a library runs its constructors.
    unsafe fn internal_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void;

    /// `free` as seen by code inside the capsule
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation not used afterwards.
    unsafe fn deallocate(&self, ptr: *mut c_void);
}

fn library_name(name: Option<&CStr>) -> String {
    name.map_or_else(
        || "<main program>".to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// Shims bound to one capsule
pub struct CapsuleShims<'a> {
    capsule: &'a Capsule,
    sink: &'a dyn DiagnosticSink,
}

impl std::fmt::Debug for CapsuleShims<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleShims")
            .field("namespace", &self.capsule.namespace().id())
            .finish_non_exhaustive()
    }
}

impl<'a> CapsuleShims<'a> {
    /// Shims reporting to stderr
    #[must_use]
    pub fn new(capsule: &'a Capsule) -> Self {
        Self {
            capsule,
            sink: &StderrSink,
        }
    }

    /// Shims reporting to `sink`
    #[must_use]
    pub const fn with_sink(capsule: &'a Capsule, sink: &'a dyn DiagnosticSink) -> Self {
        Self { capsule, sink }
    }

    fn report_load(
        &self,
        name: Option<&CStr>,
        origin: Provenance,
        namespace: NamespaceId,
        flags: LoadFlags,
        handle: *mut c_void,
    ) {
        self.sink.report(&BoundaryEvent::Loaded {
            library: library_name(name),
            origin,
            namespace,
            flags,
            succeeded: !handle.is_null(),
            timestamp: SystemTime::now(),
        });
    }
}

impl BoundaryShims for CapsuleShims<'_> {
    unsafe fn external_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
        // SAFETY: forwarded caller contract.
        let handle = unsafe { dl::open(name, flags) };
        self.report_load(name, Provenance::Host, NamespaceId::BASE, flags, handle);

        if !handle.is_null() && self.capsule.host_redirected() {
            // SAFETY: redirects were vetted when host redirection was enabled.
            if let Err(e) = unsafe { self.capsule.refresh_host() } {
                warn!(error = %e, "Host redirection not applied to new objects");
            }
        }
        handle
    }

    unsafe fn internal_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
        let dropped = flags & self.capsule.unsupported_flags();
        let flags = if dropped.is_empty() {
            flags
        } else {
            self.sink.report(&BoundaryEvent::FlagDowngraded {
                library: library_name(name),
                dropped,
                timestamp: SystemTime::now(),
            });
            flags.without(dropped)
        };

        let namespace = self.capsule.namespace();
        let (handle, target_namespace) = match name {
            // SAFETY: forwarded caller contract.
            None => (unsafe { dl::open(None, flags) }, NamespaceId::BASE),
            Some(name) => {
                let path = self.capsule.resolve_library(name);
                // SAFETY: forwarded caller contract.
                (unsafe { namespace.open(Some(&path), flags) }, namespace.id())
            }
        };
        self.report_load(name, Provenance::Capsule, target_namespace, flags, handle);

        if !handle.is_null() && self.capsule.shims_installed() {
            // SAFETY: trampolines were vetted when the shims were installed.
            if let Err(e) = unsafe { self.capsule.refresh_shims() } {
                warn!(error = %e, "Capsule shims not applied to new objects");
            }
        }
        handle
    }

    unsafe fn deallocate(&self, ptr: *mut c_void) {
        // SAFETY: forwarded caller contract.
        unsafe { self.capsule.dispatcher().release(ptr, Provenance::Capsule) };
    }
}

/// One call seen by [`RecordingShims`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimCall {
    /// Host-side load
    External {
        /// Requested library
        library: Option<String>,
        /// Requested flags
        flags: LoadFlags,
    },
    /// Capsule-side load
    Internal {
        /// Requested library
        library: Option<String>,
        /// Requested flags
        flags: LoadFlags,
    },
    /// Deallocation
    Deallocate {
        /// Pointer released
        address: usize,
    },
}

/// Shims that record calls and load nothing
///
/// Loads return null and deallocations are not performed.
#[derive(Clone, Default)]
pub struct RecordingShims {
    calls: Arc<Mutex<Vec<ShimCall>>>,
}

impl RecordingShims {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls seen so far
    #[must_use]
    pub fn calls(&self) -> Vec<ShimCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Number of calls seen so far
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn record(&self, call: ShimCall) {
        tracing::debug!(?call, "Mock: Shim called");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl std::fmt::Debug for RecordingShims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingShims").finish_non_exhaustive()
    }
}

impl BoundaryShims for RecordingShims {
    unsafe fn external_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
        self.record(ShimCall::External {
            library: name.map(|n| n.to_string_lossy().into_owned()),
            flags,
        });
        std::ptr::null_mut()
    }

    unsafe fn internal_load(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
        self.record(ShimCall::Internal {
            library: name.map(|n| n.to_string_lossy().into_owned()),
            flags,
        });
        std::ptr::null_mut()
    }

    unsafe fn deallocate(&self, ptr: *mut c_void) {
        self.record(ShimCall::Deallocate {
            address: ptr as usize,
        });
    }
}
