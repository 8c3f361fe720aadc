//! A constructed capsule: namespace, exports and allocator dispatch

#![allow(unsafe_code)]

use std::borrow::Cow;
use std::ffi::{CStr, CString, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::SystemTime;

use capsule_core::{BoundaryEvent, Error, LoadFlags, LoadedImage, Result};
use capsule_namespace::{CapsuleConfig, ExportTable, LinkMapNamespace, NamespaceLoader, dl};
use tracing::{debug, error, info};

use crate::alloc::AllocatorDispatcher;
use crate::entry::Trampolines;
use crate::relocate::{self, Redirect};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostRedirects {
    redirects: Vec<Redirect>,
    keep: Vec<usize>,
}

/// A shadow library isolated in its own link-map namespace
///
/// Everything except the relocation passes is fixed at construction, so a
/// capsule can be shared by any number of threads. Redirections are set once;
/// the write lock is only held while slots are stored, never across a call
/// into the loader, because shims run inside the loader's own lock.
#[derive(Debug)]
pub struct Capsule {
    config: CapsuleConfig,
    namespace: LinkMapNamespace,
    image: LoadedImage,
    exports: ExportTable,
    dispatcher: AllocatorDispatcher,
    host: OnceLock<HostRedirects>,
    shims: OnceLock<Vec<Redirect>>,
    writes: Mutex<()>,
}

impl Capsule {
    /// Flags an internal caller may ask for that the namespace cannot honor
    pub const UNSUPPORTED_FLAGS: LoadFlags = LoadFlags::GLOBAL;

    /// Load the target into a fresh namespace and resolve every export
    ///
    /// On failure nothing is left half-built: the namespace handle is closed
    /// and no export is reachable.
    pub fn create(config: CapsuleConfig) -> Result<Self> {
        let loaded = NamespaceLoader::new(&config).load()?;

        let exports = match ExportTable::resolve(&config, &loaded.namespace, &loaded.image) {
            Ok(exports) => exports,
            Err(e) => {
                error!(target_library = %config.target.display(), error = %e, "Export resolution failed");
                loaded.abandon();
                return Err(e);
            }
        };

        let dispatcher = match AllocatorDispatcher::for_namespace(&loaded.namespace) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                loaded.abandon();
                return Err(e);
            }
        };

        BoundaryEvent::CapsuleCreated {
            target: exports.target().to_string(),
            namespace: loaded.namespace.id(),
            base: loaded.image.base,
            exports: exports.len(),
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        Ok(Self {
            config,
            namespace: loaded.namespace,
            image: loaded.image,
            exports,
            dispatcher,
            host: OnceLock::new(),
            shims: OnceLock::new(),
            writes: Mutex::new(()),
        })
    }

    /// Configuration the capsule was built from
    #[must_use]
    pub const fn config(&self) -> &CapsuleConfig {
        &self.config
    }

    /// The isolated namespace
    #[must_use]
    pub const fn namespace(&self) -> &LinkMapNamespace {
        &self.namespace
    }

    /// The shadow library as mapped
    #[must_use]
    pub const fn image(&self) -> &LoadedImage {
        &self.image
    }

    /// Resolved exports
    #[must_use]
    pub const fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Allocator dispatch for this capsule
    #[must_use]
    pub const fn dispatcher(&self) -> &AllocatorDispatcher {
        &self.dispatcher
    }

    /// Flags stripped from internal load requests
    #[must_use]
    pub const fn unsupported_flags(&self) -> LoadFlags {
        Self::UNSUPPORTED_FLAGS
    }

    /// Address of an export in the shadow library
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<NonNull<c_void>> {
        self.exports.get(name)
    }

    /// An export as a typed function pointer
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the export's ABI.
    #[must_use]
    pub unsafe fn function<F: Copy>(&self, name: &str) -> Option<F> {
        const {
            assert!(
                std::mem::size_of::<F>() == std::mem::size_of::<*mut c_void>(),
                "export type must be pointer-sized"
            );
        }
        self.lookup(name).map(|ptr| {
            // SAFETY: caller vouches for the signature.
            unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr.as_ptr()) }
        })
    }

    /// Whether a loader handle belongs to the capsule's namespace
    #[must_use]
    pub fn owns_handle(&self, handle: NonNull<c_void>) -> bool {
        self.namespace.owns(handle)
    }

    /// Map a library path requested inside the capsule onto the host prefix
    #[must_use]
    pub fn resolve_library<'a>(&self, name: &'a CStr) -> Cow<'a, CStr> {
        if self.config.prefix.is_none() || !name.to_bytes().starts_with(b"/") {
            return Cow::Borrowed(name);
        }

        let path = Path::new(std::ffi::OsStr::from_bytes(name.to_bytes()));
        let resolved = self.config.resolve_path(path);
        if resolved == path {
            return Cow::Borrowed(name);
        }

        CString::new(resolved.as_os_str().as_bytes()).map_or(Cow::Borrowed(name), Cow::Owned)
    }

    fn writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn already_installed(&self, what: &str) -> Error {
        Error::Relocation {
            object: self.image.display_name().to_string(),
            message: format!("{what} already installed with different redirects"),
        }
    }

    /// Point host references to the exports at the shadow library
    ///
    /// `extra` redirects are applied alongside the exports. Objects whose
    /// load bias is in `keep` are never touched. Objects loaded later are
    /// picked up by [`Capsule::refresh_host`]. Redirection is set once per
    /// capsule; repeating the same request only refreshes.
    ///
    /// # Safety
    /// Rewrites live GOT slots of the host; every redirect must be
    /// ABI-compatible with the symbol it replaces.
    pub unsafe fn redirect_host(&self, extra: &[Redirect], keep: &[usize]) -> Result<usize> {
        let mut redirects = Vec::with_capacity(self.exports.len() + extra.len());
        for (name, address) in self.exports.iter() {
            if let Ok(symbol) = CString::new(name) {
                redirects.push(Redirect::new(symbol, address));
            }
        }
        redirects.extend_from_slice(extra);

        let requested = HostRedirects {
            redirects,
            keep: keep.to_vec(),
        };
        let installed = self.host.get_or_init(|| requested.clone());
        if *installed != requested {
            return Err(self.already_installed("host redirection"));
        }

        // SAFETY: forwarded caller contract.
        unsafe { self.patch_host(installed) }
    }

    /// Whether host redirection is active
    #[must_use]
    pub fn host_redirected(&self) -> bool {
        self.host.get().is_some()
    }

    /// Apply host redirection to objects loaded since the last pass
    ///
    /// # Safety
    /// As for [`Capsule::redirect_host`].
    pub unsafe fn refresh_host(&self) -> Result<usize> {
        match self.host.get() {
            // SAFETY: forwarded caller contract.
            Some(host) => unsafe { self.patch_host(host) },
            None => Ok(0),
        }
    }

    unsafe fn patch_host(&self, host: &HostRedirects) -> Result<usize> {
        let Some(main) = dl::main_program() else {
            return Ok(0);
        };

        let objects = relocate::describe_objects(&dl::link_map_chain(main), |object| {
            self.config.is_excluded(&object.name) || host.keep.contains(&object.base)
        })?;

        let _writes = self.writes();
        // SAFETY: redirects were vetted by the caller of `redirect_host`.
        let patched = unsafe { relocate::patch_objects(&objects, &host.redirects) }?;
        debug!(slots = patched, "Host redirection applied");
        Ok(patched)
    }

    /// Route the capsule's own `dlopen` and `free` through the trampolines
    ///
    /// Set once per capsule; installing the same trampolines again only
    /// refreshes.
    ///
    /// # Safety
    /// Rewrites live GOT slots inside the namespace; the trampolines must
    /// stay valid for the rest of the process.
    pub unsafe fn install_shims(&self, trampolines: &Trampolines) -> Result<usize> {
        let requested = trampolines.capsule_redirects();
        let installed = self.shims.get_or_init(|| requested.clone());
        if *installed != requested {
            return Err(self.already_installed("capsule shims"));
        }

        // SAFETY: forwarded caller contract.
        let patched = unsafe { self.patch_capsule(installed) }?;
        info!(
            namespace = %self.namespace.id(),
            slots = patched,
            "Capsule shims installed"
        );
        Ok(patched)
    }

    /// Whether the capsule's own loader calls are routed through shims
    #[must_use]
    pub fn shims_installed(&self) -> bool {
        self.shims.get().is_some()
    }

    /// Apply installed shims to objects loaded into the namespace since
    ///
    /// # Safety
    /// As for [`Capsule::install_shims`].
    pub unsafe fn refresh_shims(&self) -> Result<usize> {
        match self.shims.get() {
            // SAFETY: forwarded caller contract.
            Some(redirects) => unsafe { self.patch_capsule(redirects) },
            None => Ok(0),
        }
    }

    unsafe fn patch_capsule(&self, redirects: &[Redirect]) -> Result<usize> {
        let objects = relocate::describe_objects(&self.namespace.link_maps(), |object| {
            self.config.is_excluded(&object.name)
        })?;

        let _writes = self.writes();
        // SAFETY: trampolines vetted by the caller of `install_shims`.
        unsafe { relocate::patch_objects(&objects, redirects) }
    }
}
