//! Namespace loading of shadow libraries

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_void};
use std::os::unix::ffi::OsStrExt;
use std::ptr::NonNull;

use capsule_core::{Error, LoadFlags, LoadedImage, NamespaceId, Result};
use libloading::os::unix::Library;
use tracing::{debug, error, info};

use crate::config::CapsuleConfig;
use crate::dl::{self, LinkMapEntry};
use crate::images;

/// An isolated link-map namespace and the handle of the object that opened it
///
/// Owned exclusively by one capsule. The handle is never closed: namespaces
/// live until process exit.
#[derive(Debug)]
pub struct LinkMapNamespace {
    id: NamespaceId,
    handle: NonNull<c_void>,
}

// SAFETY: a loader handle is an immutable token; every dl* function taking it
// is thread-safe.
unsafe impl Send for LinkMapNamespace {}
// SAFETY: see above.
unsafe impl Sync for LinkMapNamespace {}

impl LinkMapNamespace {
    /// Namespace id (`Lmid_t`)
    #[must_use]
    pub const fn id(&self) -> NamespaceId {
        self.id
    }

    /// Raw loader handle of the target
    #[must_use]
    pub const fn handle(&self) -> NonNull<c_void> {
        self.handle
    }

    /// Resolve a symbol in the target's dependency scope
    #[must_use]
    pub fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: the handle stays open for the life of the process and is
        // handed back with `into_raw`, so the wrapper never closes it.
        let library = unsafe { Library::from_raw(self.handle.as_ptr()) };
        // SAFETY: the address is only read, never called through here.
        let found = unsafe { library.get::<*mut c_void>(name.to_bytes_with_nul()) }
            .ok()
            .map(|symbol| *symbol);
        let _ = library.into_raw();
        found.and_then(NonNull::new)
    }

    /// Load another object into this namespace
    ///
    /// Returns null with the loader's error state set on failure, exactly as
    /// `dlmopen` does.
    ///
    /// # Safety
    /// Loading a library runs its constructors.
    #[must_use]
    pub unsafe fn open(&self, name: Option<&CStr>, flags: LoadFlags) -> *mut c_void {
        // SAFETY: forwarded caller contract.
        unsafe { dl::open_in(self.id, name, flags) }
    }

    /// Objects currently on this namespace's link-map chain
    #[must_use]
    pub fn link_maps(&self) -> Vec<LinkMapEntry> {
        dl::link_map_chain(self.handle)
    }

    /// Whether a loader handle belongs to this namespace
    #[must_use]
    pub fn owns(&self, handle: NonNull<c_void>) -> bool {
        dl::namespace_of(handle) == Some(self.id)
    }
}

/// Result of a successful namespace load
#[derive(Debug)]
pub struct LoadedTarget {
    /// The new namespace
    pub namespace: LinkMapNamespace,
    /// The shadow library as mapped
    pub image: LoadedImage,
}

impl LoadedTarget {
    /// Give the namespace back when a later construction step fails
    ///
    /// No pointer into the target may have escaped.
    pub fn abandon(self) {
        debug!(namespace = %self.namespace.id, "Abandoning capsule namespace");
        // SAFETY: the handle was never shared outside this value.
        unsafe { dl::close(self.namespace.handle) };
    }
}

/// Loads a capsule's target into a fresh namespace
#[derive(Debug)]
pub struct NamespaceLoader<'a> {
    config: &'a CapsuleConfig,
}

impl<'a> NamespaceLoader<'a> {
    /// Flags used for the target itself: unresolved symbols fail the load
    pub const TARGET_FLAGS: LoadFlags = LoadFlags::from_bits(libc::RTLD_NOW | libc::RTLD_LOCAL);

    /// Create a loader for `config`
    #[must_use]
    pub const fn new(config: &'a CapsuleConfig) -> Self {
        Self { config }
    }

    /// Create a namespace and load the target into it
    ///
    /// Consumes one namespace slot for the life of the process on success.
    /// On failure nothing stays reachable: a handle opened before a later step
    /// failed is closed again.
    pub fn load(&self) -> Result<LoadedTarget> {
        let target = self.config.target.display().to_string();
        self.config.validate()?;

        if !dl::namespaces_available() {
            return Err(Error::load(
                &target,
                "link-map namespaces (dlmopen) are not available on this platform",
            ));
        }

        let path = self.config.resolved_target();
        if self.config.target_is_path() && !path.exists() {
            return Err(Error::load(&target, format!("{}: no such file", path.display())));
        }

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| Error::load(&target, format!("invalid path: {e}")))?;

        debug!(target_library = %target, path = %path.display(), "Opening capsule namespace");

        // Clear any stale message so the one we report belongs to this load.
        let _ = dl::take_error();

        // SAFETY: path is NUL-terminated; running the target's constructors is
        // the point of loading it.
        let raw = unsafe { dl::open_in(NamespaceId::NEW, Some(&c_path), Self::TARGET_FLAGS) };
        let Some(handle) = NonNull::new(raw) else {
            let message = dl::take_error().unwrap_or_else(|| "dlmopen failed".to_string());
            error!(target_library = %target, error = %message, "Failed to load capsule target");
            return Err(Error::load(&target, message));
        };

        match Self::describe(handle, &target) {
            Ok(loaded) => {
                info!(
                    target_library = %target,
                    namespace = %loaded.namespace.id,
                    range = %loaded.image.range,
                    "Capsule namespace ready"
                );
                Ok(loaded)
            }
            Err(e) => {
                // SAFETY: the handle is ours and nothing else has seen it.
                unsafe { dl::close(handle) };
                Err(e)
            }
        }
    }

    fn describe(handle: NonNull<c_void>, target: &str) -> Result<LoadedTarget> {
        let id = dl::namespace_of(handle)
            .ok_or_else(|| Error::load(target, "cannot query namespace of loaded handle"))?;

        let entry = dl::link_map_entry(handle)
            .ok_or_else(|| Error::load(target, "cannot query link map of loaded handle"))?;

        let segments = images::segments_of(&entry)
            .ok_or_else(|| Error::load(target, "cannot read program headers of loaded object"))?;
        if segments.image.range.is_empty() {
            return Err(Error::load(target, "loaded object has no mapped segments"));
        }

        Ok(LoadedTarget {
            namespace: LinkMapNamespace { id, handle },
            image: segments.image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_target_is_load_error() {
        let config = CapsuleConfig::from_static("/nonexistent/libshadow.so.1", &["shadow_init"]);
        let err = NamespaceLoader::new(&config).load().unwrap_err();

        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("/nonexistent/libshadow.so.1"));
    }

    #[test]
    fn test_invalid_config_rejected_before_loading() {
        let config = CapsuleConfig::new("/nonexistent/libshadow.so.1").with_export("");
        let err = NamespaceLoader::new(&config).load().unwrap_err();

        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_load_into_new_namespace() {
        let config = CapsuleConfig::new("libm.so.6");
        let loaded = NamespaceLoader::new(&config).load().unwrap();

        assert!(!loaded.namespace.id().is_base());
        assert!(loaded.image.file_name().starts_with("libm"));
        assert!(loaded.namespace.owns(loaded.namespace.handle()));
        assert!(loaded.namespace.symbol(c"cos").is_some());

        let cos = loaded.namespace.symbol(c"cos").unwrap().as_ptr() as usize;
        assert!(loaded.image.contains(cos));
    }
}
