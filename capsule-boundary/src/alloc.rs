//! Allocator dispatch for pointers crossing the boundary
//!
//! Each namespace carries its own copy of the C library and therefore its own
//! heap. A pointer handed over the boundary must go back to the allocator that
//! produced it, and the only evidence available is the pointer itself.
//!
//! The classifier reads glibc's chunk header: memory-mapped chunks are released by
//! `munmap` whichever copy frees them, and main-arena chunks are told apart by
//! whether they sit inside the host's `brk` heap (a secondary namespace's libc
//! never extends `brk`). Anything else goes to the caller's own allocator.
//! With more than two allocator instances loaded the heuristic cannot work and
//! every pointer goes to the caller's allocator.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use capsule_core::{AddressRange, BoundaryEvent, Error, Provenance, Result};
use capsule_namespace::{LinkMapNamespace, dl, images};
use nix::errno::Errno;
use tracing::{debug, warn};

/// A C deallocation entry point
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// glibc chunk flag: chunk obtained from `mmap`
const IS_MMAPPED: usize = 0x2;
/// glibc chunk flag: chunk belongs to a non-main arena
const NON_MAIN_ARENA: usize = 0x4;

/// Most allocator instances provenance can distinguish
pub const MAX_ALLOCATORS: usize = 2;

/// What a classifier could tell about a pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Allocated by the given side's allocator
    Owned(Provenance),
    /// A stand-alone mapping either allocator can release
    Mapped,
    /// No usable evidence
    Unknown(&'static str),
}

/// Decides which allocator produced a pointer
pub trait ProvenanceClassifier: Send + Sync {
    /// Classify a live allocation
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by one of the loaded allocators.
    unsafe fn classify(&self, ptr: NonNull<c_void>) -> Classification;
}

/// Classify a glibc chunk from its size word
#[must_use]
pub fn classify_chunk(size_word: usize, address: usize, host_heap: AddressRange) -> Classification {
    if size_word & IS_MMAPPED != 0 {
        Classification::Mapped
    } else if size_word & NON_MAIN_ARENA != 0 {
        Classification::Unknown("non-main arena")
    } else if host_heap.is_empty() {
        Classification::Unknown("host heap bounds unknown")
    } else if host_heap.contains(address) {
        Classification::Owned(Provenance::Host)
    } else {
        Classification::Owned(Provenance::Capsule)
    }
}

/// Classifier based on glibc's malloc chunk layout
#[derive(Debug, Clone, Copy)]
pub struct GlibcChunkClassifier {
    heap_start: usize,
}

impl GlibcChunkClassifier {
    /// Classifier for the current process
    #[must_use]
    pub fn detect() -> Self {
        let heap_start = heap_start().unwrap_or(0);
        debug!(heap_start = format_args!("{heap_start:#x}"), "Host heap located");
        Self { heap_start }
    }

    /// Classifier with a known start of the host `brk` heap
    #[must_use]
    pub const fn with_heap_start(heap_start: usize) -> Self {
        Self { heap_start }
    }

    fn host_heap(&self) -> AddressRange {
        if self.heap_start == 0 {
            return AddressRange::default();
        }
        // SAFETY: sbrk(0) only reports the current break.
        let end = unsafe { libc::sbrk(0) } as usize;
        if end <= self.heap_start {
            AddressRange::default()
        } else {
            AddressRange::new(self.heap_start, end)
        }
    }
}

impl ProvenanceClassifier for GlibcChunkClassifier {
    unsafe fn classify(&self, ptr: NonNull<c_void>) -> Classification {
        let address = ptr.as_ptr() as usize;
        // SAFETY: every glibc allocation is preceded by its chunk's size word.
        let size_word = unsafe { ptr.as_ptr().cast::<usize>().sub(1).read() };
        classify_chunk(size_word, address, self.host_heap())
    }
}

/// `start_brk` from `/proc/self/stat`, or the `[heap]` mapping
fn heap_start() -> Option<usize> {
    std::fs::read_to_string("/proc/self/stat")
        .ok()
        .and_then(|stat| parse_start_brk(&stat))
        .or_else(|| {
            std::fs::read_to_string("/proc/self/maps")
                .ok()
                .and_then(|maps| parse_heap_mapping(&maps))
        })
}

/// Field 47 of `/proc/<pid>/stat`
fn parse_start_brk(stat: &str) -> Option<usize> {
    // The command name may contain spaces and parentheses.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace()
        .nth(44)
        .and_then(|field| field.parse().ok())
        .filter(|&start| start != 0)
}

fn parse_heap_mapping(maps: &str) -> Option<usize> {
    maps.lines()
        .find(|line| line.trim_end().ends_with("[heap]"))
        .and_then(|line| line.split('-').next())
        .and_then(|start| usize::from_str_radix(start, 16).ok())
}

/// Routes deallocations to the allocator that owns the pointer
pub struct AllocatorDispatcher {
    host: FreeFn,
    capsule: FreeFn,
    instances: usize,
    classifier: Box<dyn ProvenanceClassifier>,
    mismatch_reported: AtomicBool,
}

impl std::fmt::Debug for AllocatorDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorDispatcher")
            .field("host", &(self.host as usize as *const c_void))
            .field("capsule", &(self.capsule as usize as *const c_void))
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

impl AllocatorDispatcher {
    /// Create a dispatcher from explicit parts
    pub fn new(
        host: FreeFn,
        capsule: FreeFn,
        instances: usize,
        classifier: impl ProvenanceClassifier + 'static,
    ) -> Self {
        Self {
            host,
            capsule,
            instances,
            classifier: Box::new(classifier),
            mismatch_reported: AtomicBool::new(false),
        }
    }

    /// Dispatcher for the host and one capsule namespace
    pub fn for_namespace(namespace: &LinkMapNamespace) -> Result<Self> {
        let host = dl::default_symbol(c"free").map_or(libc::free as FreeFn, |free| {
            // SAFETY: `free` has this signature in every C library.
            unsafe { std::mem::transmute::<*mut c_void, FreeFn>(free.as_ptr()) }
        });

        let capsule = match namespace.symbol(c"free") {
            // SAFETY: as above.
            Some(free) => unsafe { std::mem::transmute::<*mut c_void, FreeFn>(free.as_ptr()) },
            None => {
                warn!(
                    namespace = %namespace.id(),
                    "Capsule has no allocator of its own, using the host's"
                );
                host
            }
        };

        let instances = images::count_named("libc.so", &[namespace.handle()]).max(1);
        if instances > MAX_ALLOCATORS {
            warn!(
                error = %Error::AllocatorMismatch { instances },
                "Pointer provenance disabled"
            );
        }

        debug!(
            instances,
            same = (host as usize) == (capsule as usize),
            "Allocator dispatcher ready"
        );
        Ok(Self::new(host, capsule, instances, GlibcChunkClassifier::detect()))
    }

    /// Number of allocator instances seen at construction
    #[must_use]
    pub const fn instances(&self) -> usize {
        self.instances
    }

    /// Whether provenance is used at all
    #[must_use]
    pub const fn provenance_enabled(&self) -> bool {
        self.instances <= MAX_ALLOCATORS
    }

    /// Deallocation entry point of one side
    #[must_use]
    pub fn free_fn(&self, side: Provenance) -> FreeFn {
        match side {
            Provenance::Host => self.host,
            Provenance::Capsule => self.capsule,
        }
    }

    /// Allocator that should release `ptr`
    ///
    /// `caller` is the side performing the release and is the answer whenever
    /// provenance cannot be established.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from one of the loaded allocators.
    pub unsafe fn route(&self, ptr: NonNull<c_void>, caller: Provenance) -> Provenance {
        if !self.provenance_enabled() {
            if !self.mismatch_reported.swap(true, Ordering::Relaxed) {
                warn!(
                    error = %Error::AllocatorMismatch { instances: self.instances },
                    "Releasing through the caller's allocator"
                );
            }
            return self.fallback(ptr, caller, "too many allocator instances");
        }

        // SAFETY: forwarded caller contract.
        match unsafe { self.classifier.classify(ptr) } {
            Classification::Owned(side) => side,
            Classification::Mapped => self.fallback(ptr, caller, "mapped chunk"),
            Classification::Unknown(reason) => self.fallback(ptr, caller, reason),
        }
    }

    fn fallback(&self, ptr: NonNull<c_void>, caller: Provenance, reason: &str) -> Provenance {
        BoundaryEvent::AllocatorFallback {
            address: ptr.as_ptr() as usize,
            chosen: caller,
            reason: reason.to_string(),
            timestamp: SystemTime::now(),
        }
        .emit_trace();
        caller
    }

    /// Release `ptr` through the allocator that owns it
    ///
    /// Null is a no-op. `errno` is left as the caller had it.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from one of the loaded
    /// allocators, not used afterwards.
    pub unsafe fn release(&self, ptr: *mut c_void, caller: Provenance) {
        let Some(nonnull) = NonNull::new(ptr) else {
            return;
        };

        let saved = Errno::last_raw();
        // SAFETY: forwarded caller contract.
        unsafe {
            let side = self.route(nonnull, caller);
            (self.free_fn(side))(ptr);
        }
        Errno::set_raw(saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static FREED: RefCell<Vec<Provenance>> = const { RefCell::new(Vec::new()) };
    }

    unsafe extern "C" fn host_free(ptr: *mut c_void) {
        FREED.with(|freed| freed.borrow_mut().push(Provenance::Host));
        unsafe { libc::free(ptr) }
    }

    unsafe extern "C" fn capsule_free(ptr: *mut c_void) {
        FREED.with(|freed| freed.borrow_mut().push(Provenance::Capsule));
        Errno::set_raw(libc::EBADF);
        unsafe { libc::free(ptr) }
    }

    fn freed() -> Vec<Provenance> {
        FREED.with(|freed| std::mem::take(&mut *freed.borrow_mut()))
    }

    struct FixedClassifier(Classification);

    impl ProvenanceClassifier for FixedClassifier {
        unsafe fn classify(&self, _ptr: NonNull<c_void>) -> Classification {
            self.0
        }
    }

    fn dispatcher(classification: Classification, instances: usize) -> AllocatorDispatcher {
        AllocatorDispatcher::new(host_free, capsule_free, instances, FixedClassifier(classification))
    }

    fn allocation() -> *mut c_void {
        unsafe { libc::malloc(32) }
    }

    #[test]
    fn test_null_is_noop() {
        let dispatcher = dispatcher(Classification::Owned(Provenance::Capsule), 2);
        unsafe { dispatcher.release(std::ptr::null_mut(), Provenance::Host) };
        assert!(freed().is_empty());
    }

    #[test]
    fn test_owned_pointer_goes_to_owner() {
        let dispatcher = dispatcher(Classification::Owned(Provenance::Capsule), 2);
        unsafe { dispatcher.release(allocation(), Provenance::Host) };
        assert_eq!(freed(), vec![Provenance::Capsule]);

        let dispatcher = self::dispatcher(Classification::Owned(Provenance::Host), 2);
        unsafe { dispatcher.release(allocation(), Provenance::Capsule) };
        assert_eq!(freed(), vec![Provenance::Host]);
    }

    #[test]
    fn test_undetermined_goes_to_caller() {
        for classification in [Classification::Mapped, Classification::Unknown("test")] {
            let dispatcher = dispatcher(classification, 2);
            unsafe { dispatcher.release(allocation(), Provenance::Capsule) };
            unsafe { dispatcher.release(allocation(), Provenance::Host) };
            assert_eq!(freed(), vec![Provenance::Capsule, Provenance::Host]);
        }
    }

    #[test]
    fn test_too_many_allocators_defaults_to_caller() {
        let dispatcher = dispatcher(Classification::Owned(Provenance::Capsule), 3);
        assert!(!dispatcher.provenance_enabled());

        unsafe { dispatcher.release(allocation(), Provenance::Host) };
        unsafe { dispatcher.release(allocation(), Provenance::Host) };
        assert_eq!(freed(), vec![Provenance::Host, Provenance::Host]);
    }

    #[test]
    fn test_errno_preserved() {
        let dispatcher = dispatcher(Classification::Owned(Provenance::Capsule), 2);
        Errno::set_raw(libc::ENOENT);
        unsafe { dispatcher.release(allocation(), Provenance::Host) };
        assert_eq!(Errno::last_raw(), libc::ENOENT);
        assert_eq!(freed(), vec![Provenance::Capsule]);
    }

    #[test]
    fn test_classify_chunk() {
        let heap = AddressRange::new(0x10_0000, 0x20_0000);

        assert_eq!(classify_chunk(0x1002, 0x10_1000, heap), Classification::Mapped);
        assert!(matches!(
            classify_chunk(0x31 | NON_MAIN_ARENA, 0x10_1000, heap),
            Classification::Unknown(_)
        ));
        assert_eq!(
            classify_chunk(0x31, 0x10_1000, heap),
            Classification::Owned(Provenance::Host)
        );
        assert_eq!(
            classify_chunk(0x31, 0x7f00_0000_1000, heap),
            Classification::Owned(Provenance::Capsule)
        );
        assert!(matches!(
            classify_chunk(0x31, 0x10_1000, AddressRange::default()),
            Classification::Unknown(_)
        ));
    }

    #[test]
    fn test_parse_start_brk() {
        let mut fields: Vec<String> = (3..=52).map(|n| n.to_string()).collect();
        fields[44] = "94000000".to_string();
        let stat = format!("1234 (my (odd) prog) {}", fields.join(" "));

        assert_eq!(parse_start_brk(&stat), Some(94_000_000));
        assert_eq!(parse_start_brk("1234 (short) R 1 2"), None);
    }

    #[test]
    fn test_parse_heap_mapping() {
        let maps = "\
55d0c0a00000-55d0c0a21000 r--p 00000000 08:01 123 /usr/bin/prog
55d0c1c3e000-55d0c1c5f000 rw-p 00000000 00:00 0                          [heap]
7f1e2a000000-7f1e2a021000 rw-p 00000000 00:00 0";

        assert_eq!(parse_heap_mapping(maps), Some(0x55d0_c1c3_e000));
        assert_eq!(parse_heap_mapping(""), None);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_large_allocation_is_mapped() {
        let classifier = GlibcChunkClassifier::detect();
        let ptr = unsafe { libc::malloc(64 * 1024 * 1024) };
        let classification = unsafe { classifier.classify(NonNull::new(ptr).unwrap()) };
        unsafe { libc::free(ptr) };

        assert_eq!(classification, Classification::Mapped);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_host_allocation_never_classified_as_capsule() {
        // Test threads usually allocate from a secondary arena.
        let classifier = GlibcChunkClassifier::detect();
        let ptr = unsafe { libc::malloc(48) };
        let classification = unsafe { classifier.classify(NonNull::new(ptr).unwrap()) };
        unsafe { libc::free(ptr) };

        assert_ne!(classification, Classification::Mapped);
        assert_ne!(classification, Classification::Owned(Provenance::Capsule));
    }
}
