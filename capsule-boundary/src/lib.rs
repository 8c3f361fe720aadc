//! Capsule boundary - shims between a host and its isolated shadow library
//!
//! This crate provides:
//! - Capsules - namespace, export table and allocator dispatch built once
//! - Init-once cells - race-free lazy construction for statically declared capsules
//! - Boundary shims - transparent host `dlopen`, namespace-confined capsule `dlopen`
//! - Allocator dispatch - pointers released by the allocator that produced them
//! - GOT relocation - installing redirects into already-loaded objects
//!
//! # Example
//!
//! ```no_run
//! use capsule_boundary::CapsuleCell;
//!
//! static LIBM: CapsuleCell = CapsuleCell::new("libm.so.6", &["cos"]);
//!
//! let capsule = LIBM.get().expect("capsule");
//! let cos: unsafe extern "C" fn(f64) -> f64 = unsafe { capsule.function("cos") }.unwrap();
//! assert_eq!(unsafe { cos(0.0) }, 1.0);
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod alloc;
pub mod capsule;
pub mod cell;
pub mod diagnostics;
pub mod entry;
pub mod relocate;
pub mod shims;

pub use alloc::{AllocatorDispatcher, Classification, FreeFn, GlibcChunkClassifier, ProvenanceClassifier};
pub use capsule::Capsule;
pub use cell::CapsuleCell;
pub use diagnostics::{DiagnosticSink, MemorySink, StderrSink};
pub use entry::{DlopenFn, Trampolines};
pub use relocate::Redirect;
pub use shims::{BoundaryShims, CapsuleShims, RecordingShims, ShimCall};
