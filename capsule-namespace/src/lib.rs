//! Link-map namespace isolation for shadow libraries
//!
//! This crate provides the loader-facing half of a capsule:
//! - Namespace loading - `dlmopen` of a target into a fresh link-map namespace
//! - Export resolution - eager, immutable symbol table for the host
//! - Image walking - address ranges of every loaded object
//! - Configuration - target path, exports and filesystem prefix

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod dl;
pub mod exports;
pub mod images;
pub mod loader;

pub use config::CapsuleConfig;
pub use dl::LinkMapEntry;
pub use exports::{ExportEntry, ExportTable};
pub use images::ObjectSegments;
pub use loader::{LinkMapNamespace, LoadedTarget, NamespaceLoader};
