//! Capsule Core - Foundation types, events, and errors
//!
//! This crate provides the vocabulary shared by every layer of the capsule
//! boundary: typed loader flags, link-map namespace ids, call-site provenance,
//! address ranges of loaded images, and the error type.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod ranges;
pub mod types;

pub use error::{Error, Result};
pub use events::BoundaryEvent;
pub use ranges::{AddressRange, LoadedImage};
pub use types::{LoadFlags, NamespaceId, Provenance};
