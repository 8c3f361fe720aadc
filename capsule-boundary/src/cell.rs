//! Init-once storage for a capsule

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use capsule_core::{Error, Result};
use capsule_namespace::CapsuleConfig;
use tracing::{error, trace};

use crate::capsule::Capsule;

/// A capsule built on first use
///
/// Concurrent first callers block until the single construction finishes and
/// then all observe the same capsule, or the same error. A failed
/// construction is not retried.
#[derive(Debug)]
pub struct CapsuleCell {
    target: &'static str,
    exports: &'static [&'static str],
    slot: OnceLock<Result<Capsule>>,
    attempts: AtomicUsize,
}

impl CapsuleCell {
    /// Declare a capsule for `target` exposing `exports`
    #[must_use]
    pub const fn new(target: &'static str, exports: &'static [&'static str]) -> Self {
        Self {
            target,
            exports,
            slot: OnceLock::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Target the cell was declared with
    #[must_use]
    pub const fn target(&self) -> &'static str {
        self.target
    }

    /// Exports the cell was declared with
    #[must_use]
    pub const fn exports(&self) -> &'static [&'static str] {
        self.exports
    }

    /// The capsule, constructing it from the declaration if needed
    pub fn get(&self) -> std::result::Result<&Capsule, &Error> {
        self.get_or_create(|| CapsuleConfig::from_static(self.target, self.exports))
    }

    /// The capsule, constructing it from `config` if needed
    ///
    /// `config` is only called by the thread that performs construction.
    pub fn get_or_create(
        &self,
        config: impl FnOnce() -> CapsuleConfig,
    ) -> std::result::Result<&Capsule, &Error> {
        self.slot
            .get_or_init(|| {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                trace!(target_library = self.target, "Constructing capsule");
                Capsule::create(config()).inspect_err(|e| {
                    error!(target_library = self.target, error = %e, "Capsule unavailable");
                })
            })
            .as_ref()
    }

    /// The capsule if construction already succeeded
    ///
    /// Never triggers construction.
    #[must_use]
    pub fn get_if_ready(&self) -> Option<&Capsule> {
        self.slot.get().and_then(|result| result.as_ref().ok())
    }

    /// Whether construction has finished, successfully or not
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Number of constructions started
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}
