//! Address ranges of loaded images

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open virtual address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address in the range
    pub start: usize,
    /// One past the last address
    pub end: usize,
}

impl AddressRange {
    /// Create a range, normalizing reversed bounds to empty
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        if end < start {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Size in bytes
    #[must_use]
    pub const fn len(self) -> usize {
        self.end - self.start
    }

    /// Whether the range covers nothing
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.start == self.end
    }

    /// Check whether `addr` falls inside the range
    #[must_use]
    pub const fn contains(self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Smallest range covering both
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Self::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}-{:#014x}", self.start, self.end)
    }
}

/// A shared object mapped into the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedImage {
    /// Path as recorded by the loader (empty for the main program)
    pub name: String,
    /// Load bias (`l_addr` / `dlpi_addr`)
    pub base: usize,
    /// Span of the image's `PT_LOAD` segments
    pub range: AddressRange,
}

impl LoadedImage {
    /// Whether `addr` points into this image
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.range.contains(addr)
    }

    /// Final path component, or the whole name
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Name suitable for display (`<main>` for the program itself)
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<main>"
        } else {
            &self.name
        }
    }
}

impl fmt::Display for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.range, self.display_name())
    }
}
