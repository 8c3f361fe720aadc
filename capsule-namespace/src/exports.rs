//! Eagerly resolved export table of a capsule

use std::collections::BTreeMap;
use std::ffi::{CStr, c_void};
use std::ptr::NonNull;

use capsule_core::{Error, LoadedImage, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CapsuleConfig;
use crate::loader::LinkMapNamespace;

/// One resolved export, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    /// Symbol name
    pub name: String,
    /// Resolved address in the shadow library
    pub address: usize,
}

/// Symbols the host may call directly inside a capsule
///
/// Built once at capsule construction and never modified afterwards, so it is
/// shared between threads without locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTable {
    target: String,
    entries: BTreeMap<String, usize>,
}

impl ExportTable {
    /// Resolve every export of `config` in the namespace
    ///
    /// A symbol that is absent, or that is only provided by one of the
    /// target's dependencies, fails the whole table.
    pub fn resolve(
        config: &CapsuleConfig,
        namespace: &LinkMapNamespace,
        image: &LoadedImage,
    ) -> Result<Self> {
        let names = config.export_cstrings()?;
        Self::resolve_with(image, &names, |name| namespace.symbol(name))
    }

    /// Resolve `names` with an arbitrary lookup
    pub fn resolve_with<F>(image: &LoadedImage, names: &[impl AsRef<CStr>], mut lookup: F) -> Result<Self>
    where
        F: FnMut(&CStr) -> Option<NonNull<c_void>>,
    {
        let target = image.display_name().to_string();
        let mut entries = BTreeMap::new();

        for name in names {
            let name = name.as_ref();
            let symbol = name.to_string_lossy().into_owned();

            if entries.contains_key(&symbol) {
                continue;
            }

            let address = lookup(name).ok_or_else(|| Error::MissingSymbol {
                symbol: symbol.clone(),
                target: target.clone(),
                reason: "not found".to_string(),
            })?;
            let address = address.as_ptr() as usize;

            if !image.contains(address) {
                return Err(Error::MissingSymbol {
                    symbol,
                    target,
                    reason: format!("resolves to {address:#x}, outside {}", image.range),
                });
            }

            debug!(symbol = %symbol, address = format_args!("{address:#x}"), "Export resolved");
            entries.insert(symbol, address);
        }

        Ok(Self { target, entries })
    }

    /// Address of an export
    #[must_use]
    pub fn get(&self, name: &str) -> Option<NonNull<c_void>> {
        self.entries
            .get(name)
            .and_then(|&address| NonNull::new(address as *mut c_void))
    }

    /// Address of an export as an integer
    #[must_use]
    pub fn address(&self, name: &str) -> Option<usize> {
        self.entries.get(name).copied()
    }

    /// Whether `name` is exported
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of exports
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Library the exports live in
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Exports in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(name, &address)| (name.as_str(), address))
    }

    /// Owned copy for serialization
    #[must_use]
    pub fn entries(&self) -> Vec<ExportEntry> {
        self.iter()
            .map(|(name, address)| ExportEntry {
                name: name.to_string(),
                address,
            })
            .collect()
    }
}
