//! Core type definitions with strong typing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::{c_int, c_long};

/// Link-map namespace identifier (`Lmid_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct NamespaceId(c_long);

impl NamespaceId {
    /// The process's default namespace (`LM_ID_BASE`)
    pub const BASE: Self = Self(0);

    /// Request for a fresh namespace (`LM_ID_NEWLM`)
    pub const NEW: Self = Self(-1);

    /// Create from raw `Lmid_t`
    #[must_use]
    pub const fn from_raw(lmid: c_long) -> Self {
        Self(lmid)
    }

    /// Get raw `Lmid_t` value
    #[must_use]
    pub const fn as_raw(self) -> c_long {
        self.0
    }

    /// Whether this is the default namespace
    #[must_use]
    pub const fn is_base(self) -> bool {
        self.0 == Self::BASE.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lmid:{}", self.0)
    }
}

/// Where a boundary crossing originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Main program side (external-call shim)
    Host,
    /// Inside the isolated namespace (internal-call shim)
    Capsule,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Capsule => f.write_str("capsule"),
        }
    }
}

/// Dynamic loader open flags
///
/// Bits not named here are carried through untouched, so a value built from
/// a caller's raw flags converts back to exactly the same integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct LoadFlags(c_int);

impl LoadFlags {
    /// Resolve symbols on first use
    pub const LAZY: Self = Self(libc::RTLD_LAZY);
    /// Resolve all symbols at load time
    pub const NOW: Self = Self(libc::RTLD_NOW);
    /// Only return a handle if already loaded
    pub const NOLOAD: Self = Self(libc::RTLD_NOLOAD);
    /// Prefer the library's own symbols over global ones
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub const DEEPBIND: Self = Self(libc::RTLD_DEEPBIND);
    /// Prefer the library's own symbols over global ones (glibc only)
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub const DEEPBIND: Self = Self(0);
    /// Make symbols available to later loads
    pub const GLOBAL: Self = Self(libc::RTLD_GLOBAL);
    /// Keep symbols out of the global scope (zero on glibc)
    pub const LOCAL: Self = Self(libc::RTLD_LOCAL);
    /// Never unload
    pub const NODELETE: Self = Self(libc::RTLD_NODELETE);

    /// No flags
    pub const NONE: Self = Self(0);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::LAZY, "RTLD_LAZY"),
        (Self::NOW, "RTLD_NOW"),
        (Self::NOLOAD, "RTLD_NOLOAD"),
        (Self::DEEPBIND, "RTLD_DEEPBIND"),
        (Self::GLOBAL, "RTLD_GLOBAL"),
        (Self::NODELETE, "RTLD_NODELETE"),
    ];

    /// Create from raw flags as passed to `dlopen`
    #[must_use]
    pub const fn from_bits(bits: c_int) -> Self {
        Self(bits)
    }

    /// Get raw value
    #[must_use]
    pub const fn bits(self) -> c_int {
        self.0
    }

    /// Check if flag is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether any of `other`'s bits are set
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Clear `other`'s bits
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether no bits are set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::str::FromStr for LoadFlags {
    type Err = crate::Error;

    /// Parse `RTLD_NOW|RTLD_GLOBAL`; the prefix and case are optional and
    /// `,` separates as well as `|`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = Self::NONE;
        let mut seen = false;

        for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            let upper = part.to_ascii_uppercase();
            let name = upper.strip_prefix("RTLD_").unwrap_or(&upper);
            let flag = match name {
                "LOCAL" => Self::LOCAL,
                _ => Self::NAMED
                    .iter()
                    .find(|(_, named)| named.strip_prefix("RTLD_") == Some(name))
                    .map(|(flag, _)| *flag)
                    .ok_or_else(|| crate::Error::InvalidConfig {
                        message: format!("Unknown load flag: {part}"),
                    })?,
            };
            flags = flags | flag;
            seen = true;
        }

        if seen {
            Ok(flags)
        } else {
            Err(crate::Error::InvalidConfig {
                message: "No load flags given".to_string(),
            })
        }
    }
}

impl std::ops::BitOr for LoadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for LoadFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for LoadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0;
        let mut first = true;

        for (flag, name) in Self::NAMED {
            if flag.0 != 0 && self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                rest &= !flag.0;
                first = false;
            }
        }

        if rest != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{rest:#x}")?;
        } else if first {
            f.write_str("RTLD_LOCAL")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_flags_round_trip_raw() {
        let raw = libc::RTLD_NOW | libc::RTLD_GLOBAL | 0x4000_0000;
        assert_eq!(LoadFlags::from_bits(raw).bits(), raw);
    }

    #[test]
    fn test_load_flags_without_global() {
        let flags = LoadFlags::GLOBAL | LoadFlags::NOW;
        let stripped = flags.without(LoadFlags::GLOBAL);

        assert!(flags.contains(LoadFlags::GLOBAL));
        assert!(!stripped.intersects(LoadFlags::GLOBAL));
        assert!(stripped.contains(LoadFlags::NOW));
    }

    #[test]
    fn test_load_flags_display() {
        assert_eq!(
            (LoadFlags::NOW | LoadFlags::GLOBAL).to_string(),
            "RTLD_NOW|RTLD_GLOBAL"
        );
        assert_eq!(LoadFlags::NONE.to_string(), "RTLD_LOCAL");
        assert!(LoadFlags::from_bits(0x4000_0000).to_string().contains("0x40000000"));
    }

    #[test]
    fn test_namespace_id() {
        assert!(NamespaceId::BASE.is_base());
        assert!(!NamespaceId::from_raw(3).is_base());
        assert_eq!(NamespaceId::from_raw(3).to_string(), "lmid:3");
    }

    #[test]
    fn test_load_flags_from_str() {
        let flags: LoadFlags = "RTLD_GLOBAL|RTLD_NOW".parse().unwrap();
        assert_eq!(flags, LoadFlags::GLOBAL | LoadFlags::NOW);

        let flags: LoadFlags = "global, lazy".parse().unwrap();
        assert_eq!(flags, LoadFlags::GLOBAL | LoadFlags::LAZY);

        assert_eq!("local".parse::<LoadFlags>().unwrap(), LoadFlags::LOCAL);
        assert!("RTLD_SOMETIMES".parse::<LoadFlags>().is_err());
        assert!("".parse::<LoadFlags>().is_err());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_deepbind_matches_platform() {
        assert_eq!(LoadFlags::DEEPBIND.bits(), libc::RTLD_DEEPBIND);
        assert_eq!(LoadFlags::DEEPBIND.to_string(), "RTLD_DEEPBIND");
    }
}
