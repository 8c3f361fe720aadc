//! Capsule configuration

use capsule_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Objects whose GOT is never rewritten, matched by file-name prefix
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "libc.so",
    "ld-linux",
    "ld64.so",
    "libdl.so",
    "libpthread.so",
];

/// Capsule configuration
///
/// A capsule is identified by the target's path and a fixed list of symbols
/// the host may call in the shadow copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    /// Shared object to load into the isolated namespace
    pub target: PathBuf,

    /// Symbols the host is permitted to call directly
    #[serde(default)]
    pub exports: Vec<String>,

    /// Root of the host filesystem as seen from here (e.g. `/run/host`)
    #[serde(default)]
    pub prefix: Option<PathBuf>,

    /// Objects left alone when rewriting GOT slots
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,
}

fn default_exclusions() -> Vec<String> {
    DEFAULT_EXCLUSIONS.iter().map(ToString::to_string).collect()
}

impl CapsuleConfig {
    /// Create a configuration for `target` with no exports
    #[must_use]
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            exports: Vec::new(),
            prefix: None,
            exclusions: default_exclusions(),
        }
    }

    /// Build from a statically compiled symbol list
    #[must_use]
    pub fn from_static(target: &str, exports: &[&str]) -> Self {
        Self::new(target).with_exports(exports.iter().copied())
    }

    /// Parse a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Add one export
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>) -> Self {
        self.exports.push(name.into());
        self
    }

    /// Add several exports
    #[must_use]
    pub fn with_exports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exports.extend(names.into_iter().map(Into::into));
        self
    }

    /// Set the host filesystem prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Replace the relocation exclusion list
    #[must_use]
    pub fn with_exclusions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Check the configuration can be handed to the loader
    pub fn validate(&self) -> Result<()> {
        if self.target.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                message: "Capsule target cannot be empty".to_string(),
            });
        }

        for name in &self.exports {
            if name.is_empty() {
                return Err(Error::InvalidConfig {
                    message: "Export names cannot be empty".to_string(),
                });
            }
            if name.contains('\0') {
                return Err(Error::InvalidConfig {
                    message: format!("Export name contains NUL: {name:?}"),
                });
            }
        }

        if let Some(ref prefix) = self.prefix {
            if !prefix.is_absolute() {
                return Err(Error::InvalidConfig {
                    message: format!("Prefix must be absolute: {}", prefix.display()),
                });
            }
        }

        Ok(())
    }

    /// Map `path` onto the host filesystem prefix
    ///
    /// Absolute paths are tried under the prefix first and fall back to the
    /// path itself when the prefixed file does not exist. Bare sonames are
    /// left for the loader's search path.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if let Some(ref prefix) = self.prefix {
            if let Ok(relative) = path.strip_prefix("/") {
                let prefixed = prefix.join(relative);
                if prefixed.exists() {
                    return prefixed;
                }
            }
        }
        path.to_path_buf()
    }

    /// Path the loader should open for the target
    #[must_use]
    pub fn resolved_target(&self) -> PathBuf {
        self.resolve_path(&self.target)
    }

    /// Whether the target names a file rather than a soname to search for
    #[must_use]
    pub fn target_is_path(&self) -> bool {
        self.target.components().count() > 1
    }

    /// Export names as C strings
    pub fn export_cstrings(&self) -> Result<Vec<CString>> {
        self.exports
            .iter()
            .map(|name| {
                CString::new(name.as_str()).map_err(|e| Error::InvalidConfig {
                    message: format!("Invalid export name {name:?}: {e}"),
                })
            })
            .collect()
    }

    /// Whether `object` (a loader path) is on the exclusion list
    #[must_use]
    pub fn is_excluded(&self, object: &str) -> bool {
        let file_name = object.rsplit('/').next().unwrap_or(object);
        self.exclusions
            .iter()
            .any(|prefix| file_name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_pattern() {
        let config = CapsuleConfig::new("/usr/lib/libGL.so.1")
            .with_export("glXGetProcAddress")
            .with_exports(["glXSwapBuffers", "glXMakeCurrent"])
            .with_prefix("/run/host");

        assert_eq!(config.exports.len(), 3);
        assert_eq!(config.prefix.as_deref(), Some(Path::new("/run/host")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_static() {
        let config = CapsuleConfig::from_static("libm.so.6", &["cos", "sin"]);
        assert_eq!(config.exports, vec!["cos", "sin"]);
        assert!(!config.target_is_path());
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        assert!(CapsuleConfig::new("").validate().is_err());
        assert!(CapsuleConfig::new("libx.so").with_export("").validate().is_err());
        assert!(
            CapsuleConfig::new("libx.so")
                .with_export("a\0b")
                .validate()
                .is_err()
        );
        assert!(
            CapsuleConfig::new("libx.so")
                .with_prefix("relative/host")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_resolve_path_without_prefix() {
        let config = CapsuleConfig::new("/usr/lib/libfoo.so.1");
        assert_eq!(config.resolved_target(), PathBuf::from("/usr/lib/libfoo.so.1"));
    }

    #[test]
    fn test_resolve_path_falls_back_when_prefixed_missing() {
        let config = CapsuleConfig::new("/usr/lib/libfoo.so.1").with_prefix("/nonexistent-prefix");
        assert_eq!(config.resolved_target(), PathBuf::from("/usr/lib/libfoo.so.1"));
    }

    #[test]
    fn test_resolve_path_uses_existing_prefixed_file() {
        let prefix = std::env::temp_dir().join(format!("capsule-prefix-{}", std::process::id()));
        let lib_dir = prefix.join("usr/lib");
        std::fs::create_dir_all(&lib_dir).unwrap();
        std::fs::write(lib_dir.join("libfoo.so.1"), b"").unwrap();

        let config = CapsuleConfig::new("/usr/lib/libfoo.so.1").with_prefix(&prefix);
        assert_eq!(config.resolved_target(), lib_dir.join("libfoo.so.1"));

        std::fs::remove_dir_all(&prefix).unwrap();
    }

    #[test]
    fn test_exclusions() {
        let config = CapsuleConfig::new("libfoo.so");
        assert!(config.is_excluded("/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(config.is_excluded("/lib64/ld-linux-x86-64.so.2"));
        assert!(!config.is_excluded("/usr/lib/libfoo.so"));

        let config = config.with_exclusions(["libfoo"]);
        assert!(config.is_excluded("/usr/lib/libfoo.so"));
        assert!(!config.is_excluded("/lib/libc.so.6"));
    }

    #[test]
    fn test_json_defaults() {
        let config = CapsuleConfig::from_json(r#"{"target": "/usr/lib/libfoo.so.1"}"#).unwrap();
        assert!(config.exports.is_empty());
        assert!(config.prefix.is_none());
        assert_eq!(config.exclusions.len(), DEFAULT_EXCLUSIONS.len());
    }
}
