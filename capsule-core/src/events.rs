//! Boundary lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::{LoadFlags, NamespaceId, Provenance};

/// Events emitted while building and crossing a capsule boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoundaryEvent {
    /// Capsule namespace created and exports resolved
    CapsuleCreated {
        /// Target shared object
        target: String,
        /// Namespace the shadow library lives in
        namespace: NamespaceId,
        /// Load bias of the shadow library
        base: usize,
        /// Number of resolved exports
        exports: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Internal caller asked for a flag the namespace cannot honor
    FlagDowngraded {
        /// Library named by the caller
        library: String,
        /// Flags removed from the request
        dropped: LoadFlags,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A load went through one of the shims
    Loaded {
        /// Library named by the caller
        library: String,
        /// Which shim handled it
        origin: Provenance,
        /// Namespace the load targeted
        namespace: NamespaceId,
        /// Flags actually passed to the loader
        flags: LoadFlags,
        /// Whether the loader returned a handle
        succeeded: bool,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Deallocation fell back to the caller's own allocator
    AllocatorFallback {
        /// Pointer being released
        address: usize,
        /// Allocator that received it
        chosen: Provenance,
        /// Why provenance was not used
        reason: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// GOT slots of a loaded object were rewritten
    SlotsPatched {
        /// Object whose slots changed
        object: String,
        /// Number of slots rewritten
        slots: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl BoundaryEvent {
    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::CapsuleCreated { timestamp, .. }
            | Self::FlagDowngraded { timestamp, .. }
            | Self::Loaded { timestamp, .. }
            | Self::AllocatorFallback { timestamp, .. }
            | Self::SlotsPatched { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this event degrades behavior
    #[must_use]
    pub const fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::FlagDowngraded { .. } | Self::AllocatorFallback { .. }
        )
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::CapsuleCreated {
                target,
                namespace,
                base,
                exports,
                ..
            } => {
                tracing::info!(
                    target_library = %target,
                    namespace = %namespace,
                    base = format_args!("{base:#x}"),
                    exports,
                    event = "capsule_created",
                    "Capsule created"
                );
            }
            Self::FlagDowngraded {
                library, dropped, ..
            } => {
                tracing::warn!(
                    library = %library,
                    dropped = %dropped,
                    event = "flag_downgraded",
                    "Unsupported load flag dropped"
                );
            }
            Self::Loaded {
                library,
                origin,
                namespace,
                flags,
                succeeded,
                ..
            } => {
                tracing::debug!(
                    library = %library,
                    origin = %origin,
                    namespace = %namespace,
                    flags = %flags,
                    succeeded,
                    event = "loaded",
                    "Boundary load"
                );
            }
            Self::AllocatorFallback {
                address,
                chosen,
                reason,
                ..
            } => {
                tracing::trace!(
                    address = format_args!("{address:#x}"),
                    chosen = %chosen,
                    reason = %reason,
                    event = "allocator_fallback",
                    "Allocator provenance undetermined"
                );
            }
            Self::SlotsPatched { object, slots, .. } => {
                tracing::debug!(
                    object = %object,
                    slots,
                    event = "slots_patched",
                    "GOT slots rewritten"
                );
            }
        }
    }
}

impl fmt::Display for BoundaryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapsuleCreated {
                target, namespace, ..
            } => write!(f, "capsule for {target} created in {namespace}"),
            Self::FlagDowngraded {
                library, dropped, ..
            } => write!(
                f,
                "capsule: unsupported dlopen flag {dropped} for {library} ignored inside isolated namespace"
            ),
            Self::Loaded {
                library,
                origin,
                succeeded,
                ..
            } => {
                let outcome = if *succeeded { "loaded" } else { "failed" };
                write!(f, "{origin} load of {library} {outcome}")
            }
            Self::AllocatorFallback {
                address, chosen, ..
            } => write!(f, "{address:#x} released by {chosen} allocator"),
            Self::SlotsPatched { object, slots, .. } => {
                write!(f, "{slots} slot(s) rewritten in {object}")
            }
        }
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_downgrade_is_single_line() {
        let event = BoundaryEvent::FlagDowngraded {
            library: "libGLX_mesa.so.0".to_string(),
            dropped: LoadFlags::GLOBAL,
            timestamp: SystemTime::now(),
        };

        let line = event.to_string();
        assert!(!line.contains('\n'));
        assert!(line.contains("libGLX_mesa.so.0"));
        assert!(line.contains("RTLD_GLOBAL"));
        assert!(event.is_warning());
    }

    #[test]
    fn test_event_serde() {
        let event = BoundaryEvent::Loaded {
            library: "libz.so.1".to_string(),
            origin: Provenance::Capsule,
            namespace: NamespaceId::from_raw(1),
            flags: LoadFlags::NOW,
            succeeded: true,
            timestamp: SystemTime::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"loaded\""));
        assert!(json.contains("\"origin\":\"capsule\""));

        let deserialized: BoundaryEvent = serde_json::from_str(&json).unwrap();
        assert!(!deserialized.is_warning());
    }
}
