//! Where boundary warnings go

use std::io::Write;
use std::sync::Mutex;

use capsule_core::BoundaryEvent;

/// Receives events raised while crossing the boundary
pub trait DiagnosticSink: Send + Sync {
    /// Report one event
    fn report(&self, event: &BoundaryEvent);
}

/// Writes user-facing warnings to stderr, one line each
///
/// Everything else only goes to tracing. A flag downgrade is written with a
/// single `write` so lines from concurrent loads do not interleave.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl StderrSink {
    /// The line written for `event`, if it is user-facing
    #[must_use]
    pub fn line(event: &BoundaryEvent) -> Option<String> {
        matches!(event, BoundaryEvent::FlagDowngraded { .. }).then(|| format!("{event}\n"))
    }
}

impl DiagnosticSink for StderrSink {
    fn report(&self, event: &BoundaryEvent) {
        match Self::line(event) {
            Some(line) => {
                let _ = std::io::stderr().lock().write_all(line.as_bytes());
            }
            None => event.emit_trace(),
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<BoundaryEvent>>,
}

impl MemorySink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    #[must_use]
    pub fn events(&self) -> Vec<BoundaryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded warnings
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_warning()).count()
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, event: &BoundaryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::{LoadFlags, NamespaceId, Provenance};
    use std::time::SystemTime;

    #[test]
    fn test_memory_sink_records() {
        let sink = MemorySink::new();
        sink.report(&BoundaryEvent::FlagDowngraded {
            library: "libfoo.so".to_string(),
            dropped: LoadFlags::GLOBAL,
            timestamp: SystemTime::now(),
        });
        sink.report(&BoundaryEvent::Loaded {
            library: "libfoo.so".to_string(),
            origin: Provenance::Capsule,
            namespace: NamespaceId::from_raw(1),
            flags: LoadFlags::NOW,
            succeeded: true,
            timestamp: SystemTime::now(),
        });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.warning_count(), 1);
    }

    #[test]
    fn test_stderr_line_only_for_downgrades() {
        let line = StderrSink::line(&BoundaryEvent::FlagDowngraded {
            library: "libbar.so".to_string(),
            dropped: LoadFlags::GLOBAL,
            timestamp: SystemTime::now(),
        })
        .unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
        assert!(line.contains("libbar.so"));
        assert!(line.contains("RTLD_GLOBAL"));

        let patched = BoundaryEvent::SlotsPatched {
            object: "libbar.so".to_string(),
            slots: 2,
            timestamp: SystemTime::now(),
        };
        assert!(StderrSink::line(&patched).is_none());
        StderrSink.report(&patched);
    }
}
