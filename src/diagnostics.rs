//! Non-fatal diagnostics
//!
//! Degraded-but-successful conditions (unmapped types, unnamed result columns,
//! skipped entities) are reported as structured records through a sink that
//! the caller hands to each component. Nothing here writes to a console.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// What kind of degraded condition a diagnostic describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    FallbackType,
    UnnamedColumn,
    SkippedEntity,
    Other,
}

/// A structured `{severity, entity, message}` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    /// Dotted path of the affected entity, e.g. `products.location`
    pub entity: String,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(kind: DiagnosticKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn info(kind: DiagnosticKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.entity, self.message)
    }
}

/// Receiver of diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Collects diagnostics in memory, in report order
#[derive(Debug, Default)]
pub struct Diagnostics {
    records: Mutex<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Number of collected diagnostics of one kind
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.lock().iter().filter(|d| d.kind == kind).count()
    }
}

impl DiagnosticSink for Diagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        self.records.lock().push(diagnostic);
    }
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => warn!(entity = ?diagnostic.entity, "{}", diagnostic.message),
            Severity::Info => info!(entity = ?diagnostic.entity, "{}", diagnostic.message),
        }
    }
}

/// Collects every diagnostic while passing it on to another sink
pub struct Tee {
    collected: Arc<Diagnostics>,
    next: Arc<dyn DiagnosticSink>,
}

impl Tee {
    pub fn new(collected: Arc<Diagnostics>, next: Arc<dyn DiagnosticSink>) -> Self {
        Self { collected, next }
    }
}

impl DiagnosticSink for Tee {
    fn report(&self, diagnostic: Diagnostic) {
        self.collected.report(diagnostic.clone());
        self.next.report(diagnostic);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&self, _diagnostic: Diagnostic) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_in_order() {
        let sink = Diagnostics::new();
        sink.report(Diagnostic::warning(
            DiagnosticKind::FallbackType,
            "products.location",
            "unmapped type: point",
        ));
        sink.report(Diagnostic::info(DiagnosticKind::UnnamedColumn, "Q", "column2"));

        let records = sink.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity, "products.location");
        assert_eq!(sink.count(DiagnosticKind::FallbackType), 1);
    }

    #[test]
    fn test_tee_collects_and_forwards() {
        let collected = Diagnostics::new();
        let downstream = Diagnostics::new();
        let tee = Tee::new(collected.clone(), downstream.clone());
        tee.report(Diagnostic::info(DiagnosticKind::Other, "q", "m"));
        assert_eq!(collected.len(), 1);
        assert_eq!(downstream.snapshot(), collected.snapshot());
    }

    #[test]
    fn test_display() {
        let d = Diagnostic::warning(DiagnosticKind::FallbackType, "t.c", "unmapped type: point");
        assert_eq!(d.to_string(), "warning: t.c: unmapped type: point");
    }
}
