//! Diagnostics collected during export
//!
//! The export engine never owns a global logger. Every condition a caller may
//! care about (per-rule failures, per-definition aborts, warnings) is appended
//! to an explicit [`DiagnosticCollector`] that the embedder owns; `tracing`
//! events mirror the same information for ambient logging.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity levels for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational messages
    Info,
    /// Warnings that should be addressed
    Warning,
    /// Errors that must be fixed
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Source location of the FSH construct a diagnostic refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Source file the definition was parsed from
    pub file: String,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

/// A single diagnostic produced while exporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable identifier for the condition (e.g. "parent-not-defined")
    pub code: String,
    /// Severity level
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
    /// Location in the source file
    pub location: Location,
}

/// Stable diagnostic codes emitted by the engine
pub mod codes {
    pub const PARENT_NOT_PROVIDED: &str = "parent-not-provided";
    pub const PARENT_DECLARED_AS_SELF: &str = "parent-declared-as-self";
    pub const PARENT_NOT_DEFINED: &str = "parent-not-defined";
    pub const PARENT_KIND_MISMATCH: &str = "parent-kind-mismatch";
    pub const CIRCULAR_DEPENDENCY: &str = "circular-dependency";
    pub const NO_ELEMENT_AT_PATH: &str = "no-element-at-path";
    pub const CARDINALITY_NOT_NARROWING: &str = "cardinality-not-narrowing";
    pub const BINDING_STRENGTH_WIDENED: &str = "binding-strength-widened";
    pub const BINDING_KIND_MISMATCH: &str = "binding-kind-mismatch";
    pub const TYPE_NOT_SUBSET: &str = "type-not-subset";
    pub const SLICE_CONFLICT: &str = "slice-conflict";
    pub const DUPLICATE_SLICE: &str = "duplicate-slice";
    pub const INVALID_SLICE_TARGET: &str = "invalid-slice-target";
    pub const INVARIANT_NOT_FOUND: &str = "invariant-not-found";
    pub const VALUE_TYPE_MISMATCH: &str = "value-type-mismatch";
    pub const CONFLICTING_FIXED_VALUE: &str = "conflicting-fixed-value";
    pub const INVALID_PROPERTY_PATH: &str = "invalid-property-path";
    pub const INVALID_ELEMENT_NAME: &str = "invalid-element-name";
    pub const ADD_ELEMENT_NOT_ALLOWED: &str = "add-element-not-allowed";
    pub const EXTENSION_VALUE_CONFLICT: &str = "extension-value-conflict";
    pub const DUPLICATE_ARTIFACT_ID: &str = "duplicate-artifact-id";
    pub const UNRECOGNIZED_CHARACTERISTIC: &str = "unrecognized-characteristic-code";
    pub const CUSTOM_RESOURCE_NAMESPACE: &str = "non-conformant-resource-namespace";
    pub const EMPTY_METADATA: &str = "empty-metadata";
    pub const INSTANCE_NOT_FOUND: &str = "instance-not-found";
    pub const SLICE_TYPE_NOT_FOUND: &str = "slice-type-not-found";
    pub const RULE_NOT_APPLICABLE: &str = "rule-not-applicable";
    pub const EXPORT_FAILED: &str = "export-failed";
}

/// Append-only collector of diagnostics
///
/// Passed (by way of the export session) through every call that can fail per
/// rule. Callers decide whether to print, aggregate, or fail the build based
/// on the collected severities.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a diagnostic
    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Append an error diagnostic
    pub fn error(&mut self, code: &str, message: impl Into<String>, location: Location) {
        self.push(code, Severity::Error, message, location);
    }

    /// Append a warning diagnostic
    pub fn warning(&mut self, code: &str, message: impl Into<String>, location: Location) {
        self.push(code, Severity::Warning, message, location);
    }

    /// Append an info diagnostic
    pub fn info(&mut self, code: &str, message: impl Into<String>, location: Location) {
        self.push(code, Severity::Info, message, location);
    }

    fn push(&mut self, code: &str, severity: Severity, message: impl Into<String>, location: Location) {
        self.diagnostics.push(Diagnostic {
            code: code.to_string(),
            severity,
            message: message.into(),
            location,
        });
    }

    /// All collected diagnostics, in append order
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Diagnostics with the given code, in append order
    pub fn with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_collector_counts() {
        let mut collector = DiagnosticCollector::new();
        collector.error(codes::PARENT_NOT_DEFINED, "no such parent", Location::default());
        collector.warning(codes::DUPLICATE_SLICE, "slice re-declared", Location::default());
        collector.warning(codes::CIRCULAR_DEPENDENCY, "cycle", Location::default());

        assert_eq!(collector.error_count(), 1);
        assert_eq!(collector.warning_count(), 2);
        assert_eq!(collector.diagnostics().len(), 3);
    }

    #[test]
    fn test_with_code_preserves_order() {
        let mut collector = DiagnosticCollector::new();
        collector.error(codes::NO_ELEMENT_AT_PATH, "first", Location::new("a.fsh", 1, 1));
        collector.error(codes::NO_ELEMENT_AT_PATH, "second", Location::new("a.fsh", 2, 1));

        let messages: Vec<_> = collector
            .with_code(codes::NO_ELEMENT_AT_PATH)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn test_location_display() {
        let loc = Location::new("patient.fsh", 12, 3);
        assert_eq!(loc.to_string(), "patient.fsh:12:3");
        assert_eq!(Location::default().to_string(), "<unknown>");
    }
}
