//! Diagnostic reporting for quill.

use crate::span::{LineIndex, Location, Span};

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    /// An error that prevents execution.
    Error,
    /// A warning that doesn't prevent execution.
    Warning,
}

impl From<DiagnosticSeverity> for miette::Severity {
    fn from(severity: DiagnosticSeverity) -> Self {
        match severity {
            DiagnosticSeverity::Error => miette::Severity::Error,
            DiagnosticSeverity::Warning => miette::Severity::Warning,
        }
    }
}

/// A label attached to a diagnostic.
#[derive(Debug, Clone)]
pub struct Label {
    /// The span this label points to.
    pub span: Span,
    /// The label message.
    pub message: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

/// A diagnostic message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{title}")]
pub struct Diagnostic {
    /// Severity level.
    pub severity: DiagnosticSeverity,
    /// Error code.
    pub code: String,
    /// Short title.
    pub title: String,
    /// Detailed message.
    pub message: Option<String>,
    /// Labels pointing to source locations.
    pub labels: Vec<Label>,
}

impl Diagnostic {
    /// Creates a new error diagnostic.
    pub fn error(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            code: code.into(),
            title: title.into(),
            message: None,
            labels: Vec::new(),
        }
    }

    /// Creates a new warning diagnostic.
    pub fn warning(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            code: code.into(),
            title: title.into(),
            message: None,
            labels: Vec::new(),
        }
    }

    /// Adds a message to the diagnostic.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a primary label at a span.
    #[must_use]
    pub fn with_span(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::new(span, message));
        self
    }

    /// Returns the primary span, if any.
    pub fn primary_span(&self) -> Option<Span> {
        self.labels.first().map(|l| l.span)
    }

    /// Returns the line/column of every label, for GraphQL `locations`.
    pub fn locations(&self, index: &LineIndex) -> Vec<Location> {
        self.labels
            .iter()
            .map(|l| index.span_start(l.span))
            .collect()
    }

    /// Renders the diagnostic against its source text.
    pub fn to_report(&self, source: &str) -> miette::Report {
        let labels = self.labels.iter().map(|l| {
            miette::LabeledSpan::new_with_span(Some(l.message.clone()), l.span)
        });
        let mut diagnostic = miette::MietteDiagnostic::new(self.title.clone())
            .with_code(self.code.clone())
            .with_severity(self.severity.into())
            .with_labels(labels);
        if let Some(message) = &self.message {
            diagnostic = diagnostic.with_help(message.clone());
        }
        miette::Report::new(diagnostic).with_source_code(source.to_string())
    }
}

/// A collection of diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticBag {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    /// Creates a new empty diagnostic bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a diagnostic.
    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Adds an error diagnostic.
    pub fn error(
        &mut self,
        code: impl Into<String>,
        title: impl Into<String>,
        span: Span,
        message: impl Into<String>,
    ) {
        self.add(Diagnostic::error(code, title).with_span(span, message));
    }

    /// Returns true if there are any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns the number of errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    /// Returns an iterator over all diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Returns an iterator over errors.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns true if there are no diagnostics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Returns the number of diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }
}

impl IntoIterator for DiagnosticBag {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

/// Common diagnostic codes.
pub mod codes {
    pub const UNEXPECTED_TOKEN: &str = "E0001";
    pub const UNEXPECTED_EOF: &str = "E0002";
    pub const INVALID_SYNTAX: &str = "E0003";
    pub const INVALID_STRING: &str = "E0004";
    pub const INVALID_NUMBER: &str = "E0005";
    pub const NESTING_TOO_DEEP: &str = "E0006";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_bag() {
        let mut bag = DiagnosticBag::new();
        bag.error("E001", "test error", Span::new(0, 10), "details");

        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
    }

    #[test]
    fn test_diagnostic_creation() {
        let diag = Diagnostic::error("E001", "Test")
            .with_message("Details")
            .with_span(Span::new(0, 5), "here");

        assert_eq!(diag.severity, DiagnosticSeverity::Error);
        assert_eq!(diag.primary_span(), Some(Span::new(0, 5)));
        assert_eq!(diag.to_string(), "Test");
    }

    #[test]
    fn test_diagnostic_locations() {
        let source = "{\n  foo(\n}";
        let index = LineIndex::new(source);
        let diag = Diagnostic::error(codes::UNEXPECTED_TOKEN, "unexpected token")
            .with_span(Span::new(9, 10), "expected name");

        assert_eq!(diag.locations(&index), vec![Location::new(3, 1)]);
    }

    #[test]
    fn test_diagnostic_report_mentions_title() {
        let diag = Diagnostic::error(codes::INVALID_SYNTAX, "expected value")
            .with_span(Span::new(2, 3), "here");
        let report = diag.to_report("{ ) }");
        assert!(format!("{report}").contains("expected value"));
    }
}
