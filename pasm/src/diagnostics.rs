//! Structured diagnostics collected over a single assembly run.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assemble::{AsmError, ErrorKind};

/// How serious a diagnostic is. Variants are ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    /// Invalidates the output of the run.
    Fatal,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown severity `{0}` (expected info, warning, error or fatal)")]
pub struct ParseSeverityError(String);

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(ParseSeverityError(s.to_owned())),
        }
    }
}

/// The pipeline stage that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Lexer,
    Parser,
    Resolver,
    Encoder,
}

/// A 1-based line and column in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl SourcePos {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub source: String,
    pub pos: SourcePos,
    pub severity: Severity,
    pub component: Component,
    /// Absent for plain notes that do not belong to the error taxonomy.
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.source, self.pos.line, self.pos.column, self.severity, self.message
        )
    }
}

/// Escalation rules applied when a diagnostic is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub warnings_as_errors: bool,
    /// Report `EncodingRangeError` as fatal instead of error.
    pub fatal_range_errors: bool,
}

impl Policy {
    fn escalate(&self, kind: Option<ErrorKind>, severity: Severity) -> Severity {
        match (kind, severity) {
            (Some(ErrorKind::EncodingRange), Severity::Error) if self.fatal_range_errors => {
                Severity::Fatal
            }
            (_, Severity::Warning) if self.warnings_as_errors => Severity::Error,
            _ => severity,
        }
    }
}

/// Append-only record of everything reported during one run.
///
/// Everything is kept; the threshold only controls what [`DiagnosticLog::visible`]
/// hands back, so pass/fail never depends on it.
#[derive(Debug)]
pub struct DiagnosticLog {
    source: String,
    threshold: Severity,
    policy: Policy,
    entries: Vec<Diagnostic>,
}

impl DiagnosticLog {
    pub fn new(source: impl Into<String>, threshold: Severity, policy: Policy) -> Self {
        Self {
            source: source.into(),
            threshold,
            policy,
            entries: Vec::new(),
        }
    }

    /// Records an error from the taxonomy at its default severity.
    pub fn report(&mut self, component: Component, pos: SourcePos, error: AsmError) {
        let severity = error.default_severity();
        self.report_as(severity, component, pos, error);
    }

    pub fn report_as(
        &mut self,
        severity: Severity,
        component: Component,
        pos: SourcePos,
        error: AsmError,
    ) {
        self.push(severity, component, pos, Some(error.kind()), error.to_string());
    }

    pub fn warn(&mut self, component: Component, pos: SourcePos, message: impl Into<String>) {
        self.push(Severity::Warning, component, pos, None, message.into());
    }

    pub fn info(&mut self, component: Component, pos: SourcePos, message: impl Into<String>) {
        self.push(Severity::Info, component, pos, None, message.into());
    }

    fn push(
        &mut self,
        severity: Severity,
        component: Component,
        pos: SourcePos,
        kind: Option<ErrorKind>,
        message: String,
    ) {
        let diagnostic = Diagnostic {
            source: self.source.clone(),
            pos,
            severity: self.policy.escalate(kind, severity),
            component,
            kind,
            message,
        };
        tracing::trace!(%diagnostic, "recorded diagnostic");
        self.entries.push(diagnostic);
    }

    /// All recorded diagnostics, whatever their severity.
    pub fn all(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Diagnostics at or above the configured threshold, in report order.
    pub fn visible(&self) -> Vec<Diagnostic> {
        filter(&self.entries, self.threshold)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// True if anything at error severity or above was recorded.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity >= Severity::Error)
    }

    pub fn has_fatal(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Fatal)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps the diagnostics whose severity is at least `threshold`.
pub fn filter(diagnostics: &[Diagnostic], threshold: Severity) -> Vec<Diagnostic> {
    diagnostics
        .iter()
        .filter(|d| d.severity >= threshold)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::AsmError;

    fn log(threshold: Severity) -> DiagnosticLog {
        DiagnosticLog::new("test.s", threshold, Policy::default())
    }

    #[test]
    fn renders_in_compiler_style() {
        let mut log = log(Severity::Info);
        log.report(
            Component::Encoder,
            SourcePos::new(3, 7),
            AsmError::UnresolvedSymbol("LOOP".to_owned()),
        );
        assert_eq!(
            log.all()[0].to_string(),
            "test.s:3:7: fatal: undefined symbol `LOOP`"
        );
    }

    #[test]
    fn filtering_warnings_at_fatal_is_empty_and_keeps_status() {
        let mut log = log(Severity::Fatal);
        log.warn(Component::Resolver, SourcePos::new(1, 1), "first");
        log.warn(Component::Encoder, SourcePos::new(2, 1), "second");
        assert!(log.visible().is_empty());
        assert!(filter(&filter(log.all(), Severity::Fatal), Severity::Fatal).is_empty());
        assert!(!log.has_errors());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn threshold_hides_but_still_fails() {
        let mut log = log(Severity::Fatal);
        log.report(
            Component::Parser,
            SourcePos::new(1, 1),
            AsmError::Syntax("unexpected `,`".to_owned()),
        );
        assert!(log.visible().is_empty());
        assert!(log.has_errors());
        assert!(!log.has_fatal());
    }

    #[test]
    fn policy_escalates() {
        let mut log = DiagnosticLog::new(
            "x.s",
            Severity::Info,
            Policy {
                warnings_as_errors: true,
                fatal_range_errors: true,
            },
        );
        log.warn(Component::Encoder, SourcePos::new(1, 1), "wraps");
        log.report(
            Component::Encoder,
            SourcePos::new(2, 1),
            AsmError::EncodingRange("300 does not fit".to_owned()),
        );
        assert_eq!(log.all()[0].severity, Severity::Error);
        assert_eq!(log.all()[1].severity, Severity::Fatal);
    }

    #[test]
    fn severity_round_trips_through_text() {
        for severity in [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Fatal,
        ] {
            assert_eq!(severity.to_string().parse::<Severity>(), Ok(severity));
        }
        assert!("loud".parse::<Severity>().is_err());
        assert!(Severity::Info < Severity::Warning && Severity::Error < Severity::Fatal);
    }
}
