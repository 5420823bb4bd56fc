//! Validator and error collector.
//!
//! Each check is independent and either gating (`Severity::Error`, the row is
//! not persisted) or a flag (`Severity::Warning`, the row is stored as is).

use crate::error::{ErrorKind, Severity};
use crate::parsers::ObservationCandidate;
use crate::profile::{MetricCategory, RangeBound};
use crate::workbook::column_letter;
use serde::Serialize;
use std::collections::BTreeMap;

/// One structured diagnostic, persisted as an `ingest_error` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub sheet: Option<String>,
    /// 1-based spreadsheet row.
    pub row: Option<u32>,
    /// Column letter, e.g. `"C"`.
    pub column: Option<String>,
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn for_candidate(c: &ObservationCandidate, kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            sheet: Some(c.sheet.clone()),
            row: Some(c.row),
            column: c.column.checked_sub(1).map(column_letter),
            kind,
            severity,
            message: message.into(),
        }
    }

    /// Whole-sheet diagnostic, e.g. `unparseable_sheet`.
    pub fn for_sheet(sheet: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            sheet: Some(sheet.to_string()),
            row: None,
            column: None,
            kind,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    /// Batch-level diagnostic with no sheet, e.g. an unreadable workbook.
    pub fn for_batch(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            sheet: None,
            row: None,
            column: None,
            kind,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn is_gating(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Sanity bounds applied when a template gives no `range` of its own.
pub fn default_range(category: MetricCategory) -> Option<RangeBound> {
    let bound = |min: f64, max: f64| Some(RangeBound { min: Some(min), max: Some(max) });
    match category {
        MetricCategory::Price => bound(0.0, 100_000.0),
        MetricCategory::Volume => bound(0.0, 1e9),
        MetricCategory::Weight => bound(0.0, 1_000.0),
        MetricCategory::Ratio => bound(-100.0, 1_000.0),
        MetricCategory::Other => None,
    }
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verdict {
    pub diagnostics: Vec<Diagnostic>,
}

impl Verdict {
    /// False when any diagnostic is gating.
    pub fn keep(&self) -> bool {
        !self.diagnostics.iter().any(Diagnostic::is_gating)
    }
}

/// Checks that run before dimension resolution.
pub fn validate(c: &ObservationCandidate) -> Verdict {
    let mut diagnostics = Vec::new();
    let required = |field: &str| {
        Diagnostic::for_candidate(c, ErrorKind::MissingRequired, Severity::Error, format!("{} is missing", field))
    };

    if c.metric_key.trim().is_empty() || c.raw_header.trim().is_empty() {
        diagnostics.push(required("metric identity"));
    }
    if c.time().is_none() {
        diagnostics.push(required("observation date"));
    }

    match (c.value, &c.raw_value) {
        (None, None) => {
            let message = c.note.clone().unwrap_or_else(|| "cell has neither a value nor raw text".to_string());
            diagnostics.push(Diagnostic::for_candidate(c, ErrorKind::InvalidValue, Severity::Error, message));
        }
        (Some(v), _) => {
            if let Some(range) = c.range.or_else(|| default_range(c.category)) {
                if !range.contains(v) {
                    diagnostics.push(Diagnostic::for_candidate(
                        c,
                        ErrorKind::OutOfRange,
                        Severity::Warning,
                        format!("value {} outside [{}, {}]", v, fmt_bound(range.min), fmt_bound(range.max)),
                    ));
                }
            }
        }
        (None, Some(_)) => {}
    }

    Verdict { diagnostics }
}

fn fmt_bound(b: Option<f64>) -> String {
    b.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Check run after id resolution: every persisted row needs a dedup key.
pub fn check_dedup_key(c: &ObservationCandidate, key: Option<&str>) -> Option<Diagnostic> {
    match key {
        Some(k) if !k.is_empty() => None,
        _ => Some(Diagnostic::for_candidate(
            c,
            ErrorKind::MissingRequired,
            Severity::Error,
            "dedup key could not be computed",
        )),
    }
}

// =============================================================================
// ERROR COLLECTOR
// =============================================================================

/// Per-kind counters plus a bounded preview, stored on the batch row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub errors: usize,
    pub warnings: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub first: Vec<Diagnostic>,
}

/// Buffers diagnostics for the current sheet and hands them out at
/// end-of-sheet, while keeping batch-wide counts.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    pending: Vec<Diagnostic>,
    preview: Vec<Diagnostic>,
    preview_limit: usize,
    errors: usize,
    warnings: usize,
    by_kind: BTreeMap<ErrorKind, usize>,
}

impl ErrorCollector {
    pub fn new(preview_limit: usize) -> Self {
        Self {
            preview_limit,
            ..Self::default()
        }
    }

    pub fn push(&mut self, d: Diagnostic) {
        match d.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
        }
        *self.by_kind.entry(d.kind).or_insert(0) += 1;
        if self.preview.len() < self.preview_limit {
            self.preview.push(d.clone());
        }
        self.pending.push(d);
    }

    pub fn extend(&mut self, ds: impl IntoIterator<Item = Diagnostic>) {
        for d in ds {
            self.push(d);
        }
    }

    /// Diagnostics gathered since the last flush.
    pub fn flush(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.pending)
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn preview(&self) -> &[Diagnostic] {
        &self.preview
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            errors: self.errors,
            warnings: self.warnings,
            by_kind: self.by_kind.iter().map(|(k, v)| (k.as_str().to_string(), *v)).collect(),
            first: self.preview.clone(),
        }
    }
}
