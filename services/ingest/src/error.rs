//! Error types and diagnostic kinds shared across the ingestion core.
//!
//! Two different things live here:
//! - `ErrorKind`/`Severity`: data-quality diagnostics. These are values that
//!   end up as `ingest_errors` rows, never propagated with `?`.
//! - `*Error` enums: real failures (bad bytes, bad configuration, database).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of diagnostic kinds recorded per rejected or flagged observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingRequired,
    InvalidValue,
    OutOfRange,
    Duplicate,
    UnitMismatch,
    RegionMismatch,
    UnparseableSheet,
    StorageFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingRequired => "missing_required",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::UnitMismatch => "unit_mismatch",
            ErrorKind::RegionMismatch => "region_mismatch",
            ErrorKind::UnparseableSheet => "unparseable_sheet",
            ErrorKind::StorageFailed => "storage_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Error` excludes the row from persistence, `Warning` keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// The uploaded bytes could not be opened as a workbook at all.
#[derive(Debug, thiserror::Error)]
pub enum WorkbookError {
    #[error("empty upload")]
    Empty,
    #[error("unsupported or corrupt workbook: {0}")]
    Open(String),
    #[error("failed to read sheet '{sheet}': {message}")]
    Sheet { sheet: String, message: String },
    #[error("csv decode failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Invalid ingest profile. Raised when a profile is loaded, never mid-batch.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile json is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown dataset type '{0}'")]
    UnknownDatasetType(String),
    #[error("sheet rule #{index}: {message}")]
    Sheet { index: usize, message: String },
    #[error("sheet rule '{sheet}', metric '{metric}': {message}")]
    Metric {
        sheet: String,
        metric: String,
        message: String,
    },
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("profile version {offered} for {dataset_type} is not newer than stored version {stored}")]
    StaleVersion {
        dataset_type: String,
        offered: i32,
        stored: i32,
    },
}

/// A sheet whose layout does not match what its profile expects.
/// The sheet degrades to zero candidates plus one `unparseable_sheet` diagnostic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SheetError {
    #[error("header row {row} is outside the sheet ({height} rows)")]
    HeaderOutOfBounds { row: u32, height: u32 },
    #[error("date column '{0}' not found in header")]
    DateColumnMissing(String),
    #[error("no configured metric header matched any column")]
    NoMetricColumns,
    #[error("no date-like cells found in row {0}")]
    NoDateGroups(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored profile is invalid: {0}")]
    Profile(#[from] ProfileError),
    #[error("{0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Only failures that make the whole import meaningless surface as this type.
/// Data-quality problems, including an unreadable workbook, are reported in the
/// batch summary instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
