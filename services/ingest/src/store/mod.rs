//! Warehouse persistence.
//!
//! `Warehouse` is the seam between the pipeline and storage. `PgWarehouse`
//! is the production implementation; `MemoryWarehouse` backs dry runs and
//! tests and enforces the same uniqueness rules.

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

use crate::detect::DatasetType;
use crate::error::StoreError;
use crate::profile::ProfileDocument;
use crate::tags::Tags;
use crate::validate::Diagnostic;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Batch row as created before any parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewBatch {
    pub batch_id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub uploader: Option<String>,
    pub dataset_type: DatasetType,
}

/// Everything written to the batch row at finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchCounters {
    pub total_rows: i64,
    pub success_rows: i64,
    pub failed_rows: i64,
    pub inserted: i64,
    pub updated: i64,
    pub skipped_rows: i64,
    pub sheets_total: i32,
    pub sheets_parsed: i32,
    pub sheets_skipped: i32,
    pub sheets_raw_only: i32,
    pub sheets_unmapped: i32,
    pub metrics_touched: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub source_code: Option<String>,
    pub profile_version: Option<i32>,
    pub raw_file_id: Option<Uuid>,
    pub date_min: Option<NaiveDate>,
    pub date_max: Option<NaiveDate>,
    pub duration_ms: i64,
    pub error_summary: serde_json::Value,
    pub resolved_mapping: serde_json::Value,
}

/// Immutable snapshot of the uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFileRecord {
    pub raw_file_id: Uuid,
    pub batch_id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub format: Option<String>,
    pub size_bytes: i64,
    pub bytes: Vec<u8>,
}

/// Per-sheet metadata plus the full cell grid (the raw table).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSheetRecord {
    pub sheet_index: i32,
    pub sheet_name: String,
    pub row_count: i32,
    pub col_count: i32,
    pub merge_count: i32,
    pub formula_count: i32,
    pub table: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProfile {
    pub dataset_type: DatasetType,
    pub version: i32,
    pub checksum: String,
    pub document: ProfileDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored { version: i32 },
    Unchanged { version: i32 },
}

/// Attributes used when a metric is created on first sight.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub metric_key: String,
    pub metric_name: String,
    pub raw_header: String,
    pub sheet_name: String,
    pub unit: Option<String>,
    pub freq: Option<String>,
    pub source_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRef {
    pub metric_id: i64,
    pub unit: Option<String>,
    /// Tag overrides carried by a metric alias.
    pub tags: Tags,
}

/// One fact row ready for insert-if-absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRow {
    pub dedup_key: String,
    pub metric_id: i64,
    pub obs_date: Option<NaiveDate>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub value: Option<f64>,
    pub raw_value: Option<String>,
    pub geo_id: Option<i64>,
    pub company_id: Option<i64>,
    pub warehouse_id: Option<i64>,
    pub tags: Tags,
    pub batch_id: Uuid,
    pub sheet: String,
    pub row: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkResult {
    pub inserted: u64,
    pub skipped: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn find_raw_file_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError>;

    /// File, sheets and tables in one transaction.
    async fn insert_raw_file(&self, file: &RawFileRecord, sheets: &[RawSheetRecord]) -> Result<(), StoreError>;

    async fn create_batch(&self, batch: &NewBatch) -> Result<(), StoreError>;

    async fn finalize_batch(&self, batch_id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError>;

    async fn latest_profile(&self, dataset_type: DatasetType) -> Result<Option<StoredProfile>, StoreError>;

    /// Append a profile version. Identical documents are a no-op; anything
    /// else must carry a strictly higher version than the latest one.
    async fn save_profile(&self, document: &ProfileDocument) -> Result<SaveOutcome, StoreError>;

    async fn resolve_metric_alias(&self, source_code: &str, alias: &str) -> Result<Option<MetricRef>, StoreError>;

    async fn get_or_create_metric(&self, spec: &MetricSpec) -> Result<MetricRef, StoreError>;

    /// Geo id by name or alias; with `create` an unknown name becomes a new region.
    async fn resolve_geo(&self, name: &str, create: bool) -> Result<Option<i64>, StoreError>;

    async fn get_or_create_company(&self, name: &str) -> Result<i64, StoreError>;

    async fn get_or_create_warehouse(&self, name: &str) -> Result<i64, StoreError>;

    /// Insert-if-absent by dedup key. The whole chunk commits or rolls back.
    async fn insert_facts(&self, rows: &[FactRow]) -> Result<ChunkResult, StoreError>;

    async fn append_errors(&self, batch_id: Uuid, errors: &[Diagnostic]) -> Result<(), StoreError>;

    async fn count_facts(&self) -> Result<i64, StoreError>;
}

/// Compile a document and check it against the latest stored version.
/// Returns `None` when the stored document is identical.
pub(crate) fn check_profile_version(
    document: &ProfileDocument,
    latest: Option<(i32, &str)>,
) -> Result<Option<String>, StoreError> {
    document.compile()?;
    let checksum = document.checksum()?;
    match latest {
        Some((_, stored)) if stored == checksum => Ok(None),
        Some((version, _)) if document.version <= version => Err(crate::error::ProfileError::StaleVersion {
            dataset_type: document.dataset_type.clone(),
            offered: document.version,
            stored: version,
        }
        .into()),
        _ => Ok(Some(checksum)),
    }
}
