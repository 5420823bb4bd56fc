//! Batch orchestrator.
//!
//! One import is a sequential walk: create the batch, snapshot the raw bytes,
//! load the profile, then for every sheet dispatch, parse, validate, resolve
//! ids and upsert in chunks. Row and sheet failures become diagnostics. A
//! storage failure outside a fact chunk fails the batch, which is still
//! finalized; only a failure to create or finalize the batch is returned.

use crate::detect::{detect_opened, DatasetType};
use crate::dispatch::{DispatchDecision, Dispatcher, SheetAction};
use crate::error::{ErrorKind, PipelineError, Severity, StoreError, WorkbookError};
use crate::parsers::{parse_sheet, ObservationCandidate, ParseContext, ParseInput};
use crate::profile::GeoStrategy;
use crate::progress::ProgressSink;
use crate::raw::{content_hash, RawLayerWriter};
use crate::store::{BatchCounters, BatchOutcome, BatchStatus, FactRow, MetricRef, MetricSpec, NewBatch, Warehouse};
use crate::tags::{dedup_key, merge_layers, normalize_tags, DimensionIds, ObservationTime};
use crate::validate::{check_dedup_key, validate, Diagnostic, ErrorCollector};
use crate::workbook::{Sheet, Workbook, MAX_SHEET_CELLS, MAX_SHEET_COLS, MAX_SHEET_ROWS};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_ERROR_PREVIEW: usize = 200;

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Declared dataset type; detected from the upload when absent.
    pub dataset_type: Option<DatasetType>,
    pub uploader: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub total_rows: i64,
    pub success_rows: i64,
    pub failed_rows: i64,
    pub inserted: i64,
    pub updated: i64,
    pub skipped: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub dataset_type: DatasetType,
    pub summary: ImportSummary,
    pub errors: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub error_preview: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            error_preview: DEFAULT_ERROR_PREVIEW,
        }
    }
}

/// `fatal` covers batch-level failures (unreadable workbook, no profile).
/// `failures` counts failed rows plus sheets that could not be parsed.
pub fn compute_status(fatal: bool, success_rows: i64, failures: i64) -> BatchStatus {
    if fatal {
        BatchStatus::Failed
    } else if failures == 0 {
        BatchStatus::Success
    } else if success_rows == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Partial
    }
}

/// Rows waiting for the next chunk commit, with their anchor dates.
#[derive(Default)]
struct Chunk {
    rows: Vec<FactRow>,
    dates: Vec<Option<NaiveDate>>,
}

/// Mutable bookkeeping for one batch.
struct BatchState {
    batch_id: Uuid,
    fatal: bool,
    counters: BatchCounters,
    collector: ErrorCollector,
    unparseable_sheets: i64,
    source_code: Option<String>,
    profile_version: Option<i32>,
    raw_file_id: Option<Uuid>,
    date_min: Option<NaiveDate>,
    date_max: Option<NaiveDate>,
    decisions: Vec<DispatchDecision>,
    metrics: HashMap<(String, String), MetricRef>,
    geos: HashMap<(String, bool), Option<i64>>,
    companies: HashMap<String, i64>,
    warehouses: HashMap<String, i64>,
}

impl BatchState {
    fn new(batch_id: Uuid, error_preview: usize) -> Self {
        Self {
            batch_id,
            fatal: false,
            counters: BatchCounters::default(),
            collector: ErrorCollector::new(error_preview),
            unparseable_sheets: 0,
            source_code: None,
            profile_version: None,
            raw_file_id: None,
            date_min: None,
            date_max: None,
            decisions: Vec::new(),
            metrics: HashMap::new(),
            geos: HashMap::new(),
            companies: HashMap::new(),
            warehouses: HashMap::new(),
        }
    }

    fn observe_date(&mut self, date: Option<NaiveDate>) {
        let Some(d) = date else { return };
        self.date_min = Some(self.date_min.map_or(d, |m| m.min(d)));
        self.date_max = Some(self.date_max.map_or(d, |m| m.max(d)));
    }
}

pub struct Pipeline<'a, W: Warehouse + ?Sized, P: ProgressSink + ?Sized> {
    warehouse: &'a W,
    progress: &'a P,
    options: PipelineOptions,
}

impl<'a, W, P> Pipeline<'a, W, P>
where
    W: Warehouse + ?Sized,
    P: ProgressSink + ?Sized,
{
    pub fn new(warehouse: &'a W, progress: &'a P, options: PipelineOptions) -> Self {
        Self {
            warehouse,
            progress,
            options: PipelineOptions {
                chunk_size: options.chunk_size.max(1),
                ..options
            },
        }
    }

    pub async fn import(&self, request: &ImportRequest) -> Result<ImportResponse, PipelineError> {
        let opened = Workbook::from_bytes(&request.bytes, &request.filename);
        self.import_workbook(request, opened).await
    }

    /// Import with an already decoded workbook (or the error decoding it).
    pub async fn import_workbook(
        &self,
        request: &ImportRequest,
        opened: Result<Workbook, WorkbookError>,
    ) -> Result<ImportResponse, PipelineError> {
        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let hash = content_hash(&request.bytes);
        let dataset_type = request
            .dataset_type
            .unwrap_or_else(|| detect_opened(&request.filename, opened.as_ref()).dataset_type);

        self.warehouse
            .create_batch(&NewBatch {
                batch_id,
                filename: request.filename.clone(),
                content_hash: hash.clone(),
                uploader: request.uploader.clone(),
                dataset_type,
            })
            .await?;
        tracing::info!(%batch_id, filename = %request.filename, %dataset_type, hash = %hash, "batch created");

        let mut state = BatchState::new(batch_id, self.options.error_preview);
        if let Err(e) = self.run_batch(&mut state, request, &hash, dataset_type, opened).await {
            tracing::error!(%batch_id, error = %e, "storage failed, failing batch");
            state.fatal = true;
            state
                .collector
                .push(Diagnostic::for_batch(ErrorKind::StorageFailed, format!("storage failed: {}", e)));
        }

        self.finish(state, dataset_type, started).await
    }

    /// Everything between batch creation and finalization.
    async fn run_batch(
        &self,
        state: &mut BatchState,
        request: &ImportRequest,
        hash: &str,
        dataset_type: DatasetType,
        opened: Result<Workbook, WorkbookError>,
    ) -> Result<(), PipelineError> {
        let batch_id = state.batch_id;
        let raw = RawLayerWriter::new(self.warehouse)
            .write(batch_id, &request.filename, &request.bytes, hash, opened.as_ref().ok())
            .await?;
        state.raw_file_id = Some(raw.raw_file_id());

        match opened {
            Ok(workbook) => {
                self.progress.batch_started(batch_id, &request.filename, workbook.sheets.len());
                self.run_sheets(state, dataset_type, &workbook).await?;
            }
            Err(e) => {
                tracing::warn!(%batch_id, error = %e, "workbook could not be opened");
                self.progress.batch_started(batch_id, &request.filename, 0);
                state.fatal = true;
                state.collector.push(Diagnostic::for_batch(
                    ErrorKind::UnparseableSheet,
                    format!("workbook could not be opened: {}", e),
                ));
            }
        }
        Ok(())
    }

    async fn run_sheets(&self, state: &mut BatchState, dataset_type: DatasetType, workbook: &Workbook) -> Result<(), PipelineError> {
        state.counters.sheets_total = workbook.sheets.len() as i32;

        let Some(stored) = self.warehouse.latest_profile(dataset_type).await? else {
            tracing::warn!(batch_id = %state.batch_id, %dataset_type, "no ingest profile stored");
            state.fatal = true;
            state.collector.push(Diagnostic::for_batch(
                ErrorKind::MissingRequired,
                format!("no ingest profile stored for dataset type {}", dataset_type),
            ));
            return Ok(());
        };
        let profile = match stored.document.compile() {
            Ok(profile) => profile,
            Err(e) => {
                state.fatal = true;
                state.collector.push(Diagnostic::for_batch(
                    ErrorKind::UnparseableSheet,
                    format!("stored profile v{} does not compile: {}", stored.version, e),
                ));
                return Ok(());
            }
        };
        state.profile_version = Some(profile.version);
        state.source_code = Some(profile.source_code.clone());

        let dispatcher = Dispatcher::new(&profile);
        let mut ctx = ParseContext::new();
        for sheet in &workbook.sheets {
            let (action, decision) = dispatcher.dispatch(&sheet.name);
            state.decisions.push(decision);
            let mut candidates = 0;
            match action {
                SheetAction::Skip => state.counters.sheets_skipped += 1,
                SheetAction::RawTableOnly => state.counters.sheets_raw_only += 1,
                SheetAction::Unmapped => {
                    tracing::info!(batch_id = %state.batch_id, sheet = %sheet.name, "sheet not mapped by profile");
                    state.counters.sheets_unmapped += 1;
                }
                SheetAction::Parse(_) if sheet.load_error.is_some() => {
                    let reason = sheet.load_error.as_deref().unwrap_or_default();
                    tracing::warn!(batch_id = %state.batch_id, sheet = %sheet.name, error = %reason, "sheet unreadable");
                    state.unparseable_sheets += 1;
                    state
                        .collector
                        .push(Diagnostic::for_sheet(&sheet.name, ErrorKind::UnparseableSheet, reason));
                }
                SheetAction::Parse(rule) => {
                    if sheet.truncated {
                        state.collector.push(Diagnostic {
                            severity: Severity::Warning,
                            ..Diagnostic::for_sheet(
                                &sheet.name,
                                ErrorKind::OutOfRange,
                                format!(
                                    "sheet exceeds {} rows, {} columns or {} cells; cells beyond were not read",
                                    MAX_SHEET_ROWS, MAX_SHEET_COLS, MAX_SHEET_CELLS
                                ),
                            )
                        });
                    }
                    let input = ParseInput {
                        sheet,
                        rule,
                        profile: &profile,
                        batch_id: state.batch_id,
                    };
                    let parsed = parse_sheet(&mut ctx, &input);
                    ctx.merges.invalidate(&sheet.key);
                    match parsed {
                        Ok(found) => {
                            state.counters.sheets_parsed += 1;
                            candidates = found.len();
                            self.persist_sheet(state, sheet, found).await;
                        }
                        Err(e) => {
                            tracing::warn!(batch_id = %state.batch_id, sheet = %sheet.name, error = %e, "sheet unparseable");
                            state.unparseable_sheets += 1;
                            state
                                .collector
                                .push(Diagnostic::for_sheet(&sheet.name, ErrorKind::UnparseableSheet, e.to_string()));
                        }
                    }
                }
            }

            let errors = state.collector.flush();
            self.warehouse.append_errors(state.batch_id, &errors).await?;
            self.progress.sheet_finished(state.batch_id, &sheet.name, candidates, errors.len());
        }
        ctx.merges.clear();
        Ok(())
    }

    /// Validate, resolve and upsert one sheet's candidates. Never fails:
    /// storage problems on a row or chunk are recorded as diagnostics.
    async fn persist_sheet(&self, state: &mut BatchState, sheet: &Sheet, candidates: Vec<ObservationCandidate>) {
        state.counters.total_rows += candidates.len() as i64;
        let mut chunk = Chunk::default();
        for c in &candidates {
            let verdict = validate(c);
            let keep = verdict.keep();
            state.collector.extend(verdict.diagnostics);
            if !keep {
                state.counters.failed_rows += 1;
                continue;
            }
            match self.resolve(state, c).await {
                Ok(Some(row)) => {
                    chunk.rows.push(row);
                    chunk.dates.push(c.anchor_date());
                    if chunk.rows.len() >= self.options.chunk_size {
                        self.commit_chunk(state, &mut chunk).await;
                    }
                }
                Ok(None) => state.counters.failed_rows += 1,
                Err(e) => {
                    state.counters.failed_rows += 1;
                    state.collector.push(Diagnostic::for_candidate(
                        c,
                        ErrorKind::StorageFailed,
                        Severity::Error,
                        format!("dimension lookup failed: {}", e),
                    ));
                }
            }
        }
        self.commit_chunk(state, &mut chunk).await;
        tracing::debug!(batch_id = %state.batch_id, sheet = %sheet.name, candidates = candidates.len(), "sheet persisted");
    }

    async fn commit_chunk(&self, state: &mut BatchState, chunk: &mut Chunk) {
        if chunk.rows.is_empty() {
            return;
        }
        let n = chunk.rows.len() as i64;
        match self.warehouse.insert_facts(&chunk.rows).await {
            Ok(result) => {
                state.counters.success_rows += n;
                state.counters.inserted += result.inserted as i64;
                state.counters.skipped_rows += result.skipped as i64;
                for date in std::mem::take(&mut chunk.dates) {
                    state.observe_date(date);
                }
                self.progress.chunk_committed(state.batch_id, result.inserted, result.skipped);
            }
            Err(e) => {
                state.counters.failed_rows += n;
                let first = &chunk.rows[0];
                let last = &chunk.rows[chunk.rows.len() - 1];
                tracing::warn!(batch_id = %state.batch_id, sheet = %first.sheet, rows = n, error = %e, "chunk rolled back");
                state.collector.push(Diagnostic {
                    sheet: Some(first.sheet.clone()),
                    row: Some(first.row as u32),
                    column: None,
                    kind: ErrorKind::StorageFailed,
                    severity: Severity::Error,
                    message: format!("chunk of {} rows (rows {}-{}) rolled back: {}", n, first.row, last.row, e),
                });
            }
        }
        chunk.rows.clear();
        chunk.dates.clear();
    }

    /// Ids and dedup key for one valid candidate. `Ok(None)` means the row
    /// was rejected and its diagnostic already recorded.
    async fn resolve(&self, state: &mut BatchState, c: &ObservationCandidate) -> Result<Option<FactRow>, StoreError> {
        let Some(time) = c.time() else {
            state.collector.push(Diagnostic::for_candidate(
                c,
                ErrorKind::MissingRequired,
                Severity::Error,
                "observation date is missing",
            ));
            return Ok(None);
        };

        let metric = self.metric_for(state, c).await?;
        if let (Some(found), Some(expected)) = (&c.unit, &metric.unit) {
            if found.trim() != expected.trim() {
                state.collector.push(Diagnostic::for_candidate(
                    c,
                    ErrorKind::UnitMismatch,
                    Severity::Warning,
                    format!("unit '{}' differs from metric unit '{}'", found, expected),
                ));
            }
        }

        let geo_id = match (&c.geo.name, c.geo.strategy) {
            (Some(name), GeoStrategy::Alias) => match self.geo_for(state, name, false).await? {
                Some(id) => Some(id),
                None => {
                    state.collector.push(Diagnostic::for_candidate(
                        c,
                        ErrorKind::RegionMismatch,
                        Severity::Error,
                        format!("region '{}' is not a known geo alias", name),
                    ));
                    return Ok(None);
                }
            },
            (None, GeoStrategy::Alias) => {
                state.collector.push(Diagnostic::for_candidate(
                    c,
                    ErrorKind::RegionMismatch,
                    Severity::Error,
                    "no region given for an alias-resolved metric",
                ));
                return Ok(None);
            }
            (Some(name), _) => self.geo_for(state, name, true).await?,
            (None, _) => None,
        };
        let company_id = match &c.company {
            Some(name) => Some(self.company_for(state, name).await?),
            None => None,
        };
        let warehouse_id = match &c.warehouse {
            Some(name) => Some(self.warehouse_for(state, name).await?),
            None => None,
        };

        let tags = normalize_tags(&merge_layers(&[&c.tags, &metric.tags]));
        let dims = DimensionIds {
            geo_id: geo_id.unwrap_or(0),
            company_id: company_id.unwrap_or(0),
            warehouse_id: warehouse_id.unwrap_or(0),
        };
        let key = dedup_key(metric.metric_id, time, dims, &tags);
        if let Some(d) = check_dedup_key(c, Some(key.as_str())) {
            state.collector.push(d);
            return Ok(None);
        }

        let (obs_date, period_start, period_end) = match time {
            ObservationTime::Day(d) => (Some(d), None, None),
            ObservationTime::Period(s, e) => (None, Some(s), Some(e)),
        };
        Ok(Some(FactRow {
            dedup_key: key,
            metric_id: metric.metric_id,
            obs_date,
            period_start,
            period_end,
            value: c.value,
            raw_value: c.raw_value.clone(),
            geo_id,
            company_id,
            warehouse_id,
            tags,
            batch_id: state.batch_id,
            sheet: c.sheet.clone(),
            row: c.row as i32,
        }))
    }

    /// Metric alias first, then get-or-create by `(raw_header, sheet_name)`.
    async fn metric_for(&self, state: &mut BatchState, c: &ObservationCandidate) -> Result<MetricRef, StoreError> {
        let cache_key = (c.raw_header.clone(), c.sheet.clone());
        if let Some(found) = state.metrics.get(&cache_key) {
            return Ok(found.clone());
        }
        let found = match self.warehouse.resolve_metric_alias(&c.source_code, &c.raw_header).await? {
            Some(aliased) => aliased,
            None => {
                self.warehouse
                    .get_or_create_metric(&MetricSpec {
                        metric_key: c.metric_key.clone(),
                        metric_name: c.metric_name.clone(),
                        raw_header: c.raw_header.clone(),
                        sheet_name: c.sheet.clone(),
                        unit: c.unit.clone(),
                        freq: c.freq.clone(),
                        source_code: c.source_code.clone(),
                    })
                    .await?
            }
        };
        state.metrics.insert(cache_key, found.clone());
        Ok(found)
    }

    async fn geo_for(&self, state: &mut BatchState, name: &str, create: bool) -> Result<Option<i64>, StoreError> {
        let cache_key = (name.trim().to_string(), create);
        if let Some(id) = state.geos.get(&cache_key) {
            return Ok(*id);
        }
        let id = self.warehouse.resolve_geo(name, create).await?;
        state.geos.insert(cache_key, id);
        Ok(id)
    }

    async fn company_for(&self, state: &mut BatchState, name: &str) -> Result<i64, StoreError> {
        if let Some(id) = state.companies.get(name.trim()) {
            return Ok(*id);
        }
        let id = self.warehouse.get_or_create_company(name).await?;
        state.companies.insert(name.trim().to_string(), id);
        Ok(id)
    }

    async fn warehouse_for(&self, state: &mut BatchState, name: &str) -> Result<i64, StoreError> {
        if let Some(id) = state.warehouses.get(name.trim()) {
            return Ok(*id);
        }
        let id = self.warehouse.get_or_create_warehouse(name).await?;
        state.warehouses.insert(name.trim().to_string(), id);
        Ok(id)
    }

    async fn finish(&self, mut state: BatchState, dataset_type: DatasetType, started: Instant) -> Result<ImportResponse, PipelineError> {
        let leftover = state.collector.flush();
        if let Err(e) = self.warehouse.append_errors(state.batch_id, &leftover).await {
            tracing::error!(batch_id = %state.batch_id, error = %e, pending = leftover.len(), "diagnostics not stored");
            state.fatal = true;
            state
                .collector
                .push(Diagnostic::for_batch(ErrorKind::StorageFailed, format!("diagnostics not stored: {}", e)));
        }

        let counters = &mut state.counters;
        counters.metrics_touched = state
            .metrics
            .values()
            .map(|m| m.metric_id)
            .collect::<HashSet<_>>()
            .len() as i32;
        let status = compute_status(
            state.fatal,
            counters.success_rows,
            counters.failed_rows + state.unparseable_sheets,
        );

        let outcome = BatchOutcome {
            status,
            counters: counters.clone(),
            source_code: state.source_code.clone(),
            profile_version: state.profile_version,
            raw_file_id: state.raw_file_id,
            date_min: state.date_min,
            date_max: state.date_max,
            duration_ms: started.elapsed().as_millis() as i64,
            error_summary: serde_json::to_value(state.collector.summary()).unwrap_or_default(),
            resolved_mapping: serde_json::json!({
                "dataset_type": dataset_type,
                "profile_version": state.profile_version,
                "sheets": state.decisions,
            }),
        };
        self.warehouse.finalize_batch(state.batch_id, &outcome).await?;
        self.progress.batch_finished(state.batch_id, status);
        tracing::info!(
            batch_id = %state.batch_id,
            status = status.as_str(),
            total_rows = outcome.counters.total_rows,
            success_rows = outcome.counters.success_rows,
            failed_rows = outcome.counters.failed_rows,
            inserted = outcome.counters.inserted,
            skipped = outcome.counters.skipped_rows,
            duration_ms = outcome.duration_ms,
            "batch finalized"
        );

        let c = &outcome.counters;
        Ok(ImportResponse {
            batch_id: state.batch_id,
            status,
            dataset_type,
            summary: ImportSummary {
                total_rows: c.total_rows,
                success_rows: c.success_rows,
                failed_rows: c.failed_rows,
                inserted: c.inserted,
                updated: c.updated,
                skipped: c.skipped_rows,
            },
            errors: state.collector.preview().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::YONGYI_DAILY_PROFILE;
    use crate::profile::ProfileDocument;
    use crate::progress::NoProgress;
    use crate::store::MemoryWarehouse;
    use crate::tags::Tags;
    use crate::workbook::{MergeRegion, WorkbookFormat};

    const NATION: &str = "商品猪：出栏均价：中国（日）";
    const HLJ: &str = "商品猪：出栏均价：黑龙江（日）";

    async fn warehouse_with(profile_json: &str) -> MemoryWarehouse {
        let w = MemoryWarehouse::new();
        let doc = ProfileDocument::from_json(profile_json).unwrap();
        w.save_profile(&doc).await.unwrap();
        w
    }

    fn request(filename: &str, bytes: &[u8]) -> ImportRequest {
        ImportRequest {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            dataset_type: Some(DatasetType::YongyiDaily),
            uploader: Some("tester".to_string()),
        }
    }

    fn workbook(sheets: Vec<Sheet>) -> Result<Workbook, WorkbookError> {
        Ok(Workbook {
            format: WorkbookFormat::Xlsx,
            sheets,
        })
    }

    /// Ten data rows; the fourth one (sheet row 5) has no date.
    fn ten_row_sheet() -> Sheet {
        let mut rows: Vec<Vec<String>> = vec![vec!["日期".into(), NATION.into()]];
        for day in 1..=10 {
            let date = if day == 4 { String::new() } else { format!("2026-02-{:02}", day) };
            rows.push(vec![date, "14.5".into()]);
        }
        let refs: Vec<Vec<&str>> = rows.iter().map(|r| r.iter().map(String::as_str).collect()).collect();
        let slices: Vec<&[&str]> = refs.iter().map(|r| r.as_slice()).collect();
        Sheet::from_text_rows("出栏价", &slices)
    }

    fn weekly_sheet() -> Sheet {
        Sheet::from_text_rows(
            "周度-出栏均重",
            &[
                &["地区", "2026.01.26-2026.02.01", ""],
                &["", "出栏均重", "规模场均重"],
                &["河南", "120.5", "125"],
            ],
        )
        .with_merges(vec![MergeRegion::new(0, 1, 0, 2)])
    }

    // -------------------------------------------------------------------------
    // IDEMPOTENCY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reimport_is_noop() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let csv = format!("日期,{},{}\n2026-02-01,14.50,13.90\n2026-02-02,14.60,14.00\n", NATION, HLJ);
        let req = request("出栏价.csv", csv.as_bytes());

        let first = pipeline.import(&req).await.unwrap();
        assert_eq!(first.status, BatchStatus::Success);
        assert_eq!(first.summary.inserted, 4);
        let facts_after_first = w.count_facts().await.unwrap();

        let second = pipeline.import(&req).await.unwrap();
        assert_eq!(second.status, BatchStatus::Success);
        assert_eq!(second.summary.inserted, 0);
        assert_eq!(second.summary.updated, 0);
        assert_eq!(second.summary.skipped, 4);
        assert_eq!(w.count_facts().await.unwrap(), facts_after_first);
        assert_eq!(w.raw_file_count().unwrap(), 1);
        assert_ne!(first.batch_id, second.batch_id);
    }

    #[tokio::test]
    async fn test_concurrent_identical_upload_reuses_raw_file() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let req = request("weekly.xlsx", b"same-bytes");
        let first = pipeline.import_workbook(&req, workbook(vec![weekly_sheet()])).await.unwrap();

        // The second upload looked for the hash before the first committed.
        w.miss_hash_lookups(1).unwrap();
        let second = pipeline.import_workbook(&req, workbook(vec![weekly_sheet()])).await.unwrap();
        assert_eq!(second.status, BatchStatus::Success);
        assert_eq!(w.raw_file_count().unwrap(), 1);

        let batches = w.batches().unwrap();
        assert_eq!(batches.len(), 2);
        let raw_ids: Vec<_> = batches
            .iter()
            .map(|b| b.outcome.as_ref().and_then(|o| o.raw_file_id))
            .collect();
        assert!(raw_ids.iter().all(Option::is_some));
        assert_eq!(raw_ids[0], raw_ids[1]);
        assert_ne!(first.batch_id, second.batch_id);
    }

    // -------------------------------------------------------------------------
    // FAILURE ISOLATION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_storage_failure_still_finalizes_batch() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        w.fail_error_appends().unwrap();
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let resp = pipeline
            .import_workbook(&request("log.xlsx", b"log-down"), workbook(vec![ten_row_sheet()]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Failed);
        assert!(resp.errors.iter().any(|e| e.kind == ErrorKind::StorageFailed && e.sheet.is_none()));

        let batches = w.batches().unwrap();
        assert_eq!(batches.len(), 1);
        let outcome = batches[0].outcome.as_ref().unwrap();
        assert_eq!(outcome.status, BatchStatus::Failed);
        assert!(outcome.raw_file_id.is_some());
    }

    #[tokio::test]
    async fn test_unreadable_sheet_does_not_abort_siblings() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let broken = Sheet::unreadable("出栏价", "failed to read sheet '出栏价': bad xml");
        let resp = pipeline
            .import_workbook(&request("bad-sheet.xlsx", b"bad-sheet"), workbook(vec![broken, weekly_sheet()]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Partial);
        assert_eq!(resp.summary.success_rows, 2);
        let unparseable: Vec<_> = resp.errors.iter().filter(|e| e.kind == ErrorKind::UnparseableSheet).collect();
        assert_eq!(unparseable.len(), 1);
        assert_eq!(unparseable[0].sheet.as_deref(), Some("出栏价"));
        assert!(unparseable[0].message.contains("bad xml"));
    }

    #[tokio::test]
    async fn test_truncated_sheet_is_warned() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let mut sheet = weekly_sheet();
        sheet.truncated = true;
        let resp = pipeline
            .import_workbook(&request("huge.xlsx", b"huge"), workbook(vec![sheet]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Success);
        let warned: Vec<_> = resp.errors.iter().filter(|e| e.kind == ErrorKind::OutOfRange).collect();
        assert_eq!(warned.len(), 1);
        assert_eq!(warned[0].severity, Severity::Warning);
        assert_eq!(warned[0].sheet.as_deref(), Some("周度-出栏均重"));
    }

    #[tokio::test]
    async fn test_missing_date_row_isolated() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let resp = pipeline
            .import_workbook(&request("two.xlsx", b"two-sheets"), workbook(vec![ten_row_sheet(), weekly_sheet()]))
            .await
            .unwrap();

        assert_eq!(resp.status, BatchStatus::Partial);
        assert_eq!(resp.summary.total_rows, 12);
        assert_eq!(resp.summary.failed_rows, 1);
        assert_eq!(resp.summary.success_rows, 11);

        let missing: Vec<_> = resp.errors.iter().filter(|e| e.kind == ErrorKind::MissingRequired).collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].sheet.as_deref(), Some("出栏价"));
        assert_eq!(missing[0].row, Some(5));

        let stored = w.errors().unwrap();
        assert!(stored.iter().all(|(batch, _)| *batch == resp.batch_id));
        assert_eq!(stored.len(), resp.errors.len());
    }

    #[tokio::test]
    async fn test_sole_sheet_with_bad_row_is_partial() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let resp = pipeline
            .import_workbook(&request("one.xlsx", b"one-sheet"), workbook(vec![ten_row_sheet()]))
            .await
            .unwrap();
        assert_eq!(resp.summary.success_rows, 9);
        assert_eq!(resp.summary.failed_rows, 1);
        assert_eq!(resp.status, BatchStatus::Partial);
    }

    #[tokio::test]
    async fn test_unparseable_sheet_does_not_abort_siblings() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let broken = Sheet::from_text_rows("出栏价", &[&["日期", "别的列"], &["2026-02-01", "1"]]);
        let resp = pipeline
            .import_workbook(&request("mixed.xlsx", b"mixed"), workbook(vec![broken, weekly_sheet()]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Partial);
        assert_eq!(resp.summary.success_rows, 2);
        let unparseable: Vec<_> = resp.errors.iter().filter(|e| e.kind == ErrorKind::UnparseableSheet).collect();
        assert_eq!(unparseable.len(), 1);
        assert_eq!(unparseable[0].sheet.as_deref(), Some("出栏价"));
        assert_eq!(unparseable[0].row, None);
    }

    #[tokio::test]
    async fn test_failed_chunk_rolls_back_only_itself() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        w.fail_chunk(0).unwrap();
        let options = PipelineOptions { chunk_size: 2, error_preview: 10 };
        let pipeline = Pipeline::new(&w, &NoProgress, options);
        let sheet = Sheet::from_text_rows(
            "出栏价",
            &[&["日期", NATION], &["2026-02-01", "14.1"], &["2026-02-02", "14.2"], &["2026-02-03", "14.3"]],
        );
        let resp = pipeline
            .import_workbook(&request("chunks.xlsx", b"chunks"), workbook(vec![sheet]))
            .await
            .unwrap();
        assert_eq!(resp.summary.failed_rows, 2);
        assert_eq!(resp.summary.success_rows, 1);
        assert_eq!(resp.summary.inserted, 1);
        assert_eq!(resp.status, BatchStatus::Partial);
        assert!(resp.errors.iter().any(|e| e.kind == ErrorKind::StorageFailed));
        let facts = w.facts().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].obs_date, NaiveDate::from_ymd_opt(2026, 2, 3));
    }

    #[tokio::test]
    async fn test_unreadable_workbook_fails_batch_but_keeps_bytes() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let req = ImportRequest {
            filename: "broken.xlsx".into(),
            bytes: b"definitely not a spreadsheet".to_vec(),
            dataset_type: None,
            uploader: None,
        };
        let resp = pipeline.import(&req).await.unwrap();
        assert_eq!(resp.status, BatchStatus::Failed);
        assert_eq!(resp.dataset_type, DatasetType::Unrecognized);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].kind, ErrorKind::UnparseableSheet);
        assert_eq!(w.raw_file_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_profile_fails_after_raw_layer() {
        let w = MemoryWarehouse::new();
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let resp = pipeline
            .import_workbook(&request("x.xlsx", b"x"), workbook(vec![ten_row_sheet()]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Failed);
        assert_eq!(resp.errors[0].kind, ErrorKind::MissingRequired);
        assert_eq!(w.raw_file_count().unwrap(), 1);
        assert_eq!(w.count_facts().await.unwrap(), 0);
    }

    // -------------------------------------------------------------------------
    // VALIDATION AND RESOLUTION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_negative_price_stored_with_warning() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheet = Sheet::from_text_rows("出栏价", &[&["日期", NATION], &["2026-02-01", "-5"]]);
        let resp = pipeline
            .import_workbook(&request("neg.xlsx", b"neg"), workbook(vec![sheet]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Success);
        assert_eq!(resp.summary.inserted, 1);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].kind, ErrorKind::OutOfRange);
        assert_eq!(resp.errors[0].severity, Severity::Warning);
        assert_eq!(w.facts().unwrap()[0].value, Some(-5.0));
    }

    #[tokio::test]
    async fn test_national_and_provincial_headers_get_distinct_metrics() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheet = Sheet::from_text_rows("出栏价", &[&["日期", NATION, HLJ], &["2026-02-01", "14.5", "13.9"]]);
        pipeline
            .import_workbook(&request("d.xlsx", b"d"), workbook(vec![sheet]))
            .await
            .unwrap();

        let metrics = w.metrics().unwrap();
        let id_of = |header: &str| metrics.iter().find(|m| m.spec.raw_header == header).map(|m| m.metric_id);
        let nation = id_of(NATION).unwrap();
        let province = id_of(HLJ).unwrap();
        assert_ne!(nation, province);

        let facts = w.facts().unwrap();
        let nation_fact = facts.iter().find(|f| f.metric_id == nation).unwrap();
        let province_fact = facts.iter().find(|f| f.metric_id == province).unwrap();
        assert_eq!(nation_fact.value, Some(14.5));
        assert_eq!(province_fact.value, Some(13.9));
        assert_ne!(nation_fact.geo_id, province_fact.geo_id);
        assert_eq!(w.resolve_geo("黑龙江", false).await.unwrap(), province_fact.geo_id);
    }

    #[tokio::test]
    async fn test_unit_mismatch_is_warning() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        w.get_or_create_metric(&MetricSpec {
            metric_key: "hog_price_nation".into(),
            metric_name: "出栏均价".into(),
            raw_header: NATION.into(),
            sheet_name: "出栏价".into(),
            unit: Some("元/吨".into()),
            freq: None,
            source_code: "YONGYI".into(),
        })
        .await
        .unwrap();
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheet = Sheet::from_text_rows("出栏价", &[&["日期", NATION], &["2026-02-01", "14.5"]]);
        let resp = pipeline
            .import_workbook(&request("u.xlsx", b"u"), workbook(vec![sheet]))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Success);
        assert_eq!(resp.summary.inserted, 1);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].kind, ErrorKind::UnitMismatch);
    }

    #[tokio::test]
    async fn test_metric_alias_wins_and_carries_tags() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let target = w
            .get_or_create_metric(&MetricSpec {
                metric_key: "hog_price_nation".into(),
                metric_name: "全国均价".into(),
                raw_header: "全国均价".into(),
                sheet_name: "历史".into(),
                unit: Some("元/公斤".into()),
                freq: None,
                source_code: "YONGYI".into(),
            })
            .await
            .unwrap();
        let tags: Tags = [("scale".to_string(), "large".to_string())].into_iter().collect();
        w.add_metric_alias("YONGYI", NATION, target.metric_id, tags).unwrap();

        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheet = Sheet::from_text_rows("出栏价", &[&["日期", NATION], &["2026-02-01", "14.5"]]);
        pipeline
            .import_workbook(&request("a.xlsx", b"a"), workbook(vec![sheet]))
            .await
            .unwrap();
        let facts = w.facts().unwrap();
        assert_eq!(facts[0].metric_id, target.metric_id);
        assert_eq!(facts[0].tags.get("scale").map(String::as_str), Some("large"));
        assert_eq!(w.metrics().unwrap().len(), 1);
    }

    const ALIAS_PROFILE: &str = r#"{
        "dataset_type": "LEGACY",
        "version": 1,
        "source_code": "LEGACY",
        "sheets": [{
            "sheet_name": "省份价格",
            "parser": "narrow_date_rows",
            "date_column": "日期",
            "geo_column": "地区",
            "metrics": [
                { "metric_key": "p", "metric_name": "价格", "raw_headers": ["价格"], "unit": "元/公斤", "category": "price", "geo": "alias" }
            ]
        }]
    }"#;

    #[tokio::test]
    async fn test_unknown_alias_region_is_rejected() {
        let w = warehouse_with(ALIAS_PROFILE).await;
        let hlj = w.add_geo("黑龙江", &["黑龙江省"]).unwrap();
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheet = Sheet::from_text_rows(
            "省份价格",
            &[&["日期", "地区", "价格"], &["2026-02-01", "黑龙江省", "14.1"], &["2026-02-01", "火星", "14.2"]],
        );
        let mut req = request("legacy.xlsx", b"legacy");
        req.dataset_type = Some(DatasetType::Legacy);
        let resp = pipeline.import_workbook(&req, workbook(vec![sheet])).await.unwrap();

        assert_eq!(resp.status, BatchStatus::Partial);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].kind, ErrorKind::RegionMismatch);
        assert_eq!(resp.errors[0].row, Some(3));
        let facts = w.facts().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].geo_id, Some(hlj));
    }

    // -------------------------------------------------------------------------
    // BOOKKEEPING
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_batch_bookkeeping_and_mapping() {
        let w = warehouse_with(YONGYI_DAILY_PROFILE).await;
        let pipeline = Pipeline::new(&w, &NoProgress, PipelineOptions::default());
        let sheets = vec![
            Sheet::from_text_rows("出栏价", &[&["日期", NATION], &["2026-02-01", "14.5"], &["2026-02-03", "14.7"]]),
            Sheet::from_text_rows("说明", &[&["本表说明"]]),
            Sheet::from_text_rows("图表", &[&["chart"]]),
            Sheet::from_text_rows("新表", &[&["?"]]),
        ];
        let resp = pipeline
            .import_workbook(&request("book.xlsx", b"book"), workbook(sheets))
            .await
            .unwrap();
        assert_eq!(resp.status, BatchStatus::Success);
        assert!(resp.errors.is_empty());

        let batches = w.batches().unwrap();
        let outcome = batches[0].outcome.as_ref().unwrap();
        assert_eq!(outcome.counters.sheets_total, 4);
        assert_eq!(outcome.counters.sheets_parsed, 1);
        assert_eq!(outcome.counters.sheets_skipped, 1);
        assert_eq!(outcome.counters.sheets_raw_only, 1);
        assert_eq!(outcome.counters.sheets_unmapped, 1);
        assert_eq!(outcome.counters.metrics_touched, 1);
        assert_eq!(outcome.profile_version, Some(1));
        assert_eq!(outcome.source_code.as_deref(), Some("YONGYI"));
        assert_eq!(outcome.date_min, NaiveDate::from_ymd_opt(2026, 2, 1));
        assert_eq!(outcome.date_max, NaiveDate::from_ymd_opt(2026, 2, 3));
        assert!(outcome.raw_file_id.is_some());
        assert_eq!(outcome.resolved_mapping["sheets"].as_array().unwrap().len(), 4);
        assert_eq!(outcome.resolved_mapping["sheets"][3]["action"], "unmapped");
        assert_eq!(outcome.resolved_mapping["dataset_type"], "YONGYI_DAILY");
    }

    #[test]
    fn test_compute_status() {
        assert_eq!(compute_status(false, 10, 0), BatchStatus::Success);
        assert_eq!(compute_status(false, 0, 0), BatchStatus::Success);
        assert_eq!(compute_status(false, 9, 1), BatchStatus::Partial);
        assert_eq!(compute_status(false, 0, 3), BatchStatus::Failed);
        assert_eq!(compute_status(true, 10, 0), BatchStatus::Failed);
    }
}
