//! In-memory warehouse for dry runs and tests.

use super::{
    check_profile_version, BatchOutcome, ChunkResult, FactRow, MetricRef, MetricSpec, NewBatch, RawFileRecord,
    RawSheetRecord, SaveOutcome, StoredProfile, Warehouse,
};
use crate::detect::DatasetType;
use crate::error::StoreError;
use crate::profile::ProfileDocument;
use crate::tags::Tags;
use crate::validate::Diagnostic;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub batch: NewBatch,
    pub outcome: Option<BatchOutcome>,
}

#[derive(Debug, Clone)]
pub struct StoredMetric {
    pub metric_id: i64,
    pub spec: MetricSpec,
}

#[derive(Debug, Default)]
struct State {
    raw_files: Vec<(RawFileRecord, Vec<RawSheetRecord>)>,
    batches: Vec<StoredBatch>,
    profiles: Vec<StoredProfile>,
    metrics: Vec<StoredMetric>,
    metric_aliases: HashMap<(String, String), (i64, Tags)>,
    geos: HashMap<String, i64>,
    geo_aliases: HashMap<String, i64>,
    companies: HashMap<String, i64>,
    warehouses: HashMap<String, i64>,
    facts: Vec<FactRow>,
    fact_keys: HashSet<String>,
    errors: Vec<(Uuid, Diagnostic)>,
    next_id: i64,
    chunk_calls: usize,
    failing_chunks: HashSet<usize>,
    stale_hash_lookups: usize,
    failing_appends: bool,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory warehouse lock poisoned".to_string()))
    }

    /// Seed a known region with its aliases.
    pub fn add_geo(&self, name: &str, aliases: &[&str]) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        let id = state.next_id();
        state.geos.insert(name.to_string(), id);
        for alias in aliases {
            state.geo_aliases.insert(alias.to_string(), id);
        }
        Ok(id)
    }

    /// Register a vendor header alias for an existing metric.
    pub fn add_metric_alias(&self, source_code: &str, alias: &str, metric_id: i64, tags: Tags) -> Result<(), StoreError> {
        self.lock()?
            .metric_aliases
            .insert((source_code.to_string(), alias.to_string()), (metric_id, tags));
        Ok(())
    }

    /// Make the n-th (0-based) `insert_facts` call fail and roll back.
    pub fn fail_chunk(&self, call_index: usize) -> Result<(), StoreError> {
        self.lock()?.failing_chunks.insert(call_index);
        Ok(())
    }

    /// Make the next `count` hash lookups miss, as a concurrent upload
    /// that has not committed yet would.
    pub fn miss_hash_lookups(&self, count: usize) -> Result<(), StoreError> {
        self.lock()?.stale_hash_lookups = count;
        Ok(())
    }

    /// Make every `append_errors` call fail.
    pub fn fail_error_appends(&self) -> Result<(), StoreError> {
        self.lock()?.failing_appends = true;
        Ok(())
    }

    pub fn facts(&self) -> Result<Vec<FactRow>, StoreError> {
        Ok(self.lock()?.facts.clone())
    }

    pub fn errors(&self) -> Result<Vec<(Uuid, Diagnostic)>, StoreError> {
        Ok(self.lock()?.errors.clone())
    }

    pub fn batches(&self) -> Result<Vec<StoredBatch>, StoreError> {
        Ok(self.lock()?.batches.clone())
    }

    pub fn metrics(&self) -> Result<Vec<StoredMetric>, StoreError> {
        Ok(self.lock()?.metrics.clone())
    }

    pub fn raw_file_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.raw_files.len())
    }

    pub fn raw_sheets(&self, content_hash: &str) -> Result<Vec<RawSheetRecord>, StoreError> {
        Ok(self
            .lock()?
            .raw_files
            .iter()
            .find(|(f, _)| f.content_hash == content_hash)
            .map(|(_, sheets)| sheets.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn find_raw_file_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.lock()?;
        if state.stale_hash_lookups > 0 {
            state.stale_hash_lookups -= 1;
            return Ok(None);
        }
        Ok(state
            .raw_files
            .iter()
            .find(|(f, _)| f.content_hash == content_hash)
            .map(|(f, _)| f.raw_file_id))
    }

    async fn insert_raw_file(&self, file: &RawFileRecord, sheets: &[RawSheetRecord]) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.raw_files.iter().any(|(f, _)| f.content_hash == file.content_hash) {
            return Err(StoreError::Conflict(format!("raw file {} already stored", file.content_hash)));
        }
        state.raw_files.push((file.clone(), sheets.to_vec()));
        Ok(())
    }

    async fn create_batch(&self, batch: &NewBatch) -> Result<(), StoreError> {
        self.lock()?.batches.push(StoredBatch {
            batch: batch.clone(),
            outcome: None,
        });
        Ok(())
    }

    async fn finalize_batch(&self, batch_id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let batch = state
            .batches
            .iter_mut()
            .find(|b| b.batch.batch_id == batch_id)
            .ok_or_else(|| StoreError::Conflict(format!("batch {} not found", batch_id)))?;
        batch.outcome = Some(outcome.clone());
        Ok(())
    }

    async fn latest_profile(&self, dataset_type: DatasetType) -> Result<Option<StoredProfile>, StoreError> {
        Ok(self
            .lock()?
            .profiles
            .iter()
            .filter(|p| p.dataset_type == dataset_type)
            .max_by_key(|p| p.version)
            .cloned())
    }

    async fn save_profile(&self, document: &ProfileDocument) -> Result<SaveOutcome, StoreError> {
        let dataset_type = document.compile()?.dataset_type;
        let latest = self.latest_profile(dataset_type).await?;
        let checksum = match check_profile_version(document, latest.as_ref().map(|p| (p.version, p.checksum.as_str())))? {
            Some(checksum) => checksum,
            None => return Ok(SaveOutcome::Unchanged { version: document.version }),
        };
        self.lock()?.profiles.push(StoredProfile {
            dataset_type,
            version: document.version,
            checksum,
            document: document.clone(),
        });
        Ok(SaveOutcome::Stored { version: document.version })
    }

    async fn resolve_metric_alias(&self, source_code: &str, alias: &str) -> Result<Option<MetricRef>, StoreError> {
        let state = self.lock()?;
        let Some((metric_id, tags)) = state
            .metric_aliases
            .get(&(source_code.to_string(), alias.to_string()))
            .cloned()
        else {
            return Ok(None);
        };
        let unit = state
            .metrics
            .iter()
            .find(|m| m.metric_id == metric_id)
            .and_then(|m| m.spec.unit.clone());
        Ok(Some(MetricRef { metric_id, unit, tags }))
    }

    async fn get_or_create_metric(&self, spec: &MetricSpec) -> Result<MetricRef, StoreError> {
        let mut state = self.lock()?;
        if let Some(m) = state
            .metrics
            .iter()
            .find(|m| m.spec.raw_header == spec.raw_header && m.spec.sheet_name == spec.sheet_name)
        {
            return Ok(MetricRef {
                metric_id: m.metric_id,
                unit: m.spec.unit.clone(),
                tags: Tags::new(),
            });
        }
        let metric_id = state.next_id();
        state.metrics.push(StoredMetric {
            metric_id,
            spec: spec.clone(),
        });
        Ok(MetricRef {
            metric_id,
            unit: spec.unit.clone(),
            tags: Tags::new(),
        })
    }

    async fn resolve_geo(&self, name: &str, create: bool) -> Result<Option<i64>, StoreError> {
        let mut state = self.lock()?;
        let name = name.trim();
        if let Some(id) = state.geos.get(name).or_else(|| state.geo_aliases.get(name)) {
            return Ok(Some(*id));
        }
        if !create {
            return Ok(None);
        }
        let id = state.next_id();
        state.geos.insert(name.to_string(), id);
        Ok(Some(id))
    }

    async fn get_or_create_company(&self, name: &str) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        if let Some(id) = state.companies.get(name.trim()) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.companies.insert(name.trim().to_string(), id);
        Ok(id)
    }

    async fn get_or_create_warehouse(&self, name: &str) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        if let Some(id) = state.warehouses.get(name.trim()) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.warehouses.insert(name.trim().to_string(), id);
        Ok(id)
    }

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<ChunkResult, StoreError> {
        let mut state = self.lock()?;
        let call = state.chunk_calls;
        state.chunk_calls += 1;
        if state.failing_chunks.contains(&call) {
            return Err(StoreError::Unavailable(format!("injected failure on chunk {}", call)));
        }
        let mut result = ChunkResult::default();
        for row in rows {
            if state.fact_keys.insert(row.dedup_key.clone()) {
                state.facts.push(row.clone());
                result.inserted += 1;
            } else {
                result.skipped += 1;
            }
        }
        Ok(result)
    }

    async fn append_errors(&self, batch_id: Uuid, errors: &[Diagnostic]) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.failing_appends {
            return Err(StoreError::Unavailable("error log unavailable".to_string()));
        }
        state
            .errors
            .extend(errors.iter().cloned().map(|d| (batch_id, d)));
        Ok(())
    }

    async fn count_facts(&self) -> Result<i64, StoreError> {
        Ok(self.lock()?.facts.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::YONGYI_DAILY_PROFILE;
    use crate::error::ProfileError;

    fn spec(header: &str, sheet: &str) -> MetricSpec {
        MetricSpec {
            metric_key: "k".into(),
            metric_name: "n".into(),
            raw_header: header.into(),
            sheet_name: sheet.into(),
            unit: Some("元/公斤".into()),
            freq: None,
            source_code: "YONGYI".into(),
        }
    }

    fn fact(key: &str) -> FactRow {
        FactRow {
            dedup_key: key.into(),
            metric_id: 1,
            obs_date: None,
            period_start: None,
            period_end: None,
            value: Some(1.0),
            raw_value: Some("1".into()),
            geo_id: None,
            company_id: None,
            warehouse_id: None,
            tags: Tags::new(),
            batch_id: Uuid::nil(),
            sheet: "s".into(),
            row: 2,
        }
    }

    #[tokio::test]
    async fn test_metric_identity_is_header_and_sheet() {
        let w = MemoryWarehouse::new();
        let a = w.get_or_create_metric(&spec("均价", "出栏价")).await.unwrap();
        let b = w.get_or_create_metric(&spec("均价", "出栏价")).await.unwrap();
        let c = w.get_or_create_metric(&spec("均价", "周度-出栏价")).await.unwrap();
        assert_eq!(a.metric_id, b.metric_id);
        assert_ne!(a.metric_id, c.metric_id);
        assert_eq!(w.metrics().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let w = MemoryWarehouse::new();
        let first = w.insert_facts(&[fact("a"), fact("b")]).await.unwrap();
        assert_eq!(first, ChunkResult { inserted: 2, skipped: 0 });
        let second = w.insert_facts(&[fact("b"), fact("c")]).await.unwrap();
        assert_eq!(second, ChunkResult { inserted: 1, skipped: 1 });
        assert_eq!(w.count_facts().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_writes_nothing() {
        let w = MemoryWarehouse::new();
        w.fail_chunk(0).unwrap();
        assert!(w.insert_facts(&[fact("a")]).await.is_err());
        assert_eq!(w.count_facts().await.unwrap(), 0);
        assert!(w.insert_facts(&[fact("a")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_geo_alias_and_create() {
        let w = MemoryWarehouse::new();
        let hlj = w.add_geo("黑龙江", &["黑龙江省"]).unwrap();
        assert_eq!(w.resolve_geo("黑龙江省", false).await.unwrap(), Some(hlj));
        assert_eq!(w.resolve_geo("河南", false).await.unwrap(), None);
        let henan = w.resolve_geo("河南", true).await.unwrap();
        assert!(henan.is_some());
        assert_eq!(w.resolve_geo("河南", false).await.unwrap(), henan);
    }

    #[tokio::test]
    async fn test_profile_versioning() {
        let w = MemoryWarehouse::new();
        let doc = ProfileDocument::from_json(YONGYI_DAILY_PROFILE).unwrap();
        assert_eq!(w.save_profile(&doc).await.unwrap(), SaveOutcome::Stored { version: 1 });
        assert_eq!(w.save_profile(&doc).await.unwrap(), SaveOutcome::Unchanged { version: 1 });

        let mut edited = doc.clone();
        edited.description = Some("edited".into());
        assert!(matches!(
            w.save_profile(&edited).await,
            Err(StoreError::Profile(ProfileError::StaleVersion { offered: 1, stored: 1, .. }))
        ));

        edited.version = 2;
        assert_eq!(w.save_profile(&edited).await.unwrap(), SaveOutcome::Stored { version: 2 });
        let latest = w.latest_profile(DatasetType::YongyiDaily).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }
}
