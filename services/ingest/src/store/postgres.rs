//! Postgres warehouse.

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
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled DDL.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get-or-create on a `(id BIGSERIAL, name TEXT UNIQUE)` dimension table.
    async fn get_or_create_named(&self, table: &'static str, id_col: &'static str, name: &str) -> Result<i64, StoreError> {
        let name = name.trim();
        let existing: Option<(i64,)> = sqlx::query_as(&format!("SELECT {id_col} FROM {table} WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }
        // A concurrent insert of the same name lands on the conflict arm.
        let (id,): (i64,) = sqlx::query_as(&format!(
            "INSERT INTO {table} (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING {id_col}"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

async fn insert_chunk(tx: &mut Transaction<'_, Postgres>, rows: &[FactRow]) -> Result<ChunkResult, StoreError> {
    let mut result = ChunkResult::default();
    for row in rows {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO fact_observation
                (dedup_key, metric_id, obs_date, period_start, period_end, value, raw_value,
                 geo_id, company_id, warehouse_id, tags, batch_id, source_sheet, source_row)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING fact_id
            "#,
        )
        .bind(&row.dedup_key)
        .bind(row.metric_id)
        .bind(row.obs_date)
        .bind(row.period_start)
        .bind(row.period_end)
        .bind(row.value)
        .bind(&row.raw_value)
        .bind(row.geo_id)
        .bind(row.company_id)
        .bind(row.warehouse_id)
        .bind(serde_json::to_value(&row.tags)?)
        .bind(row.batch_id)
        .bind(&row.sheet)
        .bind(row.row)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((fact_id,)) = inserted else {
            result.skipped += 1;
            continue;
        };
        result.inserted += 1;
        for (key, value) in &row.tags {
            sqlx::query("INSERT INTO fact_observation_tag (fact_id, tag_key, tag_value) VALUES ($1, $2, $3)")
                .bind(fact_id)
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(result)
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn find_raw_file_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT raw_file_id FROM raw_file WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn insert_raw_file(&self, file: &RawFileRecord, sheets: &[RawSheetRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO raw_file (raw_file_id, batch_id, filename, content_hash, format, size_bytes, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (content_hash) DO NOTHING
            RETURNING raw_file_id
            "#,
        )
        .bind(file.raw_file_id)
        .bind(file.batch_id)
        .bind(&file.filename)
        .bind(&file.content_hash)
        .bind(&file.format)
        .bind(file.size_bytes)
        .bind(&file.bytes)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!("raw file {} already stored", file.content_hash)));
        }

        for sheet in sheets {
            let (raw_sheet_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO raw_sheet
                    (raw_file_id, sheet_index, sheet_name, row_count, col_count, merge_count, formula_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING raw_sheet_id
                "#,
            )
            .bind(file.raw_file_id)
            .bind(sheet.sheet_index)
            .bind(&sheet.sheet_name)
            .bind(sheet.row_count)
            .bind(sheet.col_count)
            .bind(sheet.merge_count)
            .bind(sheet.formula_count)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO raw_table (raw_sheet_id, cells) VALUES ($1, $2)")
                .bind(raw_sheet_id)
                .bind(&sheet.table)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_batch(&self, batch: &NewBatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_batch (batch_id, filename, content_hash, uploader, dataset_type, status)
            VALUES ($1, $2, $3, $4, $5, 'running')
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.filename)
        .bind(&batch.content_hash)
        .bind(&batch.uploader)
        .bind(batch.dataset_type.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_batch(&self, batch_id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError> {
        let c = &outcome.counters;
        sqlx::query(
            r#"
            UPDATE import_batch SET
                status = $2, source_code = $3, profile_version = $4, raw_file_id = $5,
                total_rows = $6, success_rows = $7, failed_rows = $8,
                inserted_count = $9, updated_count = $10, skipped_rows = $11,
                sheets_total = $12, sheets_parsed = $13, sheets_skipped = $14,
                sheets_raw_only = $15, sheets_unmapped = $16, metrics_touched = $17,
                date_min = $18, date_max = $19, duration_ms = $20,
                error_summary = $21, resolved_mapping = $22, finished_at = now()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.source_code)
        .bind(outcome.profile_version)
        .bind(outcome.raw_file_id)
        .bind(c.total_rows)
        .bind(c.success_rows)
        .bind(c.failed_rows)
        .bind(c.inserted)
        .bind(c.updated)
        .bind(c.skipped_rows)
        .bind(c.sheets_total)
        .bind(c.sheets_parsed)
        .bind(c.sheets_skipped)
        .bind(c.sheets_raw_only)
        .bind(c.sheets_unmapped)
        .bind(c.metrics_touched)
        .bind(outcome.date_min)
        .bind(outcome.date_max)
        .bind(outcome.duration_ms)
        .bind(&outcome.error_summary)
        .bind(&outcome.resolved_mapping)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_profile(&self, dataset_type: DatasetType) -> Result<Option<StoredProfile>, StoreError> {
        let row: Option<(i32, String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT version, checksum, document FROM ingest_profile
            WHERE dataset_type = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(dataset_type.code())
        .fetch_optional(&self.pool)
        .await?;
        let Some((version, checksum, document)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredProfile {
            dataset_type,
            version,
            checksum,
            document: serde_json::from_value(document)?,
        }))
    }

    async fn save_profile(&self, document: &ProfileDocument) -> Result<SaveOutcome, StoreError> {
        let compiled = document.compile()?;
        let mut tx = self.pool.begin().await?;
        let latest: Option<(i32, String)> = sqlx::query_as(
            r#"
            SELECT version, checksum FROM ingest_profile
            WHERE dataset_type = $1
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(compiled.dataset_type.code())
        .fetch_optional(&mut *tx)
        .await?;

        let checksum = match check_profile_version(document, latest.as_ref().map(|(v, c)| (*v, c.as_str())))? {
            Some(checksum) => checksum,
            None => {
                tx.rollback().await?;
                return Ok(SaveOutcome::Unchanged { version: document.version });
            }
        };

        let (profile_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO ingest_profile (dataset_type, version, source_code, checksum, document)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING profile_id
            "#,
        )
        .bind(compiled.dataset_type.code())
        .bind(document.version)
        .bind(&document.source_code)
        .bind(&checksum)
        .bind(serde_json::to_value(document)?)
        .fetch_one(&mut *tx)
        .await?;

        for (doc, rule) in document.sheets.iter().zip(&compiled.sheets) {
            let (selector, is_pattern) = match (&doc.sheet_name, &doc.sheet_pattern) {
                (Some(name), _) => (name.clone(), false),
                (None, Some(pattern)) => (pattern.clone(), true),
                (None, None) => (rule.selector.describe(), false),
            };
            sqlx::query(
                r#"
                INSERT INTO ingest_profile_sheet (profile_id, sheet_selector, is_pattern, parser, priority, config)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(profile_id)
            .bind(selector)
            .bind(is_pattern)
            .bind(rule.strategy.parser_name())
            .bind(rule.priority)
            .bind(serde_json::to_value(doc)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(SaveOutcome::Stored { version: document.version })
    }

    async fn resolve_metric_alias(&self, source_code: &str, alias: &str) -> Result<Option<MetricRef>, StoreError> {
        let row: Option<(i64, Option<String>, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT a.metric_id, m.unit, a.tags
            FROM metric_alias a
            JOIN dim_metric m ON m.metric_id = a.metric_id
            WHERE a.source_code = $1 AND a.alias_text = $2
            "#,
        )
        .bind(source_code)
        .bind(alias.trim())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((metric_id, unit, tags)) => Ok(Some(MetricRef {
                metric_id,
                unit,
                tags: serde_json::from_value::<Tags>(tags)?,
            })),
            None => Ok(None),
        }
    }

    async fn get_or_create_metric(&self, spec: &MetricSpec) -> Result<MetricRef, StoreError> {
        let select = "SELECT metric_id, unit FROM dim_metric WHERE raw_header = $1 AND sheet_name = $2";
        let existing: Option<(i64, Option<String>)> = sqlx::query_as(select)
            .bind(&spec.raw_header)
            .bind(&spec.sheet_name)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((metric_id, unit)) = existing {
            return Ok(MetricRef {
                metric_id,
                unit,
                tags: Tags::new(),
            });
        }

        let created: Option<(i64, Option<String>)> = sqlx::query_as(
            r#"
            INSERT INTO dim_metric (metric_key, metric_name, raw_header, sheet_name, unit, freq, source_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (raw_header, sheet_name) DO NOTHING
            RETURNING metric_id, unit
            "#,
        )
        .bind(&spec.metric_key)
        .bind(&spec.metric_name)
        .bind(&spec.raw_header)
        .bind(&spec.sheet_name)
        .bind(&spec.unit)
        .bind(&spec.freq)
        .bind(&spec.source_code)
        .fetch_optional(&self.pool)
        .await?;

        // Lost a race with another import: the row exists now.
        let (metric_id, unit) = match created {
            Some(row) => row,
            None => {
                sqlx::query_as(select)
                    .bind(&spec.raw_header)
                    .bind(&spec.sheet_name)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(MetricRef {
            metric_id,
            unit,
            tags: Tags::new(),
        })
    }

    async fn resolve_geo(&self, name: &str, create: bool) -> Result<Option<i64>, StoreError> {
        let found: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT geo_id FROM dim_geo WHERE name = $1
            UNION ALL
            SELECT geo_id FROM geo_alias WHERE alias = $1
            LIMIT 1
            "#,
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        match found {
            Some((id,)) => Ok(Some(id)),
            None if create => Ok(Some(self.get_or_create_named("dim_geo", "geo_id", name).await?)),
            None => Ok(None),
        }
    }

    async fn get_or_create_company(&self, name: &str) -> Result<i64, StoreError> {
        self.get_or_create_named("dim_company", "company_id", name).await
    }

    async fn get_or_create_warehouse(&self, name: &str) -> Result<i64, StoreError> {
        self.get_or_create_named("dim_warehouse", "warehouse_id", name).await
    }

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<ChunkResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        match insert_chunk(&mut tx, rows).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn append_errors(&self, batch_id: Uuid, errors: &[Diagnostic]) -> Result<(), StoreError> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for e in errors {
            sqlx::query(
                r#"
                INSERT INTO ingest_error (batch_id, sheet_name, row_no, column_letter, error_type, severity, message)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(batch_id)
            .bind(&e.sheet)
            .bind(e.row.map(|r| r as i32))
            .bind(&e.column)
            .bind(e.kind.as_str())
            .bind(e.severity.as_str())
            .bind(&e.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_facts(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fact_observation")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
