//! Raw layer: a lossless snapshot of every upload, written before any parsing
//! and independent of whether parsing succeeds.

use crate::error::StoreError;
use crate::store::{RawFileRecord, RawSheetRecord, Warehouse};
use crate::tags::hex_sha256;
use crate::workbook::{Sheet, Workbook};
use serde_json::json;
use uuid::Uuid;

/// `sha256:<hex>` content hash of the uploaded bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", hex_sha256(bytes))
}

/// Full cell grid of one sheet plus merge geometry and formulas.
pub fn raw_table(sheet: &Sheet) -> serde_json::Value {
    let formulas: Vec<serde_json::Value> = sheet
        .formulas()
        .into_iter()
        .map(|(row, col, formula)| json!({ "row": row, "col": col, "formula": formula }))
        .collect();
    json!({
        "rows": sheet.rows(),
        "merges": sheet.merges,
        "formulas": formulas,
        "load_error": sheet.load_error,
        "truncated": sheet.truncated,
    })
}

pub fn sheet_records(workbook: &Workbook) -> Vec<RawSheetRecord> {
    workbook
        .sheets
        .iter()
        .enumerate()
        .map(|(index, sheet)| RawSheetRecord {
            sheet_index: index as i32,
            sheet_name: sheet.name.clone(),
            row_count: sheet.height() as i32,
            col_count: sheet.width() as i32,
            merge_count: sheet.merges.len() as i32,
            formula_count: sheet.formula_count() as i32,
            table: raw_table(sheet),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawWrite {
    Stored(Uuid),
    /// Identical bytes were uploaded before; the earlier snapshot is reused.
    Existing(Uuid),
}

impl RawWrite {
    pub fn raw_file_id(&self) -> Uuid {
        match self {
            RawWrite::Stored(id) | RawWrite::Existing(id) => *id,
        }
    }
}

pub struct RawLayerWriter<'w, W: Warehouse + ?Sized> {
    warehouse: &'w W,
}

impl<'w, W: Warehouse + ?Sized> RawLayerWriter<'w, W> {
    pub fn new(warehouse: &'w W) -> Self {
        Self { warehouse }
    }

    /// Store the upload unless identical bytes are already stored. An
    /// unopenable workbook (`None`) is stored with zero sheets.
    pub async fn write(
        &self,
        batch_id: Uuid,
        filename: &str,
        bytes: &[u8],
        content_hash: &str,
        workbook: Option<&Workbook>,
    ) -> Result<RawWrite, StoreError> {
        if let Some(existing) = self.warehouse.find_raw_file_by_hash(content_hash).await? {
            tracing::info!(%batch_id, raw_file_id = %existing, "raw file already stored, reusing");
            return Ok(RawWrite::Existing(existing));
        }

        let record = RawFileRecord {
            raw_file_id: Uuid::new_v4(),
            batch_id,
            filename: filename.to_string(),
            content_hash: content_hash.to_string(),
            format: workbook.map(|w| w.format.as_str().to_string()),
            size_bytes: bytes.len() as i64,
            bytes: bytes.to_vec(),
        };
        let sheets = workbook.map(sheet_records).unwrap_or_default();
        match self.warehouse.insert_raw_file(&record, &sheets).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                // A concurrent upload of the same bytes won the insert.
                let existing = self.warehouse.find_raw_file_by_hash(content_hash).await?;
                let existing = existing.ok_or(StoreError::Conflict(reason))?;
                tracing::info!(%batch_id, raw_file_id = %existing, "raw file stored concurrently, reusing");
                return Ok(RawWrite::Existing(existing));
            }
            Err(e) => return Err(e),
        }
        tracing::info!(
            %batch_id,
            raw_file_id = %record.raw_file_id,
            sheets = sheets.len(),
            bytes = bytes.len(),
            "raw file stored"
        );
        Ok(RawWrite::Stored(record.raw_file_id))
    }
}
