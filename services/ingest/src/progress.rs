//! Progress reporting for long imports.

use crate::store::BatchStatus;
use uuid::Uuid;

/// Receives progress events from the pipeline. Implementations decide where
/// they go (logs, an external progress store keyed by batch id, nowhere).
pub trait ProgressSink: Send + Sync {
    fn batch_started(&self, batch_id: Uuid, filename: &str, sheets: usize);

    fn sheet_finished(&self, batch_id: Uuid, sheet: &str, candidates: usize, errors: usize);

    fn chunk_committed(&self, batch_id: Uuid, inserted: u64, skipped: u64);

    fn batch_finished(&self, batch_id: Uuid, status: BatchStatus);
}

/// Emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn batch_started(&self, batch_id: Uuid, filename: &str, sheets: usize) {
        tracing::info!(%batch_id, filename, sheets, "import started");
    }

    fn sheet_finished(&self, batch_id: Uuid, sheet: &str, candidates: usize, errors: usize) {
        tracing::info!(%batch_id, sheet, candidates, errors, "sheet finished");
    }

    fn chunk_committed(&self, batch_id: Uuid, inserted: u64, skipped: u64) {
        tracing::debug!(%batch_id, inserted, skipped, "chunk committed");
    }

    fn batch_finished(&self, batch_id: Uuid, status: BatchStatus) {
        tracing::info!(%batch_id, status = status.as_str(), "import finished");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn batch_started(&self, _: Uuid, _: &str, _: usize) {}
    fn sheet_finished(&self, _: Uuid, _: &str, _: usize, _: usize) {}
    fn chunk_committed(&self, _: Uuid, _: u64, _: u64) {}
    fn batch_finished(&self, _: Uuid, _: BatchStatus) {}
}
