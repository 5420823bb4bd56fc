//! Spreadsheet ingestion for market-data vendor workbooks.
//!
//! Uploads go through detection, a lossless raw layer, profile-driven sheet
//! dispatch, structural parsing, validation and an idempotent fact upsert.
//! Every import is recorded as a batch with row-level diagnostics.

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod matcher;
pub mod merge;
pub mod normalize;
pub mod parsers;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod raw;
pub mod store;
pub mod tags;
pub mod validate;
pub mod workbook;

pub use detect::{detect_dataset_type, DatasetType};
pub use error::{ErrorKind, PipelineError, Severity};
pub use pipeline::{ImportRequest, ImportResponse, ImportSummary, Pipeline, PipelineOptions};
pub use store::{BatchStatus, MemoryWarehouse, PgWarehouse, Warehouse};
