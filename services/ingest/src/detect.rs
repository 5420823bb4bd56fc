//! Template detection: which vendor/format an upload is.
//!
//! Rules run in order: filename keywords, then structural probes of the opened
//! workbook (sheet names, a signature cell), then the generic fallback.
//! Detection only reads bytes and never fails; a probe that cannot run is
//! simply inconclusive.

use crate::error::WorkbookError;
use crate::workbook::{Sheet, Workbook};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetType {
    LhFuturesDaily,
    LhOptionsDaily,
    YongyiDaily,
    YongyiWeekly,
    GanglianDaily,
    Legacy,
    Unrecognized,
}

impl DatasetType {
    pub const ALL: [DatasetType; 7] = [
        DatasetType::LhFuturesDaily,
        DatasetType::LhOptionsDaily,
        DatasetType::YongyiDaily,
        DatasetType::YongyiWeekly,
        DatasetType::GanglianDaily,
        DatasetType::Legacy,
        DatasetType::Unrecognized,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            DatasetType::LhFuturesDaily => "LH_FUTURES_DAILY",
            DatasetType::LhOptionsDaily => "LH_OPTIONS_DAILY",
            DatasetType::YongyiDaily => "YONGYI_DAILY",
            DatasetType::YongyiWeekly => "YONGYI_WEEKLY",
            DatasetType::GanglianDaily => "GANGLIAN_DAILY",
            DatasetType::Legacy => "LEGACY",
            DatasetType::Unrecognized => "UNRECOGNIZED",
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase().replace('-', "_");
        DatasetType::ALL
            .iter()
            .copied()
            .find(|d| d.code() == wanted)
            .ok_or_else(|| format!("unknown dataset type '{}'", s))
    }
}

/// Filename rule: every `all` keyword and at least one `any` keyword (when
/// given) must appear in the lower-cased filename.
struct FilenameRule {
    all: &'static [&'static str],
    any: &'static [&'static str],
    dataset: DatasetType,
}

/// Order matters: options before futures ("生猪期权" files often also mention
/// futures), weekly before daily.
const FILENAME_RULES: &[FilenameRule] = &[
    FilenameRule { all: &[], any: &["期权", "option"], dataset: DatasetType::LhOptionsDaily },
    FilenameRule { all: &[], any: &["期货", "futures", "lh_daily"], dataset: DatasetType::LhFuturesDaily },
    FilenameRule { all: &["涌益"], any: &["周度", "周报", "weekly"], dataset: DatasetType::YongyiWeekly },
    FilenameRule { all: &["yongyi"], any: &["weekly"], dataset: DatasetType::YongyiWeekly },
    FilenameRule { all: &["涌益"], any: &[], dataset: DatasetType::YongyiDaily },
    FilenameRule { all: &["yongyi"], any: &[], dataset: DatasetType::YongyiDaily },
    FilenameRule { all: &[], any: &["钢联", "mysteel", "ganglian"], dataset: DatasetType::GanglianDaily },
];

impl FilenameRule {
    fn matches(&self, lower: &str) -> bool {
        self.all.iter().all(|k| lower.contains(k))
            && (self.any.is_empty() || self.any.iter().any(|k| lower.contains(k)))
    }
}

pub fn detect_from_filename(filename: &str) -> Option<DatasetType> {
    let lower = filename.to_lowercase();
    FILENAME_RULES.iter().find(|r| r.matches(&lower)).map(|r| r.dataset)
}

/// Structural probe over an opened workbook.
pub fn detect_from_workbook(workbook: &Workbook) -> Option<DatasetType> {
    let names = workbook.sheet_names();

    if let Some(first) = workbook.sheets.first() {
        let signature = top_left_text(first);
        if signature.contains("钢联数据") || signature.to_lowercase().contains("mysteel") {
            return Some(DatasetType::GanglianDaily);
        }
        if header_contains(first, "行权价") {
            return Some(DatasetType::LhOptionsDaily);
        }
        if header_contains(first, "合约代码") || header_contains(first, "持仓量") {
            return Some(DatasetType::LhFuturesDaily);
        }
    }

    let weekly_sheets = names.iter().filter(|n| n.starts_with("周度")).count();
    if weekly_sheets >= 2 {
        return Some(DatasetType::YongyiWeekly);
    }
    if names.iter().any(|n| n.contains("价格+宰量") || n.contains("出栏价")) {
        return Some(DatasetType::YongyiDaily);
    }
    None
}

fn top_left_text(sheet: &Sheet) -> String {
    sheet.cell(0, 0).text()
}

fn header_contains(sheet: &Sheet, needle: &str) -> bool {
    (0..sheet.height().min(3)).any(|r| (0..sheet.width()).any(|c| sheet.cell(r, c).text().contains(needle)))
}

/// Which rule settled the dataset type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    Filename,
    Structure,
    Fallback,
    Unreadable,
}

impl DetectedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectedBy::Filename => "filename",
            DetectedBy::Structure => "workbook structure",
            DetectedBy::Fallback => "fallback",
            DetectedBy::Unreadable => "unreadable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub dataset_type: DatasetType,
    pub by: DetectedBy,
}

/// Detection over an upload that was already opened (or failed to open).
pub fn detect_opened(filename: &str, opened: Result<&Workbook, &WorkbookError>) -> Detection {
    let (dataset_type, by) = match detect_from_filename(filename) {
        Some(found) => (found, DetectedBy::Filename),
        None => match opened {
            Ok(workbook) => match detect_from_workbook(workbook) {
                Some(found) => (found, DetectedBy::Structure),
                None => (DatasetType::Legacy, DetectedBy::Fallback),
            },
            Err(e) => {
                tracing::debug!(filename, error = %e, "workbook probe inconclusive");
                (DatasetType::Unrecognized, DetectedBy::Unreadable)
            }
        },
    };
    Detection { dataset_type, by }
}

/// Full detection over raw bytes.
pub fn detect_dataset_type(bytes: &[u8], filename: &str) -> Detection {
    if let Some(found) = detect_from_filename(filename) {
        return Detection {
            dataset_type: found,
            by: DetectedBy::Filename,
        };
    }
    detect_opened(filename, Workbook::from_bytes(bytes, filename).as_ref())
}
