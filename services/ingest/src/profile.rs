//! Ingest profiles.
//!
//! A profile is the declarative description of one dataset type: which sheets
//! exist, which parser applies to each, and which metric columns to look for.
//! Profiles arrive as JSON (`ProfileDocument`) and are compiled into
//! `IngestProfile` before anything is stored, so a bad pattern or a missing
//! header definition is rejected at load time, never mid-batch.

use crate::detect::DatasetType;
use crate::error::ProfileError;
use crate::tags::{TagRule, TagRules, Tags};
use crate::workbook::column_index;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_NATIONAL_GEO: &str = "中国";
/// Longest period a wide sheet group may span.
pub const MAX_PERIOD_DAYS: u32 = 366;
pub const DEFAULT_STOP_MARKERS: &[&str] = &["注", "备注", "数据来源", "来源", "说明"];

// =============================================================================
// JSON DOCUMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileDocument {
    pub dataset_type: String,
    pub version: i32,
    pub source_code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: ProfileDefaults,
    #[serde(default)]
    pub tag_rules: Vec<TagRule>,
    pub sheets: Vec<SheetRuleDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileDefaults {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub freq: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub national_geo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SheetRuleDoc {
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub sheet_pattern: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(flatten)]
    pub strategy: StrategyDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "parser", rename_all = "snake_case")]
pub enum StrategyDoc {
    NarrowDateRows(NarrowDoc),
    WideDateGrouped(WideDoc),
    RawTableOnly,
    Skip {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NarrowDoc {
    #[serde(default = "default_header_rows")]
    pub header_rows: Vec<u32>,
    #[serde(default)]
    pub header_separator: Option<String>,
    #[serde(default)]
    pub data_start_row: Option<u32>,
    pub date_column: String,
    #[serde(default)]
    pub period_end_column: Option<String>,
    #[serde(default)]
    pub tag_columns: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub geo_column: Option<String>,
    #[serde(default)]
    pub company_column: Option<String>,
    #[serde(default)]
    pub warehouse_column: Option<String>,
    #[serde(default)]
    pub stop_markers: Option<Vec<String>>,
    #[serde(default)]
    pub freq: Option<String>,
    pub metrics: Vec<MetricTemplateDoc>,
}

fn default_header_rows() -> Vec<u32> {
    vec![1]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WideDoc {
    pub date_row: u32,
    #[serde(default)]
    pub period_start_row: Option<u32>,
    #[serde(default)]
    pub period_days: Option<u32>,
    #[serde(default)]
    pub sub_header_row: Option<u32>,
    pub data_start_row: u32,
    #[serde(default)]
    pub label_column: Option<String>,
    #[serde(default)]
    pub label_role: Option<String>,
    #[serde(default)]
    pub stop_markers: Option<Vec<String>>,
    #[serde(default)]
    pub freq: Option<String>,
    pub metrics: Vec<MetricTemplateDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricTemplateDoc {
    pub metric_key: String,
    pub metric_name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub raw_headers: Vec<String>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub category: MetricCategory,
    #[serde(default)]
    pub range: Option<RangeBound>,
    #[serde(default)]
    pub geo: GeoStrategy,
    #[serde(default)]
    pub multi: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Price,
    Volume,
    Weight,
    Ratio,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeBound {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl RangeBound {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// How the geographic dimension of an observation is determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoStrategy {
    /// Nation-wide figure.
    #[default]
    Nation,
    /// Region is the last segment of the matched column header.
    ColumnProvince,
    /// Region comes from a geo column or row label and must already be a known alias.
    Alias,
    /// Region comes from the wide parser's row label (created on first sight).
    RowLabel,
}

// =============================================================================
// COMPILED PROFILE
// =============================================================================

#[derive(Debug, Clone)]
pub struct IngestProfile {
    pub dataset_type: DatasetType,
    pub version: i32,
    pub source_code: String,
    pub defaults: ProfileDefaults,
    pub tag_rules: TagRules,
    pub sheets: Vec<SheetRule>,
}

impl IngestProfile {
    pub fn national_geo(&self) -> &str {
        self.defaults.national_geo.as_deref().unwrap_or(DEFAULT_NATIONAL_GEO)
    }
}

#[derive(Debug, Clone)]
pub enum SheetSelector {
    Exact(String),
    Pattern(Regex),
}

impl SheetSelector {
    pub fn describe(&self) -> String {
        match self {
            SheetSelector::Exact(name) => name.clone(),
            SheetSelector::Pattern(re) => format!("/{}/", re.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetRule {
    pub selector: SheetSelector,
    pub priority: i32,
    /// Position in the document; breaks priority ties.
    pub order: usize,
    pub unit: Option<String>,
    pub tags: Tags,
    pub strategy: SheetStrategy,
}

#[derive(Debug, Clone)]
pub enum SheetStrategy {
    Narrow(NarrowConfig),
    Wide(WideConfig),
    RawTableOnly,
    Skip { reason: Option<String> },
}

impl SheetStrategy {
    pub fn parser_name(&self) -> &'static str {
        match self {
            SheetStrategy::Narrow(_) => "narrow_date_rows",
            SheetStrategy::Wide(_) => "wide_date_grouped",
            SheetStrategy::RawTableOnly => "raw_table_only",
            SheetStrategy::Skip { .. } => "skip",
        }
    }
}

/// A column given either by letter (`"B"`) or by header label (`"日期"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Index(u32),
    Label(String),
}

impl ColumnRef {
    /// Upper-case letters only count as column letters, so short labels such
    /// as "day" stay labels.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let is_letters = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_uppercase());
        match column_index(trimmed) {
            Some(idx) if is_letters => ColumnRef::Index(idx),
            _ => ColumnRef::Label(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrowConfig {
    /// 0-based header rows.
    pub header_rows: Vec<u32>,
    pub header_separator: String,
    /// 0-based first data row.
    pub data_start_row: u32,
    pub date_column: ColumnRef,
    pub period_end_column: Option<ColumnRef>,
    pub tag_columns: Vec<(String, ColumnRef)>,
    pub geo_column: Option<ColumnRef>,
    pub company_column: Option<ColumnRef>,
    pub warehouse_column: Option<ColumnRef>,
    pub stop_markers: Vec<String>,
    pub freq: Option<String>,
    pub metrics: Vec<MetricTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelRole {
    Geo,
    Tag(String),
}

#[derive(Debug, Clone)]
pub struct WideConfig {
    /// All rows 0-based.
    pub date_row: u32,
    pub period_start_row: Option<u32>,
    pub period_days: u32,
    pub sub_header_row: Option<u32>,
    pub data_start_row: u32,
    pub label_column: Option<u32>,
    pub label_role: LabelRole,
    pub stop_markers: Vec<String>,
    pub freq: Option<String>,
    pub metrics: Vec<MetricTemplate>,
}

#[derive(Debug, Clone)]
pub struct MetricTemplate {
    pub metric_key: String,
    pub metric_name: String,
    pub unit: Option<String>,
    pub raw_headers: Vec<String>,
    pub contains: Vec<String>,
    pub pattern: Option<Regex>,
    pub exclude_keywords: Vec<String>,
    pub tags: Tags,
    pub category: MetricCategory,
    pub range: Option<RangeBound>,
    pub geo: GeoStrategy,
    pub multi: bool,
}

// =============================================================================
// COMPILATION
// =============================================================================

impl ProfileDocument {
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Stable checksum of the document, used to make re-loading a no-op.
    pub fn checksum(&self) -> Result<String, ProfileError> {
        let canonical = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", crate::tags::hex_sha256(&canonical)))
    }

    pub fn compile(&self) -> Result<IngestProfile, ProfileError> {
        let dataset_type: DatasetType = self
            .dataset_type
            .parse()
            .map_err(|_| ProfileError::UnknownDatasetType(self.dataset_type.clone()))?;

        let mut sheets = Vec::with_capacity(self.sheets.len());
        let mut seen_names = HashSet::new();
        for (index, doc) in self.sheets.iter().enumerate() {
            let selector = match (&doc.sheet_name, &doc.sheet_pattern) {
                (Some(name), None) => {
                    if !seen_names.insert(name.trim().to_string()) {
                        return Err(sheet_err(index, format!("duplicate sheet_name '{}'", name)));
                    }
                    SheetSelector::Exact(name.trim().to_string())
                }
                (None, Some(pattern)) => SheetSelector::Pattern(compile_regex(pattern)?),
                (Some(_), Some(_)) => {
                    return Err(sheet_err(index, "give either sheet_name or sheet_pattern, not both"))
                }
                (None, None) => return Err(sheet_err(index, "sheet_name or sheet_pattern is required")),
            };
            let label = selector.describe();
            let strategy = match &doc.strategy {
                StrategyDoc::NarrowDateRows(n) => SheetStrategy::Narrow(compile_narrow(index, &label, n)?),
                StrategyDoc::WideDateGrouped(w) => SheetStrategy::Wide(compile_wide(index, &label, w)?),
                StrategyDoc::RawTableOnly => SheetStrategy::RawTableOnly,
                StrategyDoc::Skip { reason } => SheetStrategy::Skip { reason: reason.clone() },
            };
            sheets.push(SheetRule {
                selector,
                priority: doc.priority,
                order: index,
                unit: doc.unit.clone(),
                tags: doc.tags.clone(),
                strategy,
            });
        }

        Ok(IngestProfile {
            dataset_type,
            version: self.version,
            source_code: self.source_code.clone(),
            defaults: self.defaults.clone(),
            tag_rules: TagRules::with_overrides(&self.tag_rules),
            sheets,
        })
    }
}

fn sheet_err(index: usize, message: impl Into<String>) -> ProfileError {
    ProfileError::Sheet {
        index,
        message: message.into(),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, ProfileError> {
    Regex::new(pattern).map_err(|source| ProfileError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// 1-based row from the document to 0-based.
fn row_index(index: usize, field: &str, row: u32) -> Result<u32, ProfileError> {
    row.checked_sub(1)
        .ok_or_else(|| sheet_err(index, format!("{} is 1-based, got 0", field)))
}

fn stop_markers(doc: &Option<Vec<String>>) -> Vec<String> {
    doc.clone()
        .unwrap_or_else(|| DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect())
}

fn compile_narrow(index: usize, sheet: &str, doc: &NarrowDoc) -> Result<NarrowConfig, ProfileError> {
    if doc.header_rows.is_empty() {
        return Err(sheet_err(index, "header_rows must not be empty"));
    }
    let header_rows = doc
        .header_rows
        .iter()
        .map(|r| row_index(index, "header_rows", *r))
        .collect::<Result<Vec<_>, _>>()?;
    let last_header = header_rows.iter().copied().max().unwrap_or(0);
    let data_start_row = match doc.data_start_row {
        Some(r) => row_index(index, "data_start_row", r)?,
        None => last_header + 1,
    };
    if data_start_row <= last_header {
        return Err(sheet_err(index, "data_start_row must come after the header rows"));
    }
    let metrics = compile_metrics(sheet, &doc.metrics)?;
    if metrics.is_empty() {
        return Err(sheet_err(index, "narrow_date_rows needs at least one metric"));
    }
    Ok(NarrowConfig {
        header_rows,
        header_separator: doc.header_separator.clone().unwrap_or_else(|| "：".to_string()),
        data_start_row,
        date_column: ColumnRef::parse(&doc.date_column),
        period_end_column: doc.period_end_column.as_deref().map(ColumnRef::parse),
        tag_columns: doc
            .tag_columns
            .iter()
            .map(|(k, c)| (k.clone(), ColumnRef::parse(c)))
            .collect(),
        geo_column: doc.geo_column.as_deref().map(ColumnRef::parse),
        company_column: doc.company_column.as_deref().map(ColumnRef::parse),
        warehouse_column: doc.warehouse_column.as_deref().map(ColumnRef::parse),
        stop_markers: stop_markers(&doc.stop_markers),
        freq: doc.freq.clone(),
        metrics,
    })
}

fn compile_wide(index: usize, sheet: &str, doc: &WideDoc) -> Result<WideConfig, ProfileError> {
    let date_row = row_index(index, "date_row", doc.date_row)?;
    let period_start_row = doc
        .period_start_row
        .map(|r| row_index(index, "period_start_row", r))
        .transpose()?;
    let sub_header_row = doc
        .sub_header_row
        .map(|r| row_index(index, "sub_header_row", r))
        .transpose()?;
    let data_start_row = row_index(index, "data_start_row", doc.data_start_row)?;
    let last_header = [Some(date_row), period_start_row, sub_header_row]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(date_row);
    if data_start_row <= last_header {
        return Err(sheet_err(index, "data_start_row must come after the header rows"));
    }
    let label_column = match &doc.label_column {
        Some(c) => match ColumnRef::parse(c) {
            ColumnRef::Index(i) => Some(i),
            ColumnRef::Label(l) => {
                return Err(sheet_err(index, format!("label_column must be a column letter, got '{}'", l)))
            }
        },
        None => None,
    };
    let label_role = match doc.label_role.as_deref().map(str::trim) {
        None | Some("geo") => LabelRole::Geo,
        Some(role) => match role.strip_prefix("tag:") {
            Some(key) if !key.trim().is_empty() => LabelRole::Tag(key.trim().to_string()),
            _ => return Err(sheet_err(index, format!("label_role must be 'geo' or 'tag:<key>', got '{}'", role))),
        },
    };
    let period_days = doc.period_days.unwrap_or(7);
    if period_days == 0 || period_days > MAX_PERIOD_DAYS {
        return Err(sheet_err(index, format!("period_days must be between 1 and {}, got {}", MAX_PERIOD_DAYS, period_days)));
    }
    let metrics = compile_metrics(sheet, &doc.metrics)?;
    if metrics.is_empty() {
        return Err(sheet_err(index, "wide_date_grouped needs at least one metric"));
    }
    Ok(WideConfig {
        date_row,
        period_start_row,
        period_days,
        sub_header_row,
        data_start_row,
        label_column,
        label_role,
        stop_markers: stop_markers(&doc.stop_markers),
        freq: doc.freq.clone(),
        metrics,
    })
}

fn compile_metrics(sheet: &str, docs: &[MetricTemplateDoc]) -> Result<Vec<MetricTemplate>, ProfileError> {
    let mut keys = HashSet::new();
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let fail = |message: &str| ProfileError::Metric {
            sheet: sheet.to_string(),
            metric: doc.metric_key.clone(),
            message: message.to_string(),
        };
        if doc.metric_key.trim().is_empty() {
            return Err(fail("metric_key is empty"));
        }
        if !keys.insert(doc.metric_key.clone()) {
            return Err(fail("duplicate metric_key in sheet"));
        }
        if doc.raw_headers.is_empty() && doc.contains.is_empty() && doc.pattern.is_none() {
            return Err(fail("needs raw_headers, contains or pattern"));
        }
        if let Some(range) = &doc.range {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(fail("range.min is greater than range.max"));
                }
            }
        }
        out.push(MetricTemplate {
            metric_key: doc.metric_key.trim().to_string(),
            metric_name: doc.metric_name.trim().to_string(),
            unit: doc.unit.clone(),
            raw_headers: doc.raw_headers.iter().map(|h| h.trim().to_string()).collect(),
            contains: doc.contains.clone(),
            pattern: doc.pattern.as_deref().map(compile_regex).transpose()?,
            exclude_keywords: doc.exclude_keywords.clone(),
            tags: doc.tags.clone(),
            category: doc.category,
            range: doc.range,
            geo: doc.geo,
            multi: doc.multi,
        });
    }
    Ok(out)
}
