//! Structural parsers.
//!
//! Every strategy turns one worksheet plus its sheet rule into a flat list of
//! `ObservationCandidate`s. A parser never fails because of a single bad cell:
//! such cells become candidates with `value = None` and the raw text kept, and
//! the validator decides what to do with them. The only error a parser returns
//! is a `SheetError`, meaning the layout does not match the profile at all.

pub mod narrow;
pub mod wide;

use crate::error::SheetError;
use crate::merge::MergeCache;
use crate::normalize::{parse_number, raw_text};
use crate::profile::{GeoStrategy, IngestProfile, MetricCategory, MetricTemplate, RangeBound, SheetRule, SheetStrategy};
use crate::tags::{merge_layers, ObservationTime, Tags};
use crate::workbook::{CellValue, Sheet};
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

pub use narrow::NarrowDateRowsParser;
pub use wide::WideDateGroupedParser;

/// Geographic hint as written in the sheet, resolved to an id later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoHint {
    pub name: Option<String>,
    pub strategy: GeoStrategy,
}

/// One candidate observation, before validation and id resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationCandidate {
    pub sheet: String,
    /// 1-based spreadsheet row.
    pub row: u32,
    /// 1-based spreadsheet column.
    pub column: u32,
    pub metric_key: String,
    pub metric_name: String,
    pub raw_header: String,
    pub unit: Option<String>,
    pub freq: Option<String>,
    pub category: MetricCategory,
    pub range: Option<RangeBound>,
    pub value: Option<f64>,
    pub raw_value: Option<String>,
    pub obs_date: Option<NaiveDate>,
    pub period: Option<(NaiveDate, NaiveDate)>,
    pub geo: GeoHint,
    pub company: Option<String>,
    pub warehouse: Option<String>,
    pub tags: Tags,
    pub source_code: String,
    pub batch_id: Uuid,
    /// Why the value is missing, when the parser knows (e.g. an Excel error cell).
    pub note: Option<String>,
}

impl ObservationCandidate {
    pub fn time(&self) -> Option<ObservationTime> {
        match (self.period, self.obs_date) {
            (Some((start, end)), _) => Some(ObservationTime::Period(start, end)),
            (None, Some(d)) => Some(ObservationTime::Day(d)),
            (None, None) => None,
        }
    }

    /// Date used for batch date-range bookkeeping.
    pub fn anchor_date(&self) -> Option<NaiveDate> {
        self.period.map(|(_, end)| end).or(self.obs_date)
    }
}

/// State shared by all sheets of one import: the merge-map cache.
#[derive(Debug, Default)]
pub struct ParseContext {
    pub merges: MergeCache,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything a parser needs besides the context.
pub struct ParseInput<'a> {
    pub sheet: &'a Sheet,
    pub rule: &'a SheetRule,
    pub profile: &'a IngestProfile,
    pub batch_id: Uuid,
}

pub trait SheetParser {
    fn name(&self) -> &'static str;

    fn parse(&self, ctx: &mut ParseContext, input: &ParseInput<'_>) -> Result<Vec<ObservationCandidate>, SheetError>;
}

/// Run whichever strategy the rule names. `RawTableOnly` and `Skip` produce
/// no candidates; their sheets live on in the raw layer only.
pub fn parse_sheet(ctx: &mut ParseContext, input: &ParseInput<'_>) -> Result<Vec<ObservationCandidate>, SheetError> {
    match &input.rule.strategy {
        SheetStrategy::Narrow(cfg) => NarrowDateRowsParser::new(cfg).parse(ctx, input),
        SheetStrategy::Wide(cfg) => WideDateGroupedParser::new(cfg).parse(ctx, input),
        SheetStrategy::RawTableOnly | SheetStrategy::Skip { .. } => Ok(Vec::new()),
    }
}

/// Fields common to both strategies for building a candidate from one cell.
pub(crate) struct CellSource<'a> {
    pub input: &'a ParseInput<'a>,
    pub template: &'a MetricTemplate,
    pub header: &'a str,
    pub row: u32,
    pub col: u32,
    pub cell: &'a CellValue,
    pub freq: Option<&'a String>,
}

impl CellSource<'_> {
    /// Build the candidate. `extracted` and `row_tags` are layered over the
    /// profile and sheet defaults; template static tags win over extraction,
    /// row-level tag columns win over everything.
    pub fn candidate(
        &self,
        obs_date: Option<NaiveDate>,
        period: Option<(NaiveDate, NaiveDate)>,
        geo: GeoHint,
        extracted: &Tags,
        row_tags: &Tags,
    ) -> ObservationCandidate {
        let profile = self.input.profile;
        let rule = self.input.rule;
        let tags = merge_layers(&[&profile.defaults.tags, &rule.tags, extracted, &self.template.tags, row_tags]);
        let note = match self.cell {
            CellValue::Error(e) => Some(format!("cell holds spreadsheet error {}", e)),
            _ => None,
        };
        ObservationCandidate {
            sheet: self.input.sheet.name.clone(),
            row: self.row + 1,
            column: self.col + 1,
            metric_key: self.template.metric_key.clone(),
            metric_name: self.template.metric_name.clone(),
            raw_header: self.header.trim().to_string(),
            unit: self
                .template
                .unit
                .clone()
                .or_else(|| rule.unit.clone())
                .or_else(|| profile.defaults.unit.clone()),
            freq: self.freq.cloned().or_else(|| profile.defaults.freq.clone()),
            category: self.template.category,
            range: self.template.range,
            value: parse_number(self.cell),
            raw_value: raw_text(self.cell),
            obs_date,
            period,
            geo,
            company: None,
            warehouse: None,
            tags,
            source_code: profile.source_code.clone(),
            batch_id: self.input.batch_id,
            note,
        }
    }
}

/// True when the label starts with one of the configured stop markers.
pub(crate) fn is_stop_row(label: &str, markers: &[String]) -> bool {
    let label = label.trim();
    !label.is_empty() && markers.iter().any(|m| !m.is_empty() && label.starts_with(m.as_str()))
}
