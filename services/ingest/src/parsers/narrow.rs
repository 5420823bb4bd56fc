//! Narrow layout: one row per date, one column per metric.

use super::{is_stop_row, CellSource, GeoHint, ObservationCandidate, ParseContext, ParseInput, SheetParser};
use crate::error::SheetError;
use crate::matcher::{assign_columns, normalize_header, region_from_header};
use crate::merge::MergedCellMap;
use crate::normalize::{parse_date_in_year, parse_date_range};
use crate::profile::{ColumnRef, GeoStrategy, NarrowConfig};
use crate::tags::Tags;
use crate::workbook::Sheet;
use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;

pub struct NarrowDateRowsParser<'c> {
    config: &'c NarrowConfig,
}

impl<'c> NarrowDateRowsParser<'c> {
    pub fn new(config: &'c NarrowConfig) -> Self {
        Self { config }
    }
}

/// Header text of one column, combining multi-row headers after merge
/// resolution. Repeated parts (a label merged across header rows) appear once.
fn header_label(sheet: &Sheet, merges: &MergedCellMap, rows: &[u32], col: u32, separator: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for row in rows {
        let text = merges.resolve(sheet, *row, col).text();
        if text.is_empty() || parts.last() == Some(&text) {
            continue;
        }
        parts.push(text);
    }
    parts.join(separator)
}

fn locate(headers: &[(u32, String)], column: &ColumnRef) -> Option<u32> {
    match column {
        ColumnRef::Index(idx) => Some(*idx),
        ColumnRef::Label(label) => {
            let wanted = normalize_header(label);
            headers
                .iter()
                .find(|(_, h)| normalize_header(h) == wanted)
                .map(|(c, _)| *c)
        }
    }
}

/// Date or period of one data row. `year` is the year of the last dated row,
/// used for year-less `m月d日` cells.
fn row_time(
    sheet: &Sheet,
    merges: &MergedCellMap,
    row: u32,
    date_col: u32,
    end_col: Option<u32>,
    year: Option<i32>,
) -> (Option<NaiveDate>, Option<(NaiveDate, NaiveDate)>) {
    let cell = merges.resolve(sheet, row, date_col);
    if let Some(end_col) = end_col {
        let start = parse_date_in_year(cell, year);
        let end = parse_date_in_year(merges.resolve(sheet, row, end_col), year);
        return match (start, end) {
            (Some(s), Some(e)) if s <= e => (None, Some((s, e))),
            (None, Some(e)) => (Some(e), None),
            (Some(s), _) => (Some(s), None),
            _ => (None, None),
        };
    }
    if let Some(d) = parse_date_in_year(cell, year) {
        return (Some(d), None);
    }
    match parse_date_range(&cell.text()) {
        Some(period) => (None, Some(period)),
        None => (None, None),
    }
}

impl SheetParser for NarrowDateRowsParser<'_> {
    fn name(&self) -> &'static str {
        "narrow_date_rows"
    }

    fn parse(&self, ctx: &mut ParseContext, input: &ParseInput<'_>) -> Result<Vec<ObservationCandidate>, SheetError> {
        let cfg = self.config;
        let sheet = input.sheet;
        let height = sheet.height();
        if let Some(&row) = cfg.header_rows.iter().find(|r| **r >= height) {
            return Err(SheetError::HeaderOutOfBounds { row: row + 1, height });
        }
        let merges = ctx.merges.get_or_build(sheet);

        let headers: Vec<(u32, String)> = (0..sheet.width())
            .map(|c| (c, header_label(sheet, &merges, &cfg.header_rows, c, &cfg.header_separator)))
            .filter(|(_, h)| !h.is_empty())
            .collect();

        let date_col = locate(&headers, &cfg.date_column).ok_or_else(|| {
            SheetError::DateColumnMissing(match &cfg.date_column {
                ColumnRef::Index(i) => crate::workbook::column_letter(*i),
                ColumnRef::Label(l) => l.clone(),
            })
        })?;
        let end_col = cfg.period_end_column.as_ref().and_then(|c| locate(&headers, c));
        let geo_col = cfg.geo_column.as_ref().and_then(|c| locate(&headers, c));
        let company_col = cfg.company_column.as_ref().and_then(|c| locate(&headers, c));
        let warehouse_col = cfg.warehouse_column.as_ref().and_then(|c| locate(&headers, c));
        let tag_cols: Vec<(String, u32)> = cfg
            .tag_columns
            .iter()
            .filter_map(|(key, c)| locate(&headers, c).map(|col| (key.clone(), col)))
            .collect();

        let reserved: HashSet<u32> = [Some(date_col), end_col, geo_col, company_col, warehouse_col]
            .into_iter()
            .flatten()
            .chain(tag_cols.iter().map(|(_, c)| *c))
            .collect();
        let metric_headers: Vec<(u32, String)> = headers
            .iter()
            .filter(|(c, _)| !reserved.contains(c))
            .cloned()
            .collect();

        let assignments = assign_columns(&metric_headers, &cfg.metrics);
        if assignments.is_empty() {
            return Err(SheetError::NoMetricColumns);
        }
        tracing::debug!(
            sheet = %sheet.name,
            columns = assignments.len(),
            "narrow parser assigned metric columns"
        );

        // Header-derived tags do not change per row.
        let header_tags: Vec<Tags> = assignments
            .iter()
            .map(|a| input.profile.tag_rules.extract(&[a.header.as_str()]))
            .collect();

        let text_at = |row: u32, col: Option<u32>| -> Option<String> {
            col.map(|c| merges.resolve(sheet, row, c).text()).filter(|t| !t.is_empty())
        };

        let mut out = Vec::new();
        let mut year: Option<i32> = None;
        for row in cfg.data_start_row..height {
            if sheet.is_row_blank(row) {
                continue;
            }
            let date_text = merges.resolve(sheet, row, date_col).text();
            if is_stop_row(&date_text, &cfg.stop_markers) {
                break;
            }
            if assignments.iter().all(|a| sheet.cell(row, a.column).is_blank()) {
                continue;
            }

            let (obs_date, period) = row_time(sheet, &merges, row, date_col, end_col, year);
            if let Some(d) = period.map(|(_, end)| end).or(obs_date) {
                year = Some(d.year());
            }
            let row_tags: Tags = tag_cols
                .iter()
                .filter_map(|(key, col)| text_at(row, Some(*col)).map(|v| (key.clone(), v)))
                .collect();
            let geo_text = text_at(row, geo_col);
            let company = text_at(row, company_col);
            let warehouse = text_at(row, warehouse_col);

            for (assignment, extracted) in assignments.iter().zip(&header_tags) {
                let cell = sheet.cell(row, assignment.column);
                if cell.is_blank() {
                    continue;
                }
                let template = &cfg.metrics[assignment.template];
                let geo_name = match template.geo {
                    GeoStrategy::Nation => Some(input.profile.national_geo().to_string()),
                    GeoStrategy::ColumnProvince => region_from_header(&assignment.header),
                    GeoStrategy::Alias | GeoStrategy::RowLabel => geo_text.clone(),
                };
                let source = CellSource {
                    input,
                    template,
                    header: &assignment.header,
                    row,
                    col: assignment.column,
                    cell,
                    freq: cfg.freq.as_ref(),
                };
                let mut candidate = source.candidate(
                    obs_date,
                    period,
                    GeoHint {
                        name: geo_name,
                        strategy: template.geo,
                    },
                    extracted,
                    &row_tags,
                );
                candidate.company = company.clone();
                candidate.warehouse = warehouse.clone();
                out.push(candidate);
            }
        }
        Ok(out)
    }
}
