//! Wide layout: dates run across a header row, each date heading a group of
//! sub-columns, and rows are regions (or another tagged label).

use super::{is_stop_row, CellSource, GeoHint, ObservationCandidate, ParseContext, ParseInput, SheetParser};
use crate::error::SheetError;
use crate::matcher::{assign_columns, region_from_header};
use crate::merge::MergedCellMap;
use crate::normalize::{is_formula_text, parse_date, parse_date_in_year, parse_date_range, parse_month_day, parse_offset_formula};
use crate::profile::{GeoStrategy, LabelRole, WideConfig};
use crate::tags::Tags;
use crate::workbook::{CellValue, Sheet};
use chrono::{Datelike, Duration, NaiveDate};

/// How many formula hops are followed when a date cell points at another formula.
const MAX_FORMULA_DEPTH: u32 = 4;

pub struct WideDateGroupedParser<'c> {
    config: &'c WideConfig,
}

impl<'c> WideDateGroupedParser<'c> {
    pub fn new(config: &'c WideConfig) -> Self {
        Self { config }
    }
}

/// One date group: a run of columns `[start, end)` sharing a date header.
#[derive(Debug, Clone, PartialEq)]
struct DateGroup {
    start: u32,
    end: u32,
    obs_date: Option<NaiveDate>,
    period: Option<(NaiveDate, NaiveDate)>,
}

fn formula_of(sheet: &Sheet, row: u32, col: u32) -> Option<String> {
    if let Some(f) = sheet.formula(row, col) {
        return Some(f.to_string());
    }
    match sheet.cell(row, col) {
        CellValue::Text(s) if s.trim_start().starts_with('=') => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Date held by a cell, following `=B3-6` style offset formulas when the
/// cell has no usable cached value. `year` completes year-less `m月d日` text.
fn cell_date(sheet: &Sheet, row: u32, col: u32, depth: u32, year: Option<i32>) -> Option<NaiveDate> {
    if let Some(d) = parse_date_in_year(sheet.cell(row, col), year) {
        return Some(d);
    }
    if depth == 0 {
        return None;
    }
    let formula = formula_of(sheet, row, col)?;
    let ((ref_row, ref_col), offset) = parse_offset_formula(&formula)?;
    cell_date(sheet, ref_row, ref_col, depth - 1, year)?.checked_add_signed(Duration::try_days(offset)?)
}

fn is_date_like(sheet: &Sheet, row: u32, col: u32) -> bool {
    let cell = sheet.cell(row, col);
    parse_date(cell).is_some()
        || parse_month_day(&cell.text(), 2000).is_some()
        || parse_date_range(&cell.text()).is_some()
        || sheet.formula(row, col).is_some()
        || is_formula_text(cell)
}

impl WideDateGroupedParser<'_> {
    /// Scan the date row for groups. A group starts at every raw date-like
    /// cell and runs until the next non-blank cell, so groups may differ in
    /// width. Blank cells (usually the tail of a merged date) extend the
    /// current group.
    fn date_groups(&self, sheet: &Sheet) -> Vec<DateGroup> {
        let cfg = self.config;
        let width = sheet.width();
        let mut starts: Vec<u32> = Vec::new();
        let mut bounds: Vec<u32> = Vec::new();
        for col in 0..width {
            if Some(col) == cfg.label_column {
                continue;
            }
            let cell = sheet.cell(cfg.date_row, col);
            if cell.is_blank() && sheet.formula(cfg.date_row, col).is_none() {
                continue;
            }
            bounds.push(col);
            if is_date_like(sheet, cfg.date_row, col) {
                starts.push(col);
            }
        }

        let mut year: Option<i32> = None;
        starts
            .iter()
            .map(|&start| {
                let mut end = bounds.iter().copied().find(|b| *b > start).unwrap_or(width);
                if let Some(label) = cfg.label_column {
                    if label > start && label < end {
                        end = label;
                    }
                }
                let (obs_date, period) = self.group_time(sheet, start, year);
                if let Some(d) = period.map(|(_, end)| end).or(obs_date) {
                    year = Some(d.year());
                }
                DateGroup {
                    start,
                    end,
                    obs_date,
                    period,
                }
            })
            .collect()
    }

    fn group_time(&self, sheet: &Sheet, col: u32, year: Option<i32>) -> (Option<NaiveDate>, Option<(NaiveDate, NaiveDate)>) {
        let cfg = self.config;
        if let Some(period) = parse_date_range(&sheet.cell(cfg.date_row, col).text()) {
            return (None, Some(period));
        }
        let Some(end) = cell_date(sheet, cfg.date_row, col, MAX_FORMULA_DEPTH, year) else {
            return (None, None);
        };
        let explicit_start = cfg
            .period_start_row
            .and_then(|row| cell_date(sheet, row, col, MAX_FORMULA_DEPTH, Some(end.year())));
        match explicit_start {
            Some(start) if start <= end => (None, Some((start, end))),
            _ if cfg.period_days > 1 => {
                let start = Duration::try_days(i64::from(cfg.period_days) - 1).and_then(|back| end.checked_sub_signed(back));
                match start {
                    Some(start) => (None, Some((start, end))),
                    None => (Some(end), None),
                }
            }
            _ => (Some(end), None),
        }
    }
}

fn sub_label(sheet: &Sheet, merges: &MergedCellMap, row: Option<u32>, col: u32) -> String {
    match row {
        Some(r) => merges.resolve(sheet, r, col).text(),
        None => sheet.name.trim().to_string(),
    }
}

impl SheetParser for WideDateGroupedParser<'_> {
    fn name(&self) -> &'static str {
        "wide_date_grouped"
    }

    fn parse(&self, ctx: &mut ParseContext, input: &ParseInput<'_>) -> Result<Vec<ObservationCandidate>, SheetError> {
        let cfg = self.config;
        let sheet = input.sheet;
        let height = sheet.height();
        if cfg.date_row >= height {
            return Err(SheetError::HeaderOutOfBounds {
                row: cfg.date_row + 1,
                height,
            });
        }
        let merges = ctx.merges.get_or_build(sheet);

        let groups = self.date_groups(sheet);
        if groups.is_empty() {
            return Err(SheetError::NoDateGroups(cfg.date_row + 1));
        }

        let mut assigned = Vec::new();
        for group in &groups {
            let headers: Vec<(u32, String)> = (group.start..group.end)
                .map(|c| (c, sub_label(sheet, &merges, cfg.sub_header_row, c)))
                .filter(|(_, h)| !h.is_empty())
                .collect();
            for assignment in assign_columns(&headers, &cfg.metrics) {
                assigned.push((group, assignment));
            }
        }
        if assigned.is_empty() {
            return Err(SheetError::NoMetricColumns);
        }
        tracing::debug!(
            sheet = %sheet.name,
            groups = groups.len(),
            columns = assigned.len(),
            "wide parser assigned metric columns"
        );

        let mut out = Vec::new();
        for row in cfg.data_start_row..height {
            if sheet.is_row_blank(row) {
                continue;
            }
            let label = cfg
                .label_column
                .map(|c| merges.resolve(sheet, row, c).text())
                .unwrap_or_default();
            if is_stop_row(&label, &cfg.stop_markers) {
                break;
            }

            let mut row_tags = Tags::new();
            let mut row_geo = None;
            if !label.is_empty() {
                match &cfg.label_role {
                    LabelRole::Geo => row_geo = Some(label.clone()),
                    LabelRole::Tag(key) => {
                        row_tags.insert(key.clone(), label.clone());
                    }
                }
            }

            for (group, assignment) in &assigned {
                let cell = sheet.cell(row, assignment.column);
                if cell.is_blank() {
                    continue;
                }
                let template = &cfg.metrics[assignment.template];
                let geo_name = match template.geo {
                    GeoStrategy::Nation => match (&cfg.label_role, &row_geo) {
                        (LabelRole::Geo, Some(name)) => Some(name.clone()),
                        _ => Some(input.profile.national_geo().to_string()),
                    },
                    GeoStrategy::ColumnProvince => region_from_header(&assignment.header),
                    GeoStrategy::Alias | GeoStrategy::RowLabel => row_geo.clone(),
                };
                let extracted = input.profile.tag_rules.extract(&[assignment.header.as_str(), label.as_str()]);
                let source = CellSource {
                    input,
                    template,
                    header: &assignment.header,
                    row,
                    col: assignment.column,
                    cell,
                    freq: cfg.freq.as_ref(),
                };
                out.push(source.candidate(
                    group.obs_date,
                    group.period,
                    GeoHint {
                        name: geo_name,
                        strategy: template.geo,
                    },
                    &extracted,
                    &row_tags,
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{profile, rule};
    use super::super::{parse_sheet, ParseContext, ParseInput};
    use crate::error::SheetError;
    use crate::profile::tests::YONGYI_DAILY_PROFILE;
    use crate::profile::GeoStrategy;
    use crate::workbook::{MergeRegion, Sheet};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn run(profile_json: &str, rule_index: usize, sheet: &Sheet) -> Result<Vec<super::ObservationCandidate>, SheetError> {
        let profile = profile(profile_json);
        let input = ParseInput {
            sheet,
            rule: rule(&profile, rule_index),
            profile: &profile,
            batch_id: Uuid::nil(),
        };
        parse_sheet(&mut ParseContext::new(), &input)
    }

    /// Two weekly groups of different widths, merged date headers, a trailing
    /// note column and a footnote row.
    fn weekly_sheet() -> Sheet {
        Sheet::from_text_rows(
            "周度-出栏均重",
            &[
                &["地区", "2026.01.26-2026.02.01", "", "2026.02.02-2026.02.08", "", "", "备注"],
                &["", "出栏均重", "规模场均重", "出栏均重", "规模场均重", "散户均重", "说明文字"],
                &["河南", "120.5", "125", "121", "126", "118", "x"],
                &["山东", "119", "", "120", "124.5", "117", ""],
                &["注：单位公斤", "1", "1", "1", "1", "1", ""],
                &["四川", "130", "130", "130", "130", "130", ""],
            ],
        )
        .with_merges(vec![MergeRegion::new(0, 1, 0, 2), MergeRegion::new(0, 3, 0, 5)])
    }

    #[test]
    fn test_ragged_groups_and_periods() {
        let out = run(YONGYI_DAILY_PROFILE, 3, &weekly_sheet()).unwrap();
        // 河南: 2 + 3, 山东: 1 + 3 (one blank), stop marker ends the scan
        assert_eq!(out.len(), 9);
        assert!(out.iter().all(|c| c.metric_key == "avg_weight"));
        assert!(out.iter().all(|c| c.column <= 6));

        let first = &out[0];
        assert_eq!(first.period, Some((d(1, 26), d(2, 1))));
        assert_eq!(first.obs_date, None);
        assert_eq!(first.geo.name.as_deref(), Some("河南"));
        assert_eq!(first.geo.strategy, GeoStrategy::RowLabel);
        assert_eq!(first.raw_header, "出栏均重");
        assert_eq!(first.value, Some(120.5));
        assert_eq!(first.unit.as_deref(), Some("公斤"));

        let second_group: Vec<_> = out.iter().filter(|c| c.period == Some((d(2, 2), d(2, 8)))).collect();
        assert_eq!(second_group.len(), 6);
        assert!(out.iter().all(|c| c.geo.name.as_deref() != Some("四川")));
    }

    #[test]
    fn test_sub_label_tags_extracted() {
        let out = run(YONGYI_DAILY_PROFILE, 3, &weekly_sheet()).unwrap();
        let large = out.iter().find(|c| c.raw_header == "规模场均重").unwrap();
        assert_eq!(large.tags.get("scale").map(String::as_str), Some("large"));
        let small = out.iter().find(|c| c.raw_header == "散户均重").unwrap();
        assert_eq!(small.tags.get("scale").map(String::as_str), Some("small"));
        let plain = out.iter().find(|c| c.raw_header == "出栏均重").unwrap();
        assert!(plain.tags.get("scale").is_none());
    }

    #[test]
    fn test_no_date_row_is_sheet_error() {
        let sheet = Sheet::from_text_rows("周度-均重", &[&["地区", "均重"], &["", "均重"], &["河南", "120"]]);
        assert_eq!(run(YONGYI_DAILY_PROFILE, 3, &sheet), Err(SheetError::NoDateGroups(1)));
    }

    const FORMULA_PROFILE: &str = r#"{
        "dataset_type": "YONGYI_WEEKLY",
        "version": 1,
        "source_code": "YONGYI",
        "sheets": [{
            "sheet_name": "周度-价格",
            "parser": "wide_date_grouped",
            "period_start_row": 1,
            "date_row": 2,
            "sub_header_row": 3,
            "data_start_row": 4,
            "label_column": "A",
            "label_role": "tag:city",
            "metrics": [
                { "metric_key": "piglet_price", "metric_name": "仔猪价格", "contains": ["仔猪"], "unit": "元/头", "category": "price" }
            ]
        }]
    }"#;

    #[test]
    fn test_formula_dates_and_tag_label() {
        let sheet = Sheet::from_text_rows(
            "周度-价格",
            &[
                &["", "=B2-6", ""],
                &["", "2026-02-08", ""],
                &["城市", "仔猪价格", "仔猪价格"],
                &["北京", "420", "430"],
            ],
        )
        .with_formula(1, 2, "=B2+7");
        let out = run(FORMULA_PROFILE, 0, &sheet).unwrap();
        assert_eq!(out.len(), 2);

        assert_eq!(out[0].period, Some((d(2, 2), d(2, 8))));
        // No explicit start for the second group: falls back to a 7-day window.
        assert_eq!(out[1].period, Some((d(2, 9), d(2, 15))));

        for c in &out {
            assert_eq!(c.tags.get("city").map(String::as_str), Some("北京"));
            assert_eq!(c.geo.strategy, GeoStrategy::Nation);
            assert_eq!(c.geo.name.as_deref(), Some("中国"));
        }
    }

    #[test]
    fn test_daily_groups_without_period() {
        let json = r#"{
            "dataset_type": "GANGLIAN_DAILY",
            "version": 1,
            "source_code": "MYSTEEL",
            "sheets": [{
                "sheet_name": "日度",
                "parser": "wide_date_grouped",
                "date_row": 1,
                "period_days": 1,
                "data_start_row": 2,
                "label_column": "A",
                "metrics": [
                    { "metric_key": "price", "metric_name": "价格", "raw_headers": ["日度"], "geo": "row_label" }
                ]
            }]
        }"#;
        let sheet = Sheet::from_text_rows(
            "日度",
            &[&["", "2026-02-01", "2026-02-02"], &["河南", "14.1", "14.3"]],
        );
        let out = run(json, 0, &sheet).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].obs_date, Some(d(2, 1)));
        assert_eq!(out[0].period, None);
        assert_eq!(out[1].obs_date, Some(d(2, 2)));
        assert_eq!(out[1].raw_header, "日度");
    }

    #[test]
    fn test_runaway_offset_formula_is_no_date() {
        let sheet = Sheet::from_text_rows(
            "周度-价格",
            &[&["2026-01-05", "=A1+999999999999999", "=A1+99999999", "=A1-3"]],
        );
        assert_eq!(super::cell_date(&sheet, 0, 1, 4, None), None);
        assert_eq!(super::cell_date(&sheet, 0, 2, 4, None), None);
        assert_eq!(super::cell_date(&sheet, 0, 3, 4, None), Some(d(1, 2)));
    }

    #[test]
    fn test_runaway_offset_header_does_not_abort_sheet() {
        let sheet = Sheet::from_text_rows(
            "周度-价格",
            &[
                &["", "=B2-6", "=B2-999999999999999"],
                &["", "2026-02-08", "=B2+999999999999999"],
                &["城市", "仔猪价格", "仔猪价格"],
                &["北京", "420", "430"],
            ],
        );
        let out = run(FORMULA_PROFILE, 0, &sheet).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].period, Some((d(2, 2), d(2, 8))));
        assert_eq!(out[1].period, None);
        assert_eq!(out[1].obs_date, None);
    }

    #[test]
    fn test_month_day_headers_take_year_from_previous_group() {
        let json = r#"{
            "dataset_type": "GANGLIAN_DAILY",
            "version": 1,
            "source_code": "MYSTEEL",
            "sheets": [{
                "sheet_name": "日度",
                "parser": "wide_date_grouped",
                "date_row": 1,
                "period_days": 1,
                "data_start_row": 2,
                "label_column": "A",
                "metrics": [
                    { "metric_key": "price", "metric_name": "价格", "raw_headers": ["日度"], "geo": "row_label" }
                ]
            }]
        }"#;
        let sheet = Sheet::from_text_rows("日度", &[&["", "2026-02-01", "2月2日"], &["河南", "14.1", "14.3"]]);
        let out = run(json, 0, &sheet).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].obs_date, Some(d(2, 2)));
    }
}
