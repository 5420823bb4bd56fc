//! Value and date normalizers.
//!
//! Pure functions from raw cell content to typed values. None of these fail
//! loudly: anything that cannot be interpreted comes back as `None` and the
//! caller keeps the raw text for the validator.

use crate::workbook::CellValue;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::OnceLock;

/// Serial numbers outside this window are not treated as dates
/// (1954-10-03 ..= 2173-10-14).
const SERIAL_MIN: f64 = 20_000.0;
const SERIAL_MAX: f64 = 100_000.0;

/// Text that means "no value" in vendor exports.
const PLACEHOLDERS: &[&str] = &["-", "--", "—", "——", "/", "\\", "n/a", "na", "#n/a", "null", "无", "停"];

/// Unit suffixes stripped before numeric parsing, longest first.
const UNIT_SUFFIXES: &[&str] = &[
    "元/公斤", "元/千克", "元/kg", "元/斤", "元/头", "元/吨", "万头", "公斤", "千克", "kg", "元", "头",
    "吨", "斤", "%", "％",
];

/// Range separators unified to `-` in tags and ranges.
pub const RANGE_SEPARATORS: &[char] = &['–', '—', '－', '~', '～', '〜', '至'];

/// Convert an Excel 1900-system serial to a date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::try_days(serial.floor() as i64)?)
}

/// Numeric value of a cell, if it has one.
pub fn parse_number(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) if n.is_finite() => Some(*n),
        CellValue::Text(s) => parse_number_text(s),
        _ => None,
    }
}

/// Numeric value of free text: separators and unit suffixes removed, ranges
/// resolved to their midpoint.
pub fn parse_number_text(text: &str) -> Option<f64> {
    let mut s: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '，' | ' ' | '\u{a0}'))
        .collect();
    if s.is_empty() || PLACEHOLDERS.contains(&s.to_lowercase().as_str()) {
        return None;
    }
    let kept = strip_unit_suffix(&s).len();
    s.truncate(kept);
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    // Ranges such as "14.2-14.6" or "14.2～14.6". A leading '-' is a sign.
    let unified = unify_range_separators(&s);
    let body = unified.strip_prefix('-').unwrap_or(&unified);
    let (lo, hi) = body.split_once('-')?;
    let lo: f64 = lo.parse().ok()?;
    let hi: f64 = hi.parse().ok()?;
    let lo = if unified.starts_with('-') { -lo } else { lo };
    Some((lo + hi) / 2.0)
}

/// `text` without a trailing unit suffix. Suffixes are compared on the
/// original bytes (ASCII case folded), so the cut always lands on a char
/// boundary.
fn strip_unit_suffix(text: &str) -> &str {
    for suffix in UNIT_SUFFIXES {
        let Some(cut) = text.len().checked_sub(suffix.len()) else { continue };
        if text.is_char_boundary(cut) && text[cut..].eq_ignore_ascii_case(suffix) {
            return &text[..cut];
        }
    }
    text
}

/// Replace every range separator variant with a plain hyphen.
pub fn unify_range_separators(text: &str) -> String {
    text.chars()
        .map(|c| if RANGE_SEPARATORS.contains(&c) { '-' } else { c })
        .collect()
}

/// Date value of a cell, if it has one.
pub fn parse_date(cell: &CellValue) -> Option<NaiveDate> {
    match cell {
        CellValue::DateTime(serial) => excel_serial_to_date(*serial),
        CellValue::Number(n) if (SERIAL_MIN..=SERIAL_MAX).contains(n) => excel_serial_to_date(*n),
        CellValue::Number(n) if n.fract() == 0.0 && (19_000_000.0..30_000_000.0).contains(n) => {
            parse_date_text(&format!("{}", *n as i64))
        }
        CellValue::IsoDateTime(s) | CellValue::Text(s) => parse_date_text(s),
        _ => None,
    }
}

/// Date of a cell, accepting a year-less `m月d日` when a year is known from
/// the surrounding rows or groups.
pub fn parse_date_in_year(cell: &CellValue, year: Option<i32>) -> Option<NaiveDate> {
    parse_date(cell).or_else(|| match cell {
        CellValue::Text(s) => parse_month_day(s, year?),
        _ => None,
    })
}

/// `2月3日` (the trailing 日 optional) in the given year.
pub fn parse_month_day(text: &str, year: i32) -> Option<NaiveDate> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d{1,2})\s*月\s*(\d{1,2})\s*日?$").expect("static regex"));
    let caps = re.captures(text.trim())?;
    let month = caps.get(1)?.as_str().parse().ok()?;
    let day = caps.get(2)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d", "%Y年%m月%d日"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// Date from text in any of the formats vendor files use.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    // Fractional seconds and timezone suffixes carry no date information.
    let s = s.split('.').next().filter(|head| head.contains('T') || head.contains(':')).unwrap_or(s);
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

fn ymd_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(\d{4})\s*[年./-]\s*)?(\d{1,2})\s*[月./-]\s*(\d{1,2})\s*日?$").expect("static regex")
    })
}

/// Period range such as `2026.01.26-2026.02.01`, `2026/1/26-2/1` or
/// `2026年1月26日-2月1日`. The end inherits the start's year when it has none
/// and rolls into the next year if it would otherwise precede the start.
pub fn parse_date_range(text: &str) -> Option<(NaiveDate, NaiveDate)> {
    let unified = unify_range_separators(text.trim());
    let (start_text, end_text) = split_range(&unified)?;
    let start = parse_partial_date(start_text, None)?;
    let mut end = parse_partial_date(end_text, Some(start.year()))?;
    if end < start {
        end = NaiveDate::from_ymd_opt(end.year() + 1, end.month(), end.day())?;
    }
    Some((start, end))
}

/// Split on the hyphen that separates two dates, not the ones inside a date.
fn split_range(text: &str) -> Option<(&str, &str)> {
    if let Some((a, b)) = text.split_once(" - ") {
        return Some((a.trim(), b.trim()));
    }
    let hyphens: Vec<usize> = text.match_indices('-').map(|(i, _)| i).collect();
    match hyphens.len() {
        0 => None,
        1 => Some((text[..hyphens[0]].trim(), text[hyphens[0] + 1..].trim())),
        // ISO dates on both sides: yyyy-mm-dd-yyyy-mm-dd
        5 => Some((text[..hyphens[2]].trim(), text[hyphens[2] + 1..].trim())),
        // yyyy-mm-dd-mm-dd
        3 => Some((text[..hyphens[2]].trim(), text[hyphens[2] + 1..].trim())),
        _ => None,
    }
}

fn parse_partial_date(text: &str, default_year: Option<i32>) -> Option<NaiveDate> {
    if let Some(d) = parse_date_text(text) {
        return Some(d);
    }
    let caps = ymd_regex().captures(text.trim())?;
    let year = match caps.get(1) {
        Some(y) => y.as_str().parse().ok()?,
        None => default_year?,
    };
    let month = caps.get(2)?.as_str().parse().ok()?;
    let day = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// A formula of the shape `=B3-6` or `=B3+1`: the referenced cell (0-based)
/// and the day offset to apply to it.
pub fn parse_offset_formula(formula: &str) -> Option<((u32, u32), i64)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^=\s*\$?([A-Za-z]{1,3})\$?(\d+)\s*([+-])\s*(\d+)\s*$").expect("static regex")
    });
    let caps = re.captures(formula.trim())?;
    let col = crate::workbook::column_index(caps.get(1)?.as_str())?;
    let row: u32 = caps.get(2)?.as_str().parse().ok()?;
    let magnitude: i64 = caps.get(4)?.as_str().parse().ok()?;
    let offset = if caps.get(3)?.as_str() == "-" { -magnitude } else { magnitude };
    Some(((row.checked_sub(1)?, col), offset))
}

/// Cells that look like the formula text of an unevaluated formula.
pub fn is_formula_text(cell: &CellValue) -> bool {
    matches!(cell, CellValue::Text(s) if s.trim_start().starts_with('='))
}

/// Canonical raw-value text kept alongside a parsed value.
pub fn raw_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Empty | CellValue::Error(_) => None,
        other => Some(other.text()).filter(|s| !s.is_empty()),
    }
}
