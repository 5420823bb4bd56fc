//! In-memory workbook model.
//!
//! Uploads are decoded once into `Workbook`/`Sheet` grids addressed by absolute
//! 0-based (row, col) coordinates. Parsers, the raw layer and the detector all
//! work on this model, so nothing downstream depends on calamine types.

use crate::error::WorkbookError;
use calamine::{open_workbook_auto_from_rs, Data, Range, Reader, Sheets};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Sheet grid limits. Cells beyond them are not read.
pub const MAX_SHEET_ROWS: usize = 100_000;
pub const MAX_SHEET_COLS: usize = 16_384;
/// Upper bound on cell slots materialized for one sheet.
pub const MAX_SHEET_CELLS: usize = 10_000_000;

/// One decoded cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Excel serial date/time (1900 date system).
    DateTime(f64),
    /// ISO 8601 text as stored by ods/xlsx "iso" cells.
    IsoDateTime(String),
    Error(String),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display text of the cell, as a user would read it in the spreadsheet.
    pub fn text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Bool(b) => b.to_string(),
            CellValue::DateTime(serial) => match crate::normalize::excel_serial_to_date(*serial) {
                Some(d) => d.format("%Y-%m-%d").to_string(),
                None => format_number(*serial),
            },
            CellValue::IsoDateTime(s) => s.clone(),
            CellValue::Error(e) => e.clone(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl From<&Data> for CellValue {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Float(f) => CellValue::Number(*f),
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => CellValue::DateTime(dt.as_f64()),
            Data::DateTimeIso(s) => CellValue::IsoDateTime(s.clone()),
            Data::DurationIso(s) => CellValue::Text(s.clone()),
            Data::Error(e) => CellValue::Error(format!("#{:?}", e)),
        }
    }
}

/// Inclusive rectangle of merged cells; the top-left cell is the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeRegion {
    pub first_row: u32,
    pub first_col: u32,
    pub last_row: u32,
    pub last_col: u32,
}

impl MergeRegion {
    pub fn new(first_row: u32, first_col: u32, last_row: u32, last_col: u32) -> Self {
        Self {
            first_row: first_row.min(last_row),
            first_col: first_col.min(last_col),
            last_row: first_row.max(last_row),
            last_col: first_col.max(last_col),
        }
    }

    pub fn area(&self) -> u64 {
        (self.last_row - self.first_row + 1) as u64 * (self.last_col - self.first_col + 1) as u64
    }
}

/// Identity of one sheet instance, used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SheetKey {
    pub workbook: u64,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Sheet {
    pub key: SheetKey,
    pub name: String,
    rows: Vec<Vec<CellValue>>,
    formulas: HashMap<(u32, u32), String>,
    pub merges: Vec<MergeRegion>,
    /// Set when the sheet could not be read; the grid is then empty.
    pub load_error: Option<String>,
    /// Some cells lay beyond the grid limits and were dropped.
    pub truncated: bool,
}

const EMPTY: CellValue = CellValue::Empty;

impl Sheet {
    /// Build a detached sheet from a dense grid. Used by the CSV reader and tests.
    pub fn from_rows(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            key: SheetKey {
                workbook: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                index: 0,
            },
            name: name.into(),
            rows,
            formulas: HashMap::new(),
            merges: Vec::new(),
            load_error: None,
            truncated: false,
        }
    }

    /// Placeholder for a sheet whose content could not be read.
    pub fn unreadable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            load_error: Some(message.into()),
            ..Self::from_rows(name, Vec::new())
        }
    }

    /// Convenience constructor from text rows; numeric-looking text stays text.
    pub fn from_text_rows(name: impl Into<String>, rows: &[&[&str]]) -> Self {
        let rows = rows
            .iter()
            .map(|r| {
                r.iter()
                    .map(|s| {
                        if s.is_empty() {
                            CellValue::Empty
                        } else {
                            CellValue::Text((*s).to_string())
                        }
                    })
                    .collect()
            })
            .collect();
        Self::from_rows(name, rows)
    }

    pub fn with_merges(mut self, merges: Vec<MergeRegion>) -> Self {
        self.merges = merges;
        self
    }

    pub fn with_formula(mut self, row: u32, col: u32, formula: impl Into<String>) -> Self {
        self.formulas.insert((row, col), formula.into());
        self
    }

    pub fn height(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn width(&self) -> u32 {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0) as u32
    }

    /// Literal value at (row, col); out-of-range coordinates read as empty.
    pub fn cell(&self, row: u32, col: u32) -> &CellValue {
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .unwrap_or(&EMPTY)
    }

    pub fn formula(&self, row: u32, col: u32) -> Option<&str> {
        self.formulas.get(&(row, col)).map(String::as_str)
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn is_row_blank(&self, row: u32) -> bool {
        self.rows
            .get(row as usize)
            .map(|r| r.iter().all(CellValue::is_blank))
            .unwrap_or(true)
    }

    /// Number of formula cells, reported in raw sheet metadata.
    pub fn formula_count(&self) -> usize {
        self.formulas.len()
    }

    /// All formulas in row-major order.
    pub fn formulas(&self) -> Vec<(u32, u32, &str)> {
        let mut out: Vec<(u32, u32, &str)> = self
            .formulas
            .iter()
            .map(|((r, c), f)| (*r, *c, f.as_str()))
            .collect();
        out.sort_unstable_by_key(|(r, c, _)| (*r, *c));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkbookFormat {
    Xlsx,
    Xls,
    Xlsb,
    Ods,
    Csv,
}

impl WorkbookFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkbookFormat::Xlsx => "xlsx",
            WorkbookFormat::Xls => "xls",
            WorkbookFormat::Xlsb => "xlsb",
            WorkbookFormat::Ods => "ods",
            WorkbookFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workbook {
    pub format: WorkbookFormat,
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Decode an upload. CSV is chosen by file extension, everything else is
    /// handed to calamine's format sniffing.
    pub fn from_bytes(bytes: &[u8], filename: &str) -> Result<Self, WorkbookError> {
        if bytes.is_empty() {
            return Err(WorkbookError::Empty);
        }
        if filename.to_lowercase().ends_with(".csv") {
            return read_csv(bytes, filename);
        }
        read_spreadsheet(bytes)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

fn read_spreadsheet(bytes: &[u8]) -> Result<Workbook, WorkbookError> {
    let mut sheets = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| WorkbookError::Open(e.to_string()))?;

    let format = match &sheets {
        Sheets::Xls(_) => WorkbookFormat::Xls,
        Sheets::Xlsx(_) => WorkbookFormat::Xlsx,
        Sheets::Xlsb(_) => WorkbookFormat::Xlsb,
        Sheets::Ods(_) => WorkbookFormat::Ods,
    };

    // Merge geometry is only exposed for xlsx; other formats are read flat.
    let mut merges_by_sheet: HashMap<String, Vec<MergeRegion>> = HashMap::new();
    if let Sheets::Xlsx(xlsx) = &mut sheets {
        match xlsx.load_merged_regions() {
            Ok(()) => {
                for (sheet, _path, dims) in xlsx.merged_regions() {
                    merges_by_sheet
                        .entry(sheet.clone())
                        .or_default()
                        .push(MergeRegion::new(dims.start.0, dims.start.1, dims.end.0, dims.end.1));
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not load merged regions"),
        }
    }

    let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    let mut out = Vec::new();
    for (index, name) in sheets.sheet_names().into_iter().enumerate() {
        let key = SheetKey {
            workbook: instance,
            index,
        };
        let range = match sheets.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                let error = WorkbookError::Sheet {
                    sheet: name.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(sheet = %name, error = %error, "sheet could not be read");
                out.push(Sheet {
                    key,
                    ..Sheet::unreadable(name, error.to_string())
                });
                continue;
            }
        };
        let grid = range_to_rows(&range);
        if grid.truncated {
            tracing::warn!(sheet = %name, "sheet exceeds grid limits, trailing cells dropped");
        }

        let mut formulas = HashMap::new();
        if let Ok(formula_range) = sheets.worksheet_formula(&name) {
            let (r0, c0) = formula_range.start().unwrap_or((0, 0));
            for (r, c, f) in formula_range.used_cells() {
                let (row, col) = (r0 as usize + r, c0 as usize + c);
                if !f.is_empty() && row < MAX_SHEET_ROWS && col < MAX_SHEET_COLS {
                    formulas.insert((row as u32, col as u32), format!("={}", f));
                }
            }
        }

        out.push(Sheet {
            key,
            merges: merges_by_sheet.remove(&name).unwrap_or_default(),
            name,
            rows: grid.rows,
            formulas,
            load_error: None,
            truncated: grid.truncated,
        });
    }

    Ok(Workbook {
        format,
        sheets: out,
    })
}

struct Grid {
    rows: Vec<Vec<CellValue>>,
    truncated: bool,
}

/// Expand a calamine range into rows anchored at A1. Each row ends at its
/// last used cell; cells beyond the grid limits are dropped.
fn range_to_rows(range: &Range<Data>) -> Grid {
    let mut grid = Grid {
        rows: Vec::new(),
        truncated: false,
    };
    let Some((r0, c0)) = range.start() else {
        return grid;
    };
    let mut slots = 0usize;
    for (r, c, data) in range.used_cells() {
        let (row, col) = (r0 as usize + r, c0 as usize + c);
        let grow = (col + 1).saturating_sub(grid.rows.get(row).map_or(0, Vec::len));
        if row >= MAX_SHEET_ROWS || col >= MAX_SHEET_COLS || slots + grow > MAX_SHEET_CELLS {
            grid.truncated = true;
            continue;
        }
        if grid.rows.len() <= row {
            grid.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut grid.rows[row];
        if grow > 0 {
            cells.resize(col + 1, CellValue::Empty);
            slots += grow;
        }
        cells[col] = CellValue::from(data);
    }
    grid
}

fn read_csv(bytes: &[u8], filename: &str) -> Result<Workbook, WorkbookError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    let field = field.trim();
                    if field.is_empty() {
                        CellValue::Empty
                    } else {
                        CellValue::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }

    let stem = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_end_matches(".csv")
        .trim_end_matches(".CSV");
    Ok(Workbook {
        format: WorkbookFormat::Csv,
        sheets: vec![Sheet::from_rows(stem, rows)],
    })
}

/// UTF-8 (BOM stripped) when valid, otherwise GB18030.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, had_errors) = encoding_rs::GB18030.decode(bytes);
            if had_errors {
                tracing::warn!("csv upload contained bytes invalid in both utf-8 and gb18030");
            }
            decoded.into_owned()
        }
    }
}

/// Spreadsheet column letters for a 0-based index (0 -> "A", 27 -> "AB").
pub fn column_letter(mut col: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Inverse of `column_letter`; `None` for anything that is not 1-3 ASCII letters.
pub fn column_index(letters: &str) -> Option<u32> {
    let letters = letters.trim();
    if letters.is_empty() || letters.len() > 3 || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut idx: u32 = 0;
    for c in letters.to_ascii_uppercase().bytes() {
        idx = idx * 26 + (c - b'A' + 1) as u32;
    }
    Some(idx - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn test_column_index_roundtrip_samples() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("ab"), Some(27));
        assert_eq!(column_index("ZZ"), Some(701));
        assert_eq!(column_index("日期"), None);
        assert_eq!(column_index(""), None);
        assert_eq!(column_index("ABCD"), None);
    }

    #[test]
    fn test_out_of_range_cell_is_empty() {
        let sheet = Sheet::from_text_rows("s", &[&["a", "b"]]);
        assert_eq!(sheet.cell(0, 1), &CellValue::Text("b".into()));
        assert_eq!(sheet.cell(5, 5), &CellValue::Empty);
        assert_eq!(sheet.height(), 1);
        assert_eq!(sheet.width(), 2);
    }

    #[test]
    fn test_csv_utf8_with_bom() {
        let bytes = "\u{feff}日期,价格\n2026-02-01,14.5\n".as_bytes();
        let wb = Workbook::from_bytes(bytes, "prices.csv").unwrap();
        assert_eq!(wb.format, WorkbookFormat::Csv);
        assert_eq!(wb.sheets.len(), 1);
        assert_eq!(wb.sheets[0].name, "prices");
        assert_eq!(wb.sheets[0].cell(0, 0), &CellValue::Text("日期".into()));
        assert_eq!(wb.sheets[0].cell(1, 1), &CellValue::Text("14.5".into()));
    }

    #[test]
    fn test_csv_gbk_fallback() {
        let (encoded, _, _) = encoding_rs::GBK.encode("日期,价格\n2026-02-01,14.5\n");
        let wb = Workbook::from_bytes(&encoded, "gbk.csv").unwrap();
        assert_eq!(wb.sheets[0].cell(0, 1), &CellValue::Text("价格".into()));
    }

    #[test]
    fn test_empty_upload_is_error() {
        assert!(matches!(
            Workbook::from_bytes(&[], "x.xlsx"),
            Err(WorkbookError::Empty)
        ));
    }

    #[test]
    fn test_garbage_bytes_is_error() {
        let result = Workbook::from_bytes(b"definitely not a spreadsheet", "x.xlsx");
        assert!(matches!(result, Err(WorkbookError::Open(_))));
    }

    #[test]
    fn test_range_is_anchored_at_a1_without_padding() {
        let mut range = Range::new((2, 1), (3, 4));
        range.set_value((2, 1), Data::String("日期".into()));
        range.set_value((3, 2), Data::Float(14.5));
        let grid = range_to_rows(&range);
        assert!(!grid.truncated);
        assert_eq!(grid.rows.len(), 4);
        assert!(grid.rows[0].is_empty());
        assert_eq!(grid.rows[2], vec![CellValue::Empty, CellValue::Text("日期".into())]);
        assert_eq!(grid.rows[3][2], CellValue::Number(14.5));
    }

    #[test]
    fn test_far_away_cells_are_dropped() {
        let far_row = MAX_SHEET_ROWS as u32 + 10;
        let mut range = Range::new((far_row, 0), (far_row, 0));
        range.set_value((far_row, 0), Data::Float(1.0));
        let grid = range_to_rows(&range);
        assert!(grid.truncated);
        assert!(grid.rows.is_empty());

        let far_col = 5_000_000;
        let mut range = Range::new((0, far_col), (0, far_col));
        range.set_value((0, far_col), Data::Float(1.0));
        let grid = range_to_rows(&range);
        assert!(grid.truncated);
        assert!(grid.rows.is_empty());
    }

    #[test]
    fn test_unreadable_sheet_is_empty() {
        let sheet = Sheet::unreadable("坏表", "bad xml");
        assert_eq!(sheet.load_error.as_deref(), Some("bad xml"));
        assert_eq!(sheet.height(), 0);
        assert_eq!(sheet.cell(0, 0), &CellValue::Empty);
    }

    #[test]
    fn test_blank_detection() {
        assert!(CellValue::Empty.is_blank());
        assert!(CellValue::Text("   ".into()).is_blank());
        assert!(!CellValue::Number(0.0).is_blank());
        assert_eq!(CellValue::Number(14.0).text(), "14");
        assert_eq!(CellValue::Number(14.25).text(), "14.25");
    }
}
