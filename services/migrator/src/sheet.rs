//! Sheet loading - reads the HR exports (Excel workbooks or CSV extracts)
//! into an in-memory table with header-based column lookup.
//!
//! Responsibilities:
//! - Open .xlsx/.xls workbooks via calamine and pick the requested sheet
//! - Decode CSV extracts (UTF-8 with optional BOM, Windows-1252 fallback)
//! - Normalize headers so pipelines can find columns by loose name
//! - Keep raw cell values typed so dates survive as serial numbers

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};

use crate::normalize::normalize_text;

// =============================================================================
// Cell values
// =============================================================================

/// A single spreadsheet cell, preserved close to its source type. Numeric
/// cells stay numeric so date serials and fichas are not lost to display
/// formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Empty,
}

impl CellValue {
    /// Render the cell the way the export displays it. Integral floats
    /// print without a decimal point so "4989.0" joins as "4989".
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CellValue::Bool(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            CellValue::Empty => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

// =============================================================================
// Sheet
// =============================================================================

/// An export loaded into memory: one header row plus data rows.
#[derive(Debug)]
pub struct Sheet {
    pub headers: Vec<String>,
    normalized_headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// Header comparison key: accents stripped, non-alphanumerics dropped,
/// lower-cased. "Correo Institucional" and "CORREO_INSTITUCIONAL" both
/// become "correoinstitucional".
pub fn normalize_header(header: &str) -> String {
    normalize_text(header)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

impl Sheet {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let normalized_headers = headers.iter().map(|h| normalize_header(h)).collect();
        Sheet {
            headers,
            normalized_headers,
            rows,
        }
    }

    /// Locate a column by candidate names. Exact normalized matches win;
    /// a contains-match is the fallback for exports that decorate headers.
    pub fn find_column(&self, candidates: &[&str]) -> Option<usize> {
        for candidate in candidates {
            let wanted = normalize_header(candidate);
            if let Some(idx) = self.normalized_headers.iter().position(|h| *h == wanted) {
                return Some(idx);
            }
        }
        for candidate in candidates {
            let wanted = normalize_header(candidate);
            if wanted.is_empty() {
                continue;
            }
            if let Some(idx) = self
                .normalized_headers
                .iter()
                .position(|h| h.contains(&wanted))
            {
                return Some(idx);
            }
        }
        None
    }

    /// Exact-only lookup for numbered column families (beneficiario1,
    /// beneficiario2, ...) where a contains-match would hit the wrong slot.
    pub fn find_column_exact(&self, name: &str) -> Option<usize> {
        let wanted = normalize_header(name);
        self.normalized_headers.iter().position(|h| *h == wanted)
    }

    /// find_column that fails the run when the column is mandatory.
    pub fn require_column(&self, candidates: &[&str]) -> Result<usize> {
        self.find_column(candidates).ok_or_else(|| {
            anyhow!(
                "AMBIGUITY: none of the expected columns {:?} found among {:?}",
                candidates,
                self.headers
            )
        })
    }

    /// Cell at (row, col); out-of-range reads come back Empty, which is
    /// what ragged CSV rows produce anyway.
    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY)
    }

    pub fn text(&self, row: usize, col: usize) -> String {
        self.cell(row, col).as_text()
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load an export by extension: CSV goes through the text decoder, anything
/// else is treated as a workbook.
pub fn read_sheet(path: &Path, sheet_name: Option<&str>) -> Result<Sheet> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        read_csv_sheet(path)
    } else {
        read_excel_sheet(path, sheet_name)
    }
}

fn read_excel_sheet(path: &Path, sheet_name: Option<&str>) -> Result<Sheet> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;

    let available: Vec<String> = workbook.sheet_names().to_vec();
    let target = match sheet_name {
        Some(wanted) => available
            .iter()
            .find(|name| name.eq_ignore_ascii_case(wanted))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Sheet '{}' not found in {}; workbook has {:?}",
                    wanted,
                    path.display(),
                    available
                )
            })?,
        None => available
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Workbook {} has no sheets", path.display()))?,
    };

    let range = workbook
        .worksheet_range(&target)
        .with_context(|| format!("Failed to read sheet '{}'", target))?;

    let mut iter = range.rows();
    let header_row = iter
        .next()
        .ok_or_else(|| anyhow!("Sheet '{}' is empty", target))?;

    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => other.to_string(),
        })
        .collect();

    let rows: Vec<Vec<CellValue>> = iter
        .map(|row| row.iter().map(cell_from_excel).collect())
        .collect();

    Ok(Sheet::new(headers, rows))
}

fn cell_from_excel(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                CellValue::Empty
            } else {
                CellValue::Text(trimmed.to_string())
            }
        }
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Empty,
    }
}

fn read_csv_sheet(path: &Path) -> Result<Sheet> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read CSV file {}", path.display()))?;
    let content = decode_csv_bytes(&bytes);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        match record {
            Ok(record) => {
                let row: Vec<CellValue> = record
                    .iter()
                    .map(|field| {
                        let trimmed = field.trim();
                        if trimmed.is_empty() {
                            CellValue::Empty
                        } else {
                            CellValue::Text(trimmed.to_string())
                        }
                    })
                    .collect();
                rows.push(row);
            }
            Err(e) => {
                eprintln!("Skipping malformed CSV record at line {}: {}", line + 2, e);
            }
        }
    }

    Ok(Sheet::new(headers, rows))
}

/// The exports arrive either UTF-8 (sometimes with a BOM) or Windows-1252.
fn decode_csv_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_start_matches('\u{feff}').to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sheet() -> Sheet {
        Sheet::new(
            vec![
                "Cédula".to_string(),
                "CargoDeloitte".to_string(),
                "Beneficiario1".to_string(),
                "Beneficiario1Nacimiento".to_string(),
            ],
            vec![
                vec![
                    CellValue::Text("8-945-1418".to_string()),
                    CellValue::Text("Analista".to_string()),
                    CellValue::Text("MARIA PEREZ".to_string()),
                    CellValue::Number(33000.0),
                ],
                vec![CellValue::Empty, CellValue::Text("Gerente".to_string())],
            ],
        )
    }

    // -------------------------------------------------------------------------
    // CELL VALUE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_as_text_integral_number() {
        assert_eq!(CellValue::Number(4989.0).as_text(), "4989");
        assert_eq!(CellValue::Number(4234200055.0).as_text(), "4234200055");
    }

    #[test]
    fn test_as_text_fractional_number() {
        assert_eq!(CellValue::Number(12.5).as_text(), "12.5");
    }

    #[test]
    fn test_as_text_trims() {
        assert_eq!(CellValue::Text("  hola  ".to_string()).as_text(), "hola");
        assert_eq!(CellValue::Empty.as_text(), "");
    }

    #[test]
    fn test_is_empty() {
        assert!(CellValue::Empty.is_empty());
        assert!(CellValue::Text("   ".to_string()).is_empty());
        assert!(!CellValue::Text("x".to_string()).is_empty());
        assert!(!CellValue::Number(0.0).is_empty());
    }

    // -------------------------------------------------------------------------
    // HEADER LOOKUP TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("Correo Institucional"), "correoinstitucional");
        assert_eq!(normalize_header("CÉDULA"), "cedula");
        assert_eq!(normalize_header("No. Carnet"), "nocarnet");
    }

    #[test]
    fn test_find_column_exact_match_wins() {
        let sheet = sample_sheet();
        assert_eq!(sheet.find_column(&["cedula"]), Some(0));
        assert_eq!(sheet.find_column(&["cargodeloitte", "cargo"]), Some(1));
    }

    #[test]
    fn test_find_column_contains_fallback() {
        let sheet = sample_sheet();
        // No header is exactly "cargo" but CargoDeloitte contains it.
        assert_eq!(sheet.find_column(&["cargo"]), Some(1));
        assert_eq!(sheet.find_column(&["inexistente"]), None);
    }

    #[test]
    fn test_find_column_exact_skips_slot_siblings() {
        let sheet = sample_sheet();
        assert_eq!(sheet.find_column_exact("beneficiario1"), Some(2));
        assert_eq!(
            sheet.find_column_exact("beneficiario1nacimiento"),
            Some(3)
        );
        assert_eq!(sheet.find_column_exact("beneficiario2"), None);
    }

    #[test]
    fn test_require_column_error_lists_candidates() {
        let sheet = sample_sheet();
        let err = sheet.require_column(&["banco"]).unwrap_err();
        assert!(err.to_string().contains("AMBIGUITY"));
        assert!(err.to_string().contains("banco"));
    }

    // -------------------------------------------------------------------------
    // CELL ACCESS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_cell_out_of_range_is_empty() {
        let sheet = sample_sheet();
        assert_eq!(*sheet.cell(1, 3), CellValue::Empty);
        assert_eq!(*sheet.cell(99, 0), CellValue::Empty);
        assert_eq!(sheet.text(0, 0), "8-945-1418");
    }

    // -------------------------------------------------------------------------
    // CSV DECODING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_utf8_with_bom() {
        let bytes = b"\xEF\xBB\xBFCedula,Cargo\n1,Analista\n";
        let decoded = decode_csv_bytes(bytes);
        assert!(decoded.starts_with("Cedula"));
    }

    #[test]
    fn test_decode_windows_1252_fallback() {
        // "Cédula" in Windows-1252: 0xE9 is é and invalid UTF-8.
        let bytes = b"C\xE9dula\n";
        let decoded = decode_csv_bytes(bytes);
        assert_eq!(decoded, "Cédula\n");
    }
}
