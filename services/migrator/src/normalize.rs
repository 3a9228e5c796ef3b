//! Row normalization - converts raw spreadsheet cell values into the
//! canonical scalar forms shared by every migration pipeline.
//!
//! Everything here is pure and total: malformed input yields `None` or a
//! documented default, never a panic. Counting and reporting rejected
//! values is the caller's job.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use unicode_normalization::UnicodeNormalization;

use crate::sheet::CellValue;

// =============================================================================
// Dates
// =============================================================================

/// Serial for 9999-12-31 in the 1900 date system; anything beyond is noise.
const MAX_DATE_SERIAL: i64 = 2_958_465;

/// Normalize a cell to a calendar date. Numeric cells are spreadsheet
/// serials; text cells go through the string formats seen in the exports.
pub fn normalize_date(cell: &CellValue) -> Option<NaiveDate> {
    match cell {
        CellValue::Number(n) => date_from_serial(*n),
        CellValue::Text(s) => parse_date_text(s, Utc::now().year()),
        _ => None,
    }
}

/// Convert a 1900-system spreadsheet serial to a date. Day 0 is 1899-12-30;
/// a fractional time-of-day part is truncated.
pub fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial <= 0.0 {
        return None;
    }
    let days = serial.trunc() as i64;
    if days > MAX_DATE_SERIAL {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(days))
}

/// Parse a date from free-form export text. Tried in order: ISO prefix,
/// slash-delimited day/month/year, then a short list of other formats the
/// legacy files used. None when nothing matches.
pub fn parse_date_text(value: &str, current_year: i32) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // "2024-03-15", possibly followed by a time part ("2024-03-15 00:00:00").
    if let (Some(head), Some(rest)) = (value.get(..10), value.get(10..)) {
        let boundary = rest.is_empty() || rest.starts_with(' ') || rest.starts_with('T');
        if boundary {
            if let Ok(date) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }

    if let Some(date) = parse_slash_date(value, current_year) {
        return Some(date);
    }

    for format in ["%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }

    None
}

/// Slash-delimited dates are day-first; when only the second component can
/// be a day (first <= 12, second > 12) the value is month-first.
fn parse_slash_date(value: &str, current_year: i32) -> Option<NaiveDate> {
    let parts: Vec<&str> = value.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let a: u32 = parts[0].trim().parse().ok()?;
    let b: u32 = parts[1].trim().parse().ok()?;
    let year_raw: i32 = parts[2].trim().parse().ok()?;

    let (day, month) = if a <= 12 && b > 12 { (b, a) } else { (a, b) };

    let year = if (0..100).contains(&year_raw) {
        expand_two_digit_year(year_raw, current_year)
    } else {
        year_raw
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

/// Century window for two-digit years: current century, rolled back 100
/// years when the result lands more than 80 years in the future.
pub fn expand_two_digit_year(year: i32, current_year: i32) -> i32 {
    let mut full = (current_year / 100) * 100 + year;
    if full > current_year + 80 {
        full -= 100;
    }
    full
}

// =============================================================================
// Text and identifiers
// =============================================================================

/// Comparison key used by reconciliation: trimmed, upper-cased, combining
/// marks stripped after NFD decomposition. Precomposed enye is mapped
/// before decomposition so keys always carry a plain N.
pub fn normalize_text(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            'ñ' => 'n',
            'Ñ' => 'N',
            other => other,
        })
        .nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect::<String>()
        .to_uppercase()
}

/// First run of ASCII digits in an alphanumeric identifier, as an integer:
/// "E04989" -> 4989. None when the value has no digits or the run does not
/// fit in an i64.
pub fn extract_number(value: &str) -> Option<i64> {
    let digits: String = value
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

// =============================================================================
// Category maps
// =============================================================================

/// Marital-status description for a raw cell value. Unknown or empty input
/// falls back to "Soltero/a".
pub fn map_marital_status(value: &str) -> &'static str {
    match normalize_text(value).as_str() {
        "CASADA" | "CASADO" => "Casado/a",
        "DIVORCIADA" | "DIVORCIADO" | "SEPARADA" | "SEPARADO" => "Divorciado/a",
        "SOLTERA" | "SOLTERO" => "Soltero/a",
        "UNIDA" | "UNIDO" | "UNION LIBRE" => "Unido",
        "VIUDA" | "VIUDO" => "Viudo/a",
        _ => "Soltero/a",
    }
}

/// Nationality flag: "1" for the Panamanian spellings, "2" for everything
/// else, empty input included.
pub fn map_nationality(value: &str) -> &'static str {
    match normalize_text(value).as_str() {
        "PANAMENA" | "PANAMENO" | "PANAMA" => "1",
        _ => "2",
    }
}

/// Sentinel relationship code for empty or unrecognized values.
pub const UNKNOWN_RELATIONSHIP_CODE: &str = "8";

/// Relationship of a dependent to the employee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    /// A code the legacy relationship table was seeded with.
    Fixed(&'static str),
    /// A gendered family that reconciles into the relationship table under
    /// a gender-neutral description.
    Canonical(&'static str),
}

/// Map a relationship cell to its legacy code or canonical description.
/// The cell is cleaned first: digits and parenthesized qualifiers dropped.
pub fn map_relationship(value: &str) -> Relationship {
    let cleaned = clean_relationship_text(value);
    match normalize_text(&cleaned).as_str() {
        "MADRE" => Relationship::Fixed("1"),
        "PADRE" => Relationship::Fixed("2"),
        "HIJO" | "HIJA" => Relationship::Fixed("3"),
        "CONYUGE" | "ESPOSO" | "ESPOSA" => Relationship::Fixed("4"),
        "CONCUBINO" | "CONCUBINA" => Relationship::Fixed("5"),
        "NIETO" | "NIETA" | "HIJASTRO" | "HIJASTRA" => Relationship::Fixed("6"),
        "HERMANO" | "HERMANA" => Relationship::Canonical("Hermano/a"),
        "SOBRINO" | "SOBRINA" => Relationship::Canonical("Sobrino/a"),
        "TIO" | "TIA" => Relationship::Canonical("Tio/a"),
        "ABUELO" | "ABUELA" => Relationship::Canonical("Abuelo/a"),
        _ => Relationship::Fixed(UNKNOWN_RELATIONSHIP_CODE),
    }
}

/// "Hija (2)" -> "Hija": digits, parentheses and their content removed.
fn clean_relationship_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut depth = 0u32;
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            _ if c.is_ascii_digit() => {}
            _ => out.push(c),
        }
    }
    out.trim().to_string()
}

// =============================================================================
// Supplemental cleanups
// =============================================================================

/// Institutional e-mail cleanup: surrounding quotes and spaces stripped,
/// domain lower-cased. None unless the value has exactly one '@' with a
/// dotted domain.
pub fn clean_email(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return None;
    }
    let mut parts = trimmed.split('@');
    let local = parts.next()?;
    let domain = parts.next()?;
    if parts.next().is_some() || local.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(format!("{}@{}", local, domain.to_lowercase()))
}

/// Short-description helper for organizational levels: drops a leading
/// numeric outline prefix ("1-2 Recursos Humanos" -> "Recursos Humanos").
/// Values without the prefix come back unchanged, aside from trimming.
pub fn strip_org_prefix(value: &str) -> &str {
    fn digit_run(bytes: &[u8], start: usize, max: usize) -> Option<usize> {
        let mut pos = start;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() && pos - start < max {
            pos += 1;
        }
        (pos > start).then_some(pos)
    }

    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();

    let mut pos = match digit_run(bytes, 0, 3) {
        Some(p) => p,
        None => return trimmed,
    };
    while pos < bytes.len() && bytes[pos] == b'-' {
        match digit_run(bytes, pos + 1, 2) {
            Some(p) => pos = p,
            None => return trimmed,
        }
    }
    if pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        trimmed[pos..].trim_start()
    } else {
        trimmed
    }
}

// =============================================================================
// TESTS
// =============================================================================
