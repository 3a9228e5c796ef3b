//! Employee matching - joins sheet rows to stored employees by one of the
//! three identifiers the exports carry: cedula, carnet number, or ficha.
//!
//! Matching is two-sided: both the sheet value and the stored value go
//! through the same normalization, but the index maps back to the value as
//! stored, so SQL joins built from a match always hit the stored row.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::normalize::extract_number;
use crate::sheet::{CellValue, Sheet};

// =============================================================================
// Key strategies
// =============================================================================

/// Which employee identifier a run joins on. Chosen per invocation; the
/// sheets are not consistent about which identifier they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// National identity document ("8-945-1418").
    NationalId,
    /// Employee card number; numeric values lose leading zeros.
    CardNumber,
    /// Internal personnel file number, numeric.
    Ficha,
}

impl KeyStrategy {
    pub fn parse(name: &str) -> Result<KeyStrategy> {
        match name.trim().to_lowercase().as_str() {
            "cedula" | "national-id" => Ok(KeyStrategy::NationalId),
            "carnet" | "card-number" => Ok(KeyStrategy::CardNumber),
            "ficha" => Ok(KeyStrategy::Ficha),
            other => bail!(
                "Unknown key strategy '{}'; valid values: cedula, carnet, ficha",
                other
            ),
        }
    }

    /// Column names the strategy's key typically appears under.
    pub fn column_candidates(&self) -> &'static [&'static str] {
        match self {
            KeyStrategy::NationalId => &["cedula", "identificacion", "cedula de identidad"],
            KeyStrategy::CardNumber => {
                &["numero_carnet", "numero carnet", "carnet", "no. carnet"]
            }
            KeyStrategy::Ficha => &["personal", "ficha", "numero_carnet", "clave"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyStrategy::NationalId => "cedula",
            KeyStrategy::CardNumber => "carnet",
            KeyStrategy::Ficha => "ficha",
        }
    }
}

// =============================================================================
// Identity index
// =============================================================================

/// The identifiers of one stored employee row.
#[derive(Debug, Clone, Default)]
pub struct EmployeeIdentity {
    pub cedula: Option<String>,
    pub card_number: Option<String>,
    pub ficha: Option<i64>,
}

/// Normalized key -> join value as stored, for every employee that carries
/// the strategy's identifier.
pub struct IdentityIndex {
    keys: HashMap<String, String>,
}

impl IdentityIndex {
    pub fn build(strategy: KeyStrategy, employees: &[EmployeeIdentity]) -> IdentityIndex {
        let mut keys = HashMap::new();
        for employee in employees {
            let (normalized, stored) = match strategy {
                KeyStrategy::NationalId => match &employee.cedula {
                    Some(cedula) if !cedula.trim().is_empty() => {
                        (cedula.trim().to_string(), cedula.trim().to_string())
                    }
                    _ => continue,
                },
                KeyStrategy::CardNumber => match &employee.card_number {
                    Some(card) if !card.trim().is_empty() => {
                        (normalize_card(card), card.trim().to_string())
                    }
                    _ => continue,
                },
                KeyStrategy::Ficha => match employee.ficha {
                    Some(ficha) => (ficha.to_string(), ficha.to_string()),
                    None => continue,
                },
            };
            // Duplicate stored identifiers keep the first row seen.
            keys.entry(normalized).or_insert(stored);
        }
        IdentityIndex { keys }
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Card numbers appear with and without leading zeros ("004989" vs "4989").
/// All-digit values compare without them; mixed values compare trimmed.
pub fn normalize_card(value: &str) -> String {
    let trimmed = value.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        let stripped = trimmed.trim_start_matches('0');
        if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        }
    } else {
        trimmed.to_string()
    }
}

/// Normalized key for one sheet cell under a strategy. None when the cell
/// is blank or, for ficha, carries no digits.
pub fn row_key(strategy: KeyStrategy, cell: &CellValue) -> Option<String> {
    if cell.is_empty() {
        return None;
    }
    match strategy {
        KeyStrategy::NationalId => Some(cell.as_text()),
        KeyStrategy::CardNumber => Some(normalize_card(&cell.as_text())),
        KeyStrategy::Ficha => match cell {
            CellValue::Number(n) if n.fract() == 0.0 => Some((*n as i64).to_string()),
            _ => extract_number(&cell.as_text()).map(|n| n.to_string()),
        },
    }
}

// =============================================================================
// Row resolution
// =============================================================================

/// Rows of a sheet resolved against the index.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// (row index, stored join value) for every row whose key matched.
    pub matched: Vec<(usize, String)>,
    pub unmatched: u64,
    pub empty: u64,
}

/// Resolve every row of `sheet` through its key column. Rows without a key
/// and rows whose key is unknown are counted separately; neither stops the
/// run.
pub fn resolve(
    sheet: &Sheet,
    key_column: usize,
    strategy: KeyStrategy,
    index: &IdentityIndex,
) -> MatchOutcome {
    resolve_where(sheet, key_column, strategy, index, |_| true)
}

/// Resolution with a pre-matching row filter. Rejected rows count as
/// keyless, the same as rows with a blank key cell: they drop out before
/// the index is consulted and never reach the unmatched count.
pub fn resolve_where(
    sheet: &Sheet,
    key_column: usize,
    strategy: KeyStrategy,
    index: &IdentityIndex,
    include: impl Fn(usize) -> bool,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    for row in 0..sheet.rows.len() {
        if !include(row) {
            outcome.empty += 1;
            continue;
        }
        let key = match row_key(strategy, sheet.cell(row, key_column)) {
            Some(k) => k,
            None => {
                outcome.empty += 1;
                continue;
            }
        };
        match index.lookup(&key) {
            Some(stored) => outcome.matched.push((row, stored.to_string())),
            None => outcome.unmatched += 1,
        }
    }
    outcome
}

// =============================================================================
// TESTS
// =============================================================================
