//! Reference reconciliation - dedupes the categorical values observed in a
//! sheet against an existing reference table and mints codes for the ones
//! the table has never seen.
//!
//! One engine serves every dimension (banks, positions, airports, org
//! levels, ...). The per-dimension differences are data: how codes are
//! minted, how descriptions are displayed, whether the sheet itself
//! supplies the code.
//!
//! Reruns are idempotent by construction: values are matched on the same
//! normalized key that minted them, so a second pass over the same sheet
//! creates nothing.

use std::collections::HashMap;

use crate::normalize::normalize_text;

// =============================================================================
// Dimension descriptors
// =============================================================================

/// How new codes are rendered for a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeStyle {
    /// Plain counter: "1", "2", "3", ...
    Sequential,
    /// Prefixed zero-padded counter: "AER001", "N014", ...
    Prefixed { prefix: &'static str, width: usize },
}

/// Where a dimension's codes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    /// The engine mints codes from a counter.
    Derived(CodeStyle),
    /// The sheet carries the code itself (cost centers); the engine only
    /// detects new codes and drifted descriptions.
    Sourced,
}

/// How the stored description relates to the sheet text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPolicy {
    /// First spelling seen is stored as-is.
    Verbatim,
    /// Stored upper-cased with accents stripped.
    Uppercase,
}

/// Static description of one reference dimension.
#[derive(Debug, Clone, Copy)]
pub struct Dimension {
    pub name: &'static str,
    pub table: &'static str,
    pub code_column: &'static str,
    pub description_column: &'static str,
    pub short_description_column: Option<&'static str>,
    pub parent_column: Option<&'static str>,
    pub code_source: CodeSource,
    pub display: DisplayPolicy,
    /// Counter never goes below this floor, even when the table is empty
    /// or holds only smaller codes. Dimensions with seeded fixed codes
    /// (relationship types) reserve their range this way.
    pub counter_floor: i64,
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// One categorical value observed in a sheet, after per-row extraction.
#[derive(Debug, Clone)]
pub struct ObservedValue {
    pub display: String,
    /// Set for sourced dimensions; the code the sheet carries.
    pub sourced_code: Option<String>,
    /// Display text of the parent value from the same row, for
    /// hierarchical dimensions.
    pub parent_display: Option<String>,
}

impl ObservedValue {
    pub fn new(display: impl Into<String>) -> Self {
        ObservedValue {
            display: display.into(),
            sourced_code: None,
            parent_display: None,
        }
    }
}

/// A row of the reference table, existing or to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRecord {
    pub code: String,
    pub description: String,
    pub short_description: Option<String>,
    pub parent_code: Option<String>,
}

/// A legacy duplicate: two codes share a normalized description; the
/// smaller code is kept as canonical, the larger reported.
#[derive(Debug, Clone, PartialEq)]
pub struct SupersededRecord {
    pub kept_code: String,
    pub superseded_code: String,
    pub description: String,
}

/// Everything reconciliation decided for one dimension.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Records the table does not have yet, in first-seen order.
    pub new_records: Vec<ReferenceRecord>,
    /// Normalized key -> canonical code, covering existing and new values.
    pub code_by_key: HashMap<String, String>,
    pub superseded: Vec<SupersededRecord>,
    /// Sourced dimensions only: (code, description) pairs whose stored
    /// description no longer matches the sheet.
    pub description_updates: Vec<(String, String)>,
}

// =============================================================================
// Value collection
// =============================================================================

/// Identity key for an observed value: sourced dimensions key on the code,
/// derived ones on the normalized display text. None when the value is
/// blank and carries nothing to reconcile.
pub fn value_key(dimension: &Dimension, value: &ObservedValue) -> Option<String> {
    let raw = match dimension.code_source {
        CodeSource::Sourced => value.sourced_code.as_deref().unwrap_or(""),
        CodeSource::Derived(_) => value.display.as_str(),
    };
    let key = normalize_text(raw);
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Dedupe raw per-row values into one ObservedValue per key, first
/// occurrence wins. Returns the deduped values and the count of rows whose
/// parent display disagreed with the first occurrence.
pub fn collect_values(
    dimension: &Dimension,
    raw: impl IntoIterator<Item = ObservedValue>,
) -> (Vec<ObservedValue>, u64) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut values: Vec<ObservedValue> = Vec::new();
    let mut parent_conflicts = 0u64;

    for value in raw {
        let key = match value_key(dimension, &value) {
            Some(k) => k,
            None => continue,
        };
        match seen.get(&key) {
            Some(&idx) => {
                let kept = &values[idx];
                let kept_parent = kept.parent_display.as_deref().map(normalize_text);
                let this_parent = value.parent_display.as_deref().map(normalize_text);
                if kept_parent != this_parent {
                    parent_conflicts += 1;
                }
            }
            None => {
                seen.insert(key, values.len());
                values.push(value);
            }
        }
    }

    (values, parent_conflicts)
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Order codes numerically when both parse, lexically otherwise, so "2"
/// beats "10" the way the legacy tables expect.
fn code_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Reconcile observed values against the existing rows of one dimension.
///
/// `parent_codes` maps normalized parent display text to the parent
/// dimension's codes; required only for hierarchical dimensions, and the
/// parent dimension must have been reconciled first.
pub fn reconcile(
    dimension: &Dimension,
    values: &[ObservedValue],
    existing: &[ReferenceRecord],
    parent_codes: Option<&HashMap<String, String>>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    // Index existing rows by normalized identity. Legacy tables contain
    // duplicates; keep the smallest code and report the rest.
    let mut canonical: HashMap<String, &ReferenceRecord> = HashMap::new();
    for record in existing {
        let key = match dimension.code_source {
            CodeSource::Sourced => normalize_text(&record.code),
            CodeSource::Derived(_) => normalize_text(&record.description),
        };
        if key.is_empty() {
            continue;
        }
        match canonical.get(&key) {
            Some(kept) => {
                let (kept_code, superseded_code) =
                    if code_order(&record.code, &kept.code) == std::cmp::Ordering::Less {
                        (record.code.clone(), kept.code.clone())
                    } else {
                        (kept.code.clone(), record.code.clone())
                    };
                outcome.superseded.push(SupersededRecord {
                    kept_code: kept_code.clone(),
                    superseded_code,
                    description: kept.description.clone(),
                });
                if kept_code == record.code {
                    canonical.insert(key, record);
                }
            }
            None => {
                canonical.insert(key, record);
            }
        }
    }

    // Counter starts past every numeric code already in the table. Codes
    // are never reused, deletions included.
    let mut next_counter = existing
        .iter()
        .filter_map(|r| numeric_part(&r.code))
        .max()
        .unwrap_or(0)
        .max(dimension.counter_floor)
        + 1;

    for value in values {
        let key = match value_key(dimension, value) {
            Some(k) => k,
            None => continue,
        };
        if outcome.code_by_key.contains_key(&key) {
            continue;
        }

        if let Some(record) = canonical.get(&key) {
            outcome.code_by_key.insert(key, record.code.clone());
            if dimension.code_source == CodeSource::Sourced {
                let stored = normalize_text(&record.description);
                let observed = normalize_text(&value.display);
                if !observed.is_empty() && stored != observed {
                    outcome
                        .description_updates
                        .push((record.code.clone(), display_for(dimension, &value.display)));
                }
            }
            continue;
        }

        let code = match dimension.code_source {
            CodeSource::Sourced => match &value.sourced_code {
                Some(code) => code.trim().to_string(),
                None => continue,
            },
            CodeSource::Derived(style) => {
                let code = render_code(style, next_counter);
                next_counter += 1;
                code
            }
        };

        let description = display_for(dimension, &value.display);
        let short_description = dimension
            .short_description_column
            .map(|_| crate::normalize::strip_org_prefix(&description).to_string());
        let parent_code = match (&value.parent_display, parent_codes) {
            (Some(parent), Some(codes)) => codes.get(&normalize_text(parent)).cloned(),
            _ => None,
        };

        outcome.code_by_key.insert(key, code.clone());
        outcome.new_records.push(ReferenceRecord {
            code,
            description,
            short_description,
            parent_code,
        });
    }

    outcome
}

fn render_code(style: CodeStyle, counter: i64) -> String {
    match style {
        CodeStyle::Sequential => counter.to_string(),
        CodeStyle::Prefixed { prefix, width } => {
            format!("{}{:0width$}", prefix, counter, width = width)
        }
    }
}

/// Numeric portion of a stored code: whole value for sequential codes,
/// digit suffix for prefixed ones ("AER014" -> 14).
fn numeric_part(code: &str) -> Option<i64> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(n);
    }
    let digits: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn display_for(dimension: &Dimension, display: &str) -> String {
    match dimension.display {
        DisplayPolicy::Verbatim => display.trim().to_string(),
        DisplayPolicy::Uppercase => normalize_text(display),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BANKS: Dimension = Dimension {
        name: "banks",
        table: "banks",
        code_column: "code",
        description_column: "description",
        short_description_column: None,
        parent_column: None,
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Verbatim,
        counter_floor: 0,
    };

    const AIRPORTS: Dimension = Dimension {
        name: "airports",
        table: "airports",
        code_column: "code",
        description_column: "description",
        short_description_column: None,
        parent_column: None,
        code_source: CodeSource::Derived(CodeStyle::Prefixed {
            prefix: "AER",
            width: 3,
        }),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    };

    const COST_CENTERS: Dimension = Dimension {
        name: "cost_centers",
        table: "cost_centers",
        code_column: "code",
        description_column: "description",
        short_description_column: None,
        parent_column: None,
        code_source: CodeSource::Sourced,
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    };

    const ORG_LEVEL2: Dimension = Dimension {
        name: "org_level2",
        table: "org_level2",
        code_column: "code",
        description_column: "description",
        short_description_column: Some("short_description"),
        parent_column: Some("parent_code"),
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    };

    fn record(code: &str, description: &str) -> ReferenceRecord {
        ReferenceRecord {
            code: code.to_string(),
            description: description.to_string(),
            short_description: None,
            parent_code: None,
        }
    }

    // -------------------------------------------------------------------------
    // COLLECTION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_collect_dedupes_on_normalized_key() {
        let raw = vec![
            ObservedValue::new("Banco Nacional Panamá"),
            ObservedValue::new("BANCO NACIONAL PANAMA"),
            ObservedValue::new("Banco General"),
        ];
        let (values, conflicts) = collect_values(&BANKS, raw);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].display, "Banco Nacional Panamá");
        assert_eq!(conflicts, 0);
    }

    #[test]
    fn test_collect_skips_blank_values() {
        let raw = vec![ObservedValue::new("  "), ObservedValue::new("")];
        let (values, _) = collect_values(&BANKS, raw);
        assert!(values.is_empty());
    }

    #[test]
    fn test_collect_counts_parent_conflicts() {
        let mut a = ObservedValue::new("Sección Compras");
        a.parent_display = Some("Departamento A".to_string());
        let mut b = ObservedValue::new("SECCION COMPRAS");
        b.parent_display = Some("Departamento B".to_string());
        let mut c = ObservedValue::new("seccion compras");
        c.parent_display = Some("departamento a".to_string());

        let (values, conflicts) = collect_values(&ORG_LEVEL2, vec![a, b, c]);
        assert_eq!(values.len(), 1);
        // b disagrees with a; c normalizes to the same parent as a.
        assert_eq!(conflicts, 1);
        assert_eq!(values[0].parent_display.as_deref(), Some("Departamento A"));
    }

    // -------------------------------------------------------------------------
    // SEQUENTIAL CODE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_new_values_get_sequential_codes_past_max() {
        let existing = vec![record("1", "BANCO GENERAL"), record("7", "BANISTMO")];
        let values = vec![
            ObservedValue::new("Banco General"),
            ObservedValue::new("Caja de Ahorros"),
            ObservedValue::new("Global Bank"),
        ];
        let outcome = reconcile(&BANKS, &values, &existing, None);

        assert_eq!(outcome.new_records.len(), 2);
        assert_eq!(outcome.new_records[0].code, "8");
        assert_eq!(outcome.new_records[1].code, "9");
        assert_eq!(outcome.code_by_key["BANCO GENERAL"], "1");
        assert_eq!(outcome.code_by_key["CAJA DE AHORROS"], "8");
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let values = vec![
            ObservedValue::new("Banco General"),
            ObservedValue::new("Caja de Ahorros"),
        ];
        let first = reconcile(&BANKS, &values, &[], None);
        assert_eq!(first.new_records.len(), 2);

        let second = reconcile(&BANKS, &values, &first.new_records, None);
        assert!(second.new_records.is_empty());
        assert_eq!(second.code_by_key, first.code_by_key);
    }

    #[test]
    fn test_counter_respects_floor() {
        let mut dim = BANKS;
        dim.counter_floor = 8;
        let outcome = reconcile(&dim, &[ObservedValue::new("Hermano/a")], &[], None);
        assert_eq!(outcome.new_records[0].code, "9");
    }

    #[test]
    fn test_codes_stable_when_new_value_sorts_earlier() {
        let existing = vec![record("5", "ZONA SUR")];
        let values = vec![
            ObservedValue::new("Alfa Norte"),
            ObservedValue::new("Zona Sur"),
        ];
        let outcome = reconcile(&BANKS, &values, &existing, None);
        assert_eq!(outcome.code_by_key["ZONA SUR"], "5");
        assert_eq!(outcome.code_by_key["ALFA NORTE"], "6");
    }

    #[test]
    fn test_verbatim_keeps_first_spelling() {
        let outcome = reconcile(&BANKS, &[ObservedValue::new("Banco Nacional Panamá")], &[], None);
        assert_eq!(outcome.new_records[0].description, "Banco Nacional Panamá");
    }

    // -------------------------------------------------------------------------
    // PREFIXED CODE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_prefixed_codes_zero_padded() {
        let existing = vec![record("AER009", "TOCUMEN")];
        let values = vec![
            ObservedValue::new("Tocumen"),
            ObservedValue::new("Albrook"),
            ObservedValue::new("David"),
        ];
        let outcome = reconcile(&AIRPORTS, &values, &existing, None);

        assert_eq!(outcome.new_records.len(), 2);
        assert_eq!(outcome.new_records[0].code, "AER010");
        assert_eq!(outcome.new_records[1].code, "AER011");
        assert_eq!(outcome.new_records[0].description, "ALBROOK");
    }

    #[test]
    fn test_prefixed_first_code_starts_at_one() {
        let outcome = reconcile(&AIRPORTS, &[ObservedValue::new("Tocumen")], &[], None);
        assert_eq!(outcome.new_records[0].code, "AER001");
    }

    // -------------------------------------------------------------------------
    // DUPLICATE HANDLING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_existing_duplicates_keep_smallest_code() {
        let existing = vec![
            record("10", "BANCO GENERAL"),
            record("2", "Banco General"),
            record("3", "BANISTMO"),
        ];
        let values = vec![ObservedValue::new("banco general")];
        let outcome = reconcile(&BANKS, &values, &existing, None);

        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.code_by_key["BANCO GENERAL"], "2");
        assert_eq!(outcome.superseded.len(), 1);
        assert_eq!(outcome.superseded[0].kept_code, "2");
        assert_eq!(outcome.superseded[0].superseded_code, "10");
    }

    // -------------------------------------------------------------------------
    // SOURCED CODE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_sourced_codes_insert_and_drift() {
        let existing = vec![record("1010", "ALMACEN CENTRAL")];
        let mut kept = ObservedValue::new("Almacén Central");
        kept.sourced_code = Some("1010".to_string());
        let mut drifted = ObservedValue::new("Almacén Regional");
        drifted.sourced_code = Some("1010".to_string());
        let mut fresh = ObservedValue::new("Taller Norte");
        fresh.sourced_code = Some("2020".to_string());

        let outcome = reconcile(&COST_CENTERS, &[kept, fresh.clone()], &existing, None);
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].code, "2020");
        assert_eq!(outcome.new_records[0].description, "TALLER NORTE");
        assert!(outcome.description_updates.is_empty());

        let outcome = reconcile(&COST_CENTERS, &[drifted, fresh], &existing, None);
        assert_eq!(
            outcome.description_updates,
            vec![("1010".to_string(), "ALMACEN REGIONAL".to_string())]
        );
    }

    // -------------------------------------------------------------------------
    // HIERARCHY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parent_codes_resolved_through_map() {
        let mut parents = HashMap::new();
        parents.insert("VICEPRESIDENCIA OPERACIONES".to_string(), "3".to_string());

        let mut value = ObservedValue::new("1-2 Recursos Humanos");
        value.parent_display = Some("Vicepresidencia Operaciones".to_string());

        let outcome = reconcile(&ORG_LEVEL2, &[value], &[], Some(&parents));
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].parent_code.as_deref(), Some("3"));
        assert_eq!(
            outcome.new_records[0].short_description.as_deref(),
            Some("RECURSOS HUMANOS")
        );
        assert_eq!(outcome.new_records[0].description, "1-2 RECURSOS HUMANOS");
    }

    #[test]
    fn test_missing_parent_leaves_null() {
        let parents = HashMap::new();
        let mut value = ObservedValue::new("Sección Archivo");
        value.parent_display = Some("Departamento Fantasma".to_string());

        let outcome = reconcile(&ORG_LEVEL2, &[value], &[], Some(&parents));
        assert_eq!(outcome.new_records[0].parent_code, None);
    }
}
