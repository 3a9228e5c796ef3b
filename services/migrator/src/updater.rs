//! Update staging - turns matched rows into the per-employee column writes
//! and family-member inserts the store applies in batches.
//!
//! Staging is pure: it reads the sheet and the reconciled code maps and
//! produces plain vectors, so every decision here is testable without a
//! database.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::normalize::{
    map_nationality, map_relationship, normalize_date, normalize_text, Relationship,
    UNKNOWN_RELATIONSHIP_CODE,
};
use crate::sheet::Sheet;

// =============================================================================
// Column updates
// =============================================================================

/// One employee-column write: join key as stored, value to set.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedUpdate {
    pub key: String,
    pub value: String,
}

/// One nationality-sheet row: either column may be absent, and an absent
/// value leaves the stored column alone.
#[derive(Debug, Clone, PartialEq)]
pub struct NationalityUpdate {
    pub key: String,
    pub code: Option<String>,
    pub last_paid: Option<NaiveDate>,
}

/// Counts alongside the staged updates for one column.
#[derive(Debug, Default)]
pub struct StagingOutcome {
    pub updates: Vec<StagedUpdate>,
    /// Matched rows whose value cell was blank; they are left untouched.
    pub empty_values: u64,
    /// Matched rows whose value did not reconcile to a code.
    pub unresolved_values: u64,
}

/// Stage foreign-key updates for one dimension: the value cell of each
/// matched row is normalized and looked up in the reconciled code map.
pub fn stage_fk_updates(
    sheet: &Sheet,
    matched: &[(usize, String)],
    value_column: usize,
    code_by_key: &HashMap<String, String>,
) -> StagingOutcome {
    let mut outcome = StagingOutcome::default();
    for (row, stored_key) in matched {
        let cell = sheet.cell(*row, value_column);
        if cell.is_empty() {
            outcome.empty_values += 1;
            continue;
        }
        let value_key = normalize_text(&cell.as_text());
        match code_by_key.get(&value_key) {
            Some(code) => outcome.updates.push(StagedUpdate {
                key: stored_key.clone(),
                value: code.clone(),
            }),
            None => outcome.unresolved_values += 1,
        }
    }
    outcome.updates = dedupe_updates(outcome.updates);
    outcome
}

/// Stage nationality rows for matched employees. The two columns travel
/// together but update independently: a blank cell stages None, so a row
/// with only a last-paid date still refreshes that date. Rows with
/// neither value are dropped, and repeated keys merge per column with the
/// last value winning in each.
pub fn stage_nationality(
    sheet: &Sheet,
    matched: &[(usize, String)],
    nationality_column: usize,
    last_paid_column: Option<usize>,
) -> Vec<NationalityUpdate> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, NationalityUpdate> = HashMap::new();

    for (row, stored_key) in matched {
        let cell = sheet.cell(*row, nationality_column);
        let code = if cell.is_empty() {
            None
        } else {
            Some(map_nationality(&cell.as_text()).to_string())
        };
        let last_paid = last_paid_column.and_then(|col| normalize_date(sheet.cell(*row, col)));
        if code.is_none() && last_paid.is_none() {
            continue;
        }

        match by_key.get_mut(stored_key) {
            Some(existing) => {
                if code.is_some() {
                    existing.code = code;
                }
                if last_paid.is_some() {
                    existing.last_paid = last_paid;
                }
            }
            None => {
                order.push(stored_key.clone());
                by_key.insert(
                    stored_key.clone(),
                    NationalityUpdate {
                        key: stored_key.clone(),
                        code,
                        last_paid,
                    },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Collapse repeated keys to one write each; the last row wins, matching
/// the row-at-a-time scripts these sheets were built for.
pub fn dedupe_updates(updates: Vec<StagedUpdate>) -> Vec<StagedUpdate> {
    dedupe_by_key(updates, |update| update.key.clone())
}

/// Last-wins dedupe preserving first-seen order of the keys.
pub fn dedupe_by_key<T, F>(items: Vec<T>, key_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, T> = HashMap::new();
    for item in items {
        let key = key_of(&item);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, item);
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Split staged work into store-sized batches. A zero batch size is
/// treated as one.
pub fn plan_batches<T>(items: &[T], batch_size: usize) -> Vec<&[T]> {
    if items.is_empty() {
        return Vec::new();
    }
    items.chunks(batch_size.max(1)).collect()
}

// =============================================================================
// Family extraction
// =============================================================================

/// A dependent pulled from one beneficiary slot, relationship not yet
/// resolved to a code.
#[derive(Debug, Clone)]
pub struct PendingDependent {
    pub employee_key: String,
    pub name: String,
    pub relationship: Relationship,
    pub dependent_id: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub disability: bool,
}

/// A dependent ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyMember {
    pub employee_key: String,
    pub name: String,
    pub relationship_code: String,
    pub dependent_id: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub disability: bool,
}

impl FamilyMember {
    /// Identity of a dependent within one employee's family.
    pub fn compound_key(&self) -> (String, String) {
        (
            self.employee_key.trim().to_string(),
            dependent_key(self.dependent_id.as_deref(), &self.name),
        )
    }
}

/// Dependent identity: the document number when the slot has one, the
/// normalized name otherwise.
pub fn dependent_key(dependent_id: Option<&str>, name: &str) -> String {
    match dependent_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => normalize_text(name),
    }
}

/// Compound key of an already-stored family row. The legacy table allows
/// NULL in any column, so everything arrives optional; a NULL employee
/// key maps to the empty string.
pub fn stored_family_key(
    employee_cedula: Option<&str>,
    dependent_id: Option<&str>,
    name: Option<&str>,
) -> (String, String) {
    (
        employee_cedula.unwrap_or("").trim().to_string(),
        dependent_key(dependent_id, name.unwrap_or("")),
    )
}

/// Everything pulled out of the beneficiary slot columns.
#[derive(Debug, Default)]
pub struct DependentExtraction {
    pub members: Vec<PendingDependent>,
    /// Distinct gendered relationship descriptions that need codes from
    /// the relationship table.
    pub canonical_relationships: Vec<String>,
    /// True when the slot past the configured maximum still has data.
    pub overflow: bool,
}

struct SlotColumns {
    name: usize,
    relationship: Option<usize>,
    id: Option<usize>,
    birth: Option<usize>,
    disability: Option<usize>,
}

/// The beneficiary columns come in numbered families (Beneficiario1,
/// Parentesco1, Cedula1, Beneficiario1Nacimiento, Discapacidad1, then the
/// same for slot 2, ...). Lookup is exact so slot 1 never swallows the
/// birth-date column of its own slot or the name column of slot 10.
fn slot_columns(sheet: &Sheet, slot: usize) -> Option<SlotColumns> {
    let name = sheet.find_column_exact(&format!("beneficiario{}", slot))?;
    Some(SlotColumns {
        name,
        relationship: sheet.find_column_exact(&format!("parentesco{}", slot)),
        id: sheet.find_column_exact(&format!("cedula{}", slot)),
        birth: sheet.find_column_exact(&format!("beneficiario{}nacimiento", slot)),
        disability: sheet.find_column_exact(&format!("discapacidad{}", slot)),
    })
}

/// Walk the beneficiary slots of every matched row. Slots stop at the
/// first missing name column or at `max_slots`, whichever comes first.
pub fn extract_dependents(
    sheet: &Sheet,
    matched: &[(usize, String)],
    max_slots: usize,
) -> DependentExtraction {
    let mut extraction = DependentExtraction::default();

    let mut slots = Vec::new();
    for slot in 1..=max_slots {
        match slot_columns(sheet, slot) {
            Some(columns) => slots.push(columns),
            None => break,
        }
    }

    for (row, employee_key) in matched {
        for columns in &slots {
            let name_cell = sheet.cell(*row, columns.name);
            if name_cell.is_empty() {
                continue;
            }

            let relationship_text = columns
                .relationship
                .map(|col| sheet.text(*row, col))
                .unwrap_or_default();
            let relationship = map_relationship(&relationship_text);
            if let Relationship::Canonical(display) = relationship {
                if !extraction
                    .canonical_relationships
                    .iter()
                    .any(|d| d.as_str() == display)
                {
                    extraction.canonical_relationships.push(display.to_string());
                }
            }

            let dependent_id = columns.id.map(|col| sheet.text(*row, col)).and_then(|id| {
                if id.is_empty() {
                    None
                } else {
                    Some(id)
                }
            });
            let birth_date = columns
                .birth
                .and_then(|col| normalize_date(sheet.cell(*row, col)));
            let disability = columns
                .disability
                .map(|col| normalize_text(&sheet.text(*row, col)) == "SI")
                .unwrap_or(false);

            extraction.members.push(PendingDependent {
                employee_key: employee_key.clone(),
                name: name_cell.as_text(),
                relationship,
                dependent_id,
                birth_date,
                disability,
            });
        }
    }

    // Data in the slot past the configured maximum means the export grew.
    if let Some(columns) = slot_columns(sheet, max_slots + 1) {
        extraction.overflow = matched
            .iter()
            .any(|(row, _)| !sheet.cell(*row, columns.name).is_empty());
    }

    extraction
}

/// Replace canonical relationship descriptions with their reconciled
/// codes. An unmapped description falls back to the sentinel code.
pub fn resolve_relationships(
    pending: Vec<PendingDependent>,
    code_by_key: &HashMap<String, String>,
) -> Vec<FamilyMember> {
    pending
        .into_iter()
        .map(|dependent| {
            let relationship_code = match &dependent.relationship {
                Relationship::Fixed(code) => code.to_string(),
                Relationship::Canonical(display) => code_by_key
                    .get(&normalize_text(display))
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_RELATIONSHIP_CODE.to_string()),
            };
            FamilyMember {
                employee_key: dependent.employee_key,
                name: dependent.name,
                relationship_code,
                dependent_id: dependent.dependent_id,
                birth_date: dependent.birth_date,
                disability: dependent.disability,
            }
        })
        .collect()
}

/// Drop dependents already stored and intra-run repeats of the same
/// compound key. Returns the survivors and the skip count.
pub fn dedupe_dependents(
    members: Vec<FamilyMember>,
    existing: &HashSet<(String, String)>,
) -> (Vec<FamilyMember>, u64) {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut kept = Vec::new();
    let mut skipped = 0u64;

    for member in members {
        let key = member.compound_key();
        if existing.contains(&key) || !seen.insert(key) {
            skipped += 1;
            continue;
        }
        kept.push(member);
    }

    (kept, skipped)
}

// =============================================================================
// TESTS
// =============================================================================
