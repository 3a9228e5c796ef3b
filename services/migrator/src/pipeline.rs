//! Migration pipelines - one per legacy load script. Each pipeline reads
//! its columns from the sheet, reconciles reference values, matches rows
//! to stored employees and applies the staged writes in one transaction
//! per dimension.
//!
//! The reference dimensions are data, not code: a pipeline picks its
//! Dimension descriptors and column candidates and hands them to the same
//! engine.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use crate::matching::{resolve_where, IdentityIndex, KeyStrategy, MatchOutcome};
use crate::normalize::{clean_email, map_marital_status};
use crate::reconcile::{
    collect_values, reconcile, CodeSource, CodeStyle, Dimension, DisplayPolicy, ObservedValue,
};
use crate::report::{DimensionReport, RunSummary};
use crate::sheet::Sheet;
use crate::store;
use crate::updater::{
    dedupe_dependents, dedupe_updates, extract_dependents, resolve_relationships,
    stage_fk_updates, stage_nationality, StagedUpdate,
};

// =============================================================================
// Dimension roster
// =============================================================================

pub const BANKS: Dimension = Dimension {
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

pub const JOB_POSITIONS: Dimension = Dimension {
    name: "job_positions",
    table: "job_positions",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const COST_CENTERS: Dimension = Dimension {
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

pub const MEF_POSITIONS: Dimension = Dimension {
    name: "mef_positions",
    table: "mef_positions",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const MEF_JOB_CODES: Dimension = Dimension {
    name: "mef_job_codes",
    table: "mef_job_codes",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const MEF_ROLES: Dimension = Dimension {
    name: "mef_roles",
    table: "mef_roles",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const AIRPORTS: Dimension = Dimension {
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

pub const SCHEDULES: Dimension = Dimension {
    name: "schedules",
    table: "schedules",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const EDUCATION_LEVELS: Dimension = Dimension {
    name: "education_levels",
    table: "education_levels",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Prefixed {
        prefix: "N",
        width: 3,
    }),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

// Prefixes follow the legacy tables' initials; period types and salary
// types both landed on T, each in its own table.
pub const PERIOD_DAYS: Dimension = Dimension {
    name: "period_days",
    table: "period_days",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Prefixed {
        prefix: "D",
        width: 3,
    }),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const PERIOD_TYPES: Dimension = Dimension {
    name: "period_types",
    table: "period_types",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Prefixed {
        prefix: "T",
        width: 3,
    }),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const SALARY_TYPES: Dimension = Dimension {
    name: "salary_types",
    table: "salary_types",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Prefixed {
        prefix: "T",
        width: 3,
    }),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const UNIONS: Dimension = Dimension {
    name: "unions",
    table: "unions",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Prefixed {
        prefix: "S",
        width: 3,
    }),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

pub const JOB_LEVELS: Dimension = Dimension {
    name: "job_levels",
    table: "job_levels",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Uppercase,
    counter_floor: 0,
};

/// Codes 1 through 8 are fixed in the relationship table; only gendered
/// family descriptions mint new codes, past the reserved range.
pub const RELATIONSHIP_TYPES: Dimension = Dimension {
    name: "relationship_types",
    table: "relationship_types",
    code_column: "code",
    description_column: "description",
    short_description_column: None,
    parent_column: None,
    code_source: CodeSource::Derived(CodeStyle::Sequential),
    display: DisplayPolicy::Verbatim,
    counter_floor: 8,
};

/// The five organizational levels, top down. Levels 1 to 4 carry a short
/// description without the numeric outline prefix; levels 2 to 5 point at
/// their parent.
pub const ORG_LEVELS: [Dimension; 5] = [
    Dimension {
        name: "org_level1",
        table: "org_level1",
        code_column: "code",
        description_column: "description",
        short_description_column: Some("short_description"),
        parent_column: None,
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    },
    Dimension {
        name: "org_level2",
        table: "org_level2",
        code_column: "code",
        description_column: "description",
        short_description_column: Some("short_description"),
        parent_column: Some("parent_code"),
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    },
    Dimension {
        name: "org_level3",
        table: "org_level3",
        code_column: "code",
        description_column: "description",
        short_description_column: Some("short_description"),
        parent_column: Some("parent_code"),
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    },
    Dimension {
        name: "org_level4",
        table: "org_level4",
        code_column: "code",
        description_column: "description",
        short_description_column: Some("short_description"),
        parent_column: Some("parent_code"),
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    },
    Dimension {
        name: "org_level5",
        table: "org_level5",
        code_column: "code",
        description_column: "description",
        short_description_column: None,
        parent_column: Some("parent_code"),
        code_source: CodeSource::Derived(CodeStyle::Sequential),
        display: DisplayPolicy::Uppercase,
        counter_floor: 0,
    },
];

// =============================================================================
// Column candidates
// =============================================================================

const BANK_COLUMNS: &[&str] = &["banco", "entidad bancaria"];
const POSITION_COLUMNS: &[&str] = &["cargodeloitte", "puesto", "cargo"];
const COST_CENTER_CODE_COLUMNS: &[&str] = &["centrocostos", "centro de costos", "ceco"];
const COST_CENTER_DESC_COLUMNS: &[&str] = &[
    "descripcioncentrocostos",
    "descripcion centro",
    "descripcion",
];
const MEF_POSITION_COLUMNS: &[&str] = &["posicionmef", "posicion mef", "no posicion"];
const MEF_JOB_CODE_COLUMNS: &[&str] = &["codigocargomef", "codigo cargo mef", "cargomef"];
const MEF_ROLE_COLUMNS: &[&str] = &["rolmef", "rol mef", "rol"];
const AIRPORT_COLUMNS: &[&str] = &["aeropuerto", "sede aeroportuaria", "sede"];
const SCHEDULE_COLUMNS: &[&str] = &["horario", "jornada"];
// "nivelacademco" is the consolidated export's own spelling.
const EDUCATION_COLUMNS: &[&str] = &[
    "niveleducativo",
    "nivel educativo",
    "nivel academico",
    "nivelacademco",
];
const PERIOD_DAY_COLUMNS: &[&str] = &["diasperiodo", "dias del periodo"];
const PERIOD_TYPE_COLUMNS: &[&str] = &["periodotipo", "tipoperiodo"];
const SALARY_TYPE_COLUMNS: &[&str] = &["tiposueldo", "tipo de sueldo"];
const UNION_COLUMNS: &[&str] = &["sindicato"];
const JOB_LEVEL_COLUMNS: &[&str] = &["nivelcargo"];
const EMAIL_COLUMNS: &[&str] = &[
    "correoinstitucional",
    "correo institucional",
    "email institucional",
    "correo",
];
const NATIONALITY_COLUMNS: &[&str] = &["nacionalidad"];
const LAST_PAID_COLUMNS: &[&str] = &["ultimopago", "ultimo pago", "fecha ultimo pago"];
const MARITAL_COLUMNS: &[&str] = &["estadocivil", "estado civil"];

const ORG_LEVEL_COLUMNS: [&[&str]; 5] = [
    &["vicepresidencia", "vp", "nivel1"],
    &["departamento", "nivel2"],
    &["seccion", "nivel3"],
    &["equipo", "nivel4"],
    &["grupo", "nivel5"],
];
const ORG_FK_COLUMNS: [&str; 5] = [
    "org_level1_code",
    "org_level2_code",
    "org_level3_code",
    "org_level4_code",
    "org_level5_code",
];

// =============================================================================
// Run options and shared steps
// =============================================================================

/// Per-invocation knobs, shared by every pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub strategy: KeyStrategy,
    pub batch_size: usize,
    pub full_reload: bool,
    pub dry_run: bool,
    pub max_dependents: usize,
}

/// Everything run_dimension needs for one dimension of one sheet.
struct DimensionPass<'a> {
    dimension: Dimension,
    fk_column: &'static str,
    value_column: usize,
    values: Vec<ObservedValue>,
    parent_codes: Option<&'a HashMap<String, String>>,
    parent_conflicts: u64,
}

/// Locate the key column, build the identity index and resolve every row.
async fn resolve_sheet(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<MatchOutcome> {
    resolve_sheet_where(pool, sheet, options, summary, |_| true).await
}

/// resolve_sheet with rows dropped before matching. Dropped rows count as
/// keyless, not unmatched; cost centers use this for rows without a code,
/// which carry nothing to reconcile or propagate.
async fn resolve_sheet_where(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
    include: impl Fn(usize) -> bool,
) -> Result<MatchOutcome> {
    let key_column = sheet.require_column(options.strategy.column_candidates())?;
    let identities = store::load_identities(pool).await?;
    let index = IdentityIndex::build(options.strategy, &identities);
    if index.is_empty() {
        summary.warn(format!(
            "no stored employee carries a {} identifier",
            options.strategy.name()
        ));
    }

    let outcome = resolve_where(sheet, key_column, options.strategy, &index, include);
    summary.add_match_counts(
        sheet.rows.len(),
        outcome.matched.len(),
        outcome.unmatched,
        outcome.empty,
    );
    println!(
        "Matched {} of {} rows ({} unmatched, {} without key)",
        outcome.matched.len(),
        sheet.rows.len(),
        outcome.unmatched,
        outcome.empty
    );
    Ok(outcome)
}

/// Observed values of one column, every row. Catalog entries are minted
/// even for rows that match no employee, the way the legacy loads did.
fn column_values(sheet: &Sheet, column: usize) -> Vec<ObservedValue> {
    org_values(sheet, column, None)
}

/// Observed values with the parent value from the same row attached.
fn org_values(sheet: &Sheet, column: usize, parent_column: Option<usize>) -> Vec<ObservedValue> {
    let mut values = Vec::new();
    for row in 0..sheet.rows.len() {
        let cell = sheet.cell(row, column);
        if cell.is_empty() {
            continue;
        }
        let mut value = ObservedValue::new(cell.as_text());
        if let Some(parent) = parent_column {
            let parent_cell = sheet.cell(row, parent);
            if !parent_cell.is_empty() {
                value.parent_display = Some(parent_cell.as_text());
            }
        }
        values.push(value);
    }
    values
}

/// Observed cost-center values: the sheet supplies the code, the
/// description column when present supplies the display text.
fn cost_center_values(
    sheet: &Sheet,
    code_column: usize,
    description_column: Option<usize>,
) -> Vec<ObservedValue> {
    let mut values = Vec::new();
    for row in 0..sheet.rows.len() {
        let code_cell = sheet.cell(row, code_column);
        if code_cell.is_empty() {
            continue;
        }
        let code = code_cell.as_text();
        let description = description_column
            .map(|col| sheet.text(row, col))
            .unwrap_or_default();
        let mut value = if description.is_empty() {
            ObservedValue::new(code.clone())
        } else {
            ObservedValue::new(description)
        };
        value.sourced_code = Some(code);
        values.push(value);
    }
    values
}

/// Reconcile one dimension, stage its foreign-key updates and apply both
/// in a single transaction. Returns the code map so hierarchical callers
/// can hand it to the next level.
async fn run_dimension(
    pool: &PgPool,
    pass: DimensionPass<'_>,
    sheet: &Sheet,
    matched: &[(usize, String)],
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<HashMap<String, String>> {
    let dimension = pass.dimension;

    let existing = if options.full_reload {
        Vec::new()
    } else {
        store::load_reference(pool, &dimension).await?
    };
    let outcome = reconcile(&dimension, &pass.values, &existing, pass.parent_codes);

    for superseded in &outcome.superseded {
        summary.warn(format!(
            "{}: codes {} and {} both describe '{}'; keeping {}",
            dimension.name,
            superseded.kept_code,
            superseded.superseded_code,
            superseded.description,
            superseded.kept_code
        ));
    }
    if pass.parent_conflicts > 0 {
        summary.warn(format!(
            "{}: {} rows disagree about a parent; first occurrence kept",
            dimension.name, pass.parent_conflicts
        ));
    }

    let staging = stage_fk_updates(sheet, matched, pass.value_column, &outcome.code_by_key);
    if staging.unresolved_values > 0 {
        summary.warn(format!(
            "{}: {} matched rows hold values that did not reconcile",
            dimension.name, staging.unresolved_values
        ));
    }

    println!(
        "  {}: {} values, {} new, {} updates",
        dimension.name,
        pass.values.len(),
        outcome.new_records.len(),
        staging.updates.len()
    );

    summary.add_dimension(DimensionReport {
        dimension: dimension.name.to_string(),
        values_seen: pass.values.len(),
        new_records: outcome.new_records.len(),
        superseded_duplicates: outcome.superseded.len(),
        description_updates: outcome.description_updates.len(),
        parent_conflicts: pass.parent_conflicts,
        rows_without_value: staging.empty_values,
        rows_unresolved: staging.unresolved_values,
        fk_updates: staging.updates.len(),
    });

    if options.dry_run {
        return Ok(outcome.code_by_key);
    }

    let mut tx = pool
        .begin()
        .await
        .with_context(|| format!("Failed to open transaction for {}", dimension.name))?;
    if options.full_reload {
        store::truncate_reference(&mut tx, &dimension).await?;
    }
    store::insert_references(&mut tx, &dimension, &outcome.new_records, options.batch_size).await?;
    store::update_descriptions(
        &mut tx,
        &dimension,
        &outcome.description_updates,
        options.batch_size,
    )
    .await?;
    store::apply_column_updates(
        &mut tx,
        pass.fk_column,
        options.strategy,
        &staging.updates,
        options.batch_size,
    )
    .await?;
    tx.commit()
        .await
        .with_context(|| format!("Failed to commit {}", dimension.name))?;

    Ok(outcome.code_by_key)
}

/// The whole flow for a flat dimension fed by one value column.
async fn run_single_dimension(
    pool: &PgPool,
    sheet: &Sheet,
    dimension: Dimension,
    fk_column: &'static str,
    value_candidates: &[&str],
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let value_column = sheet.require_column(value_candidates)?;
    let (values, parent_conflicts) = collect_values(&dimension, column_values(sheet, value_column));
    let pass = DimensionPass {
        dimension,
        fk_column,
        value_column,
        values,
        parent_codes: None,
        parent_conflicts,
    };
    run_dimension(pool, pass, sheet, &matched.matched, options, summary).await?;
    Ok(())
}

// =============================================================================
// Pipelines
// =============================================================================

pub async fn run_banks(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    run_single_dimension(pool, sheet, BANKS, "bank_code", BANK_COLUMNS, options, summary).await
}

pub async fn run_positions(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    run_single_dimension(
        pool,
        sheet,
        JOB_POSITIONS,
        "position_code",
        POSITION_COLUMNS,
        options,
        summary,
    )
    .await
}

/// The three MEF dimensions ride the same sheet; all of them are required.
pub async fn run_mef(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let passes = [
        (MEF_POSITIONS, "mef_position_code", MEF_POSITION_COLUMNS),
        (MEF_JOB_CODES, "mef_job_code", MEF_JOB_CODE_COLUMNS),
        (MEF_ROLES, "mef_role_code", MEF_ROLE_COLUMNS),
    ];
    for (dimension, fk_column, candidates) in passes {
        let value_column = sheet.require_column(candidates)?;
        let (values, parent_conflicts) =
            collect_values(&dimension, column_values(sheet, value_column));
        let pass = DimensionPass {
            dimension,
            fk_column,
            value_column,
            values,
            parent_codes: None,
            parent_conflicts,
        };
        run_dimension(pool, pass, sheet, &matched.matched, options, summary).await?;
    }
    Ok(())
}

/// The general catalogs of the consolidated workbook: airports, schedules,
/// education levels, period days, period types, salary types, unions and
/// job levels. Sheets carry any subset of them, so a missing column skips
/// that dimension instead of failing.
pub async fn run_catalogs(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let passes = [
        (AIRPORTS, "airport_code", AIRPORT_COLUMNS),
        (SCHEDULES, "schedule_code", SCHEDULE_COLUMNS),
        (EDUCATION_LEVELS, "education_level_code", EDUCATION_COLUMNS),
        (PERIOD_DAYS, "period_days_code", PERIOD_DAY_COLUMNS),
        (PERIOD_TYPES, "period_type_code", PERIOD_TYPE_COLUMNS),
        (SALARY_TYPES, "salary_type_code", SALARY_TYPE_COLUMNS),
        (UNIONS, "union_code", UNION_COLUMNS),
        (JOB_LEVELS, "job_level_code", JOB_LEVEL_COLUMNS),
    ];
    for (dimension, fk_column, candidates) in passes {
        let value_column = match sheet.find_column(candidates) {
            Some(column) => column,
            None => {
                summary.warn(format!(
                    "{}: no column among {:?}; skipped",
                    dimension.name, candidates
                ));
                continue;
            }
        };
        let (values, parent_conflicts) =
            collect_values(&dimension, column_values(sheet, value_column));
        let pass = DimensionPass {
            dimension,
            fk_column,
            value_column,
            values,
            parent_codes: None,
            parent_conflicts,
        };
        run_dimension(pool, pass, sheet, &matched.matched, options, summary).await?;
    }
    Ok(())
}

/// The five organizational levels, top down. Each level's code map feeds
/// the parent lookups of the next, so parents created this run resolve
/// without a re-read.
pub async fn run_org_levels(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;

    let mut columns = Vec::with_capacity(ORG_LEVEL_COLUMNS.len());
    for candidates in ORG_LEVEL_COLUMNS {
        columns.push(sheet.require_column(candidates)?);
    }

    let mut parent_codes: Option<HashMap<String, String>> = None;
    for level in 0..ORG_LEVELS.len() {
        let parent_column = if level == 0 {
            None
        } else {
            Some(columns[level - 1])
        };
        let raw = org_values(sheet, columns[level], parent_column);
        let (values, parent_conflicts) = collect_values(&ORG_LEVELS[level], raw);
        let pass = DimensionPass {
            dimension: ORG_LEVELS[level],
            fk_column: ORG_FK_COLUMNS[level],
            value_column: columns[level],
            values,
            parent_codes: parent_codes.as_ref(),
            parent_conflicts,
        };
        let codes = run_dimension(pool, pass, sheet, &matched.matched, options, summary).await?;
        parent_codes = Some(codes);
    }
    Ok(())
}

/// Cost centers arrive with their own codes; reconciliation detects codes
/// the table lacks and descriptions that drifted. Rows without a code
/// carry nothing to reconcile or assign, so they drop out before matching.
pub async fn run_cost_centers(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let code_column = sheet.require_column(COST_CENTER_CODE_COLUMNS)?;
    let description_column = sheet.find_column(COST_CENTER_DESC_COLUMNS);
    if description_column.is_none() {
        summary.warn("cost_centers: no description column; codes reconcile without names");
    }

    let matched = resolve_sheet_where(pool, sheet, options, summary, |row| {
        !sheet.cell(row, code_column).is_empty()
    })
    .await?;

    let raw = cost_center_values(sheet, code_column, description_column);
    let (values, parent_conflicts) = collect_values(&COST_CENTERS, raw);
    let pass = DimensionPass {
        dimension: COST_CENTERS,
        fk_column: "cost_center_code",
        value_column: code_column,
        values,
        parent_codes: None,
        parent_conflicts,
    };
    run_dimension(pool, pass, sheet, &matched.matched, options, summary).await?;
    Ok(())
}

/// Beneficiary slots become family members. Dependents are keyed by the
/// employee cedula, so the pipeline only runs under that strategy. The
/// relationship table keeps its reserved low codes even on --full-reload.
pub async fn run_family(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    if options.strategy != KeyStrategy::NationalId {
        bail!("family pipeline joins dependents by cedula; rerun with --key-strategy cedula");
    }

    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let extraction = extract_dependents(sheet, &matched.matched, options.max_dependents);
    if extraction.overflow {
        summary.warn(format!(
            "beneficiary slot {} holds data beyond the configured maximum; raise --max-dependents",
            options.max_dependents + 1
        ));
    }

    let existing = store::load_reference(pool, &RELATIONSHIP_TYPES).await?;
    let observed: Vec<ObservedValue> = extraction
        .canonical_relationships
        .iter()
        .map(|display| ObservedValue::new(display.clone()))
        .collect();
    let outcome = reconcile(&RELATIONSHIP_TYPES, &observed, &existing, None);
    for superseded in &outcome.superseded {
        summary.warn(format!(
            "relationship_types: codes {} and {} both describe '{}'; keeping {}",
            superseded.kept_code,
            superseded.superseded_code,
            superseded.description,
            superseded.kept_code
        ));
    }

    let members = resolve_relationships(extraction.members, &outcome.code_by_key);
    let stored = store::load_family_keys(pool).await?;
    let (members, skipped) = dedupe_dependents(members, &stored);

    summary.dependents_inserted = members.len();
    summary.dependents_skipped = skipped;
    summary.add_dimension(DimensionReport {
        dimension: RELATIONSHIP_TYPES.name.to_string(),
        values_seen: observed.len(),
        new_records: outcome.new_records.len(),
        superseded_duplicates: outcome.superseded.len(),
        ..DimensionReport::default()
    });
    println!(
        "  family: {} dependents to insert, {} skipped",
        members.len(),
        skipped
    );

    if options.dry_run {
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .context("Failed to open transaction for family members")?;
    store::insert_references(&mut tx, &RELATIONSHIP_TYPES, &outcome.new_records, options.batch_size)
        .await?;
    store::insert_family_members(&mut tx, &members, options.batch_size).await?;
    tx.commit()
        .await
        .context("Failed to commit family members")?;
    Ok(())
}

/// Institutional e-mail refresh. Rows with a blank or invalid value leave
/// the stored address alone.
pub async fn run_emails(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let email_column = sheet.require_column(EMAIL_COLUMNS)?;

    let mut rejected = 0u64;
    let mut updates = Vec::new();
    for (row, stored_key) in &matched.matched {
        let cell = sheet.cell(*row, email_column);
        if cell.is_empty() {
            continue;
        }
        match clean_email(&cell.as_text()) {
            Some(email) => updates.push(StagedUpdate {
                key: stored_key.clone(),
                value: email,
            }),
            None => rejected += 1,
        }
    }
    if rejected > 0 {
        summary.warn(format!("emails: {} values failed validation", rejected));
    }

    let updates = dedupe_updates(updates);
    summary.value_updates += updates.len();
    println!("  emails: {} updates", updates.len());

    if options.dry_run {
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .context("Failed to open transaction for emails")?;
    store::apply_column_updates(&mut tx, "work_email", options.strategy, &updates, options.batch_size)
        .await?;
    tx.commit().await.context("Failed to commit emails")?;
    Ok(())
}

/// Nationality codes plus the last-paid date when the sheet has one.
/// The two columns update independently: a blank cell stages nothing for
/// its column, so it never overwrites a stored value, and a row with only
/// a paid date still lands.
pub async fn run_nationality(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let nationality_column = sheet.require_column(NATIONALITY_COLUMNS)?;
    let last_paid_column = sheet.find_column(LAST_PAID_COLUMNS);

    let updates = stage_nationality(sheet, &matched.matched, nationality_column, last_paid_column);
    summary.value_updates += updates.len();
    println!("  nationality: {} updates", updates.len());

    if options.dry_run {
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .context("Failed to open transaction for nationality")?;
    store::apply_nationality_updates(&mut tx, options.strategy, &updates, options.batch_size)
        .await?;
    tx.commit().await.context("Failed to commit nationality")?;
    Ok(())
}

/// Marital-status descriptions. Blank cells stay untouched; anything else
/// maps through the fixed category table, unknown spellings included.
pub async fn run_civil_status(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    let matched = resolve_sheet(pool, sheet, options, summary).await?;
    let marital_column = sheet.require_column(MARITAL_COLUMNS)?;

    let mut updates = Vec::new();
    for (row, stored_key) in &matched.matched {
        let cell = sheet.cell(*row, marital_column);
        if cell.is_empty() {
            continue;
        }
        updates.push(StagedUpdate {
            key: stored_key.clone(),
            value: map_marital_status(&cell.as_text()).to_string(),
        });
    }

    let updates = dedupe_updates(updates);
    summary.value_updates += updates.len();
    println!("  civil status: {} updates", updates.len());

    if options.dry_run {
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .context("Failed to open transaction for civil status")?;
    store::apply_column_updates(
        &mut tx,
        "marital_status",
        options.strategy,
        &updates,
        options.batch_size,
    )
    .await?;
    tx.commit().await.context("Failed to commit civil status")?;
    Ok(())
}

/// The consolidated workbook, every pipeline in dependency order. Family
/// needs the cedula strategy; under any other it is skipped with a
/// warning rather than failing the rest.
pub async fn run_all(
    pool: &PgPool,
    sheet: &Sheet,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<()> {
    println!("=== Banks ===");
    run_banks(pool, sheet, options, summary).await?;
    println!("=== Positions ===");
    run_positions(pool, sheet, options, summary).await?;
    println!("=== Organizational levels ===");
    run_org_levels(pool, sheet, options, summary).await?;
    println!("=== Cost centers ===");
    run_cost_centers(pool, sheet, options, summary).await?;
    println!("=== MEF dimensions ===");
    run_mef(pool, sheet, options, summary).await?;
    println!("=== Catalogs ===");
    run_catalogs(pool, sheet, options, summary).await?;
    println!("=== Family ===");
    if options.strategy == KeyStrategy::NationalId {
        run_family(pool, sheet, options, summary).await?;
    } else {
        summary.warn("run-all skipped family: dependents join by cedula only");
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::EmployeeIdentity;
    use crate::sheet::CellValue;

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    // -------------------------------------------------------------------------
    // COLUMN LOCATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_key_column_candidates_locate_header() {
        let sheet = Sheet::new(vec!["Personal".to_string(), "X".to_string()], Vec::new());
        let column = sheet
            .require_column(KeyStrategy::Ficha.column_candidates())
            .unwrap();
        assert_eq!(column, 0);

        let sheet = Sheet::new(vec!["No. Carnet".to_string()], Vec::new());
        let column = sheet
            .require_column(KeyStrategy::CardNumber.column_candidates())
            .unwrap();
        assert_eq!(column, 0);
    }

    #[test]
    fn test_catalog_columns_located_on_consolidated_headers() {
        let sheet = Sheet::new(
            vec![
                "DiasPeriodo".to_string(),
                "PeriodoTipo".to_string(),
                "TipoSueldo".to_string(),
                "Sindicato".to_string(),
                "NivelCargo".to_string(),
                "NivelAcademco".to_string(),
            ],
            Vec::new(),
        );
        assert_eq!(sheet.find_column(PERIOD_DAY_COLUMNS), Some(0));
        assert_eq!(sheet.find_column(PERIOD_TYPE_COLUMNS), Some(1));
        assert_eq!(sheet.find_column(SALARY_TYPE_COLUMNS), Some(2));
        assert_eq!(sheet.find_column(UNION_COLUMNS), Some(3));
        assert_eq!(sheet.find_column(JOB_LEVEL_COLUMNS), Some(4));
        assert_eq!(sheet.find_column(EDUCATION_COLUMNS), Some(5));
    }

    // -------------------------------------------------------------------------
    // FLAT DIMENSION FLOW TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_position_flow_stages_reconciled_code() {
        let sheet = Sheet::new(
            vec!["Cedula".to_string(), "CargoDeloitte".to_string()],
            vec![
                vec![text("8-945-1418"), text("Analista Programador")],
                vec![text("2-700-700"), text("ANALISTA PROGRAMADOR")],
            ],
        );
        let value_column = sheet.require_column(POSITION_COLUMNS).unwrap();
        let (values, _) = collect_values(&JOB_POSITIONS, column_values(&sheet, value_column));
        assert_eq!(values.len(), 1);

        let outcome = reconcile(&JOB_POSITIONS, &values, &[], None);
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].description, "ANALISTA PROGRAMADOR");
        let code = outcome.code_by_key["ANALISTA PROGRAMADOR"].clone();

        let matched = vec![
            (0usize, "8-945-1418".to_string()),
            (1, "2-700-700".to_string()),
        ];
        let staging = stage_fk_updates(&sheet, &matched, value_column, &outcome.code_by_key);
        assert_eq!(staging.updates.len(), 2);
        assert!(staging.updates.iter().all(|u| u.value == code));

        // A second pass over the same sheet mints nothing.
        let rerun = reconcile(&JOB_POSITIONS, &values, &outcome.new_records, None);
        assert!(rerun.new_records.is_empty());
        assert_eq!(rerun.code_by_key, outcome.code_by_key);
    }

    #[test]
    fn test_union_flow_mints_prefixed_codes() {
        let sheet = Sheet::new(
            vec!["Cedula".to_string(), "Sindicato".to_string()],
            vec![
                vec![text("8-1-1"), text("Sitraico")],
                vec![text("8-1-2"), text("Sindicato Industrial")],
            ],
        );
        let value_column = sheet.require_column(UNION_COLUMNS).unwrap();
        let (values, _) = collect_values(&UNIONS, column_values(&sheet, value_column));
        let outcome = reconcile(&UNIONS, &values, &[], None);
        assert_eq!(outcome.new_records.len(), 2);
        assert_eq!(outcome.new_records[0].code, "S001");
        assert_eq!(outcome.new_records[1].code, "S002");

        let matched = vec![(0usize, "8-1-1".to_string()), (1, "8-1-2".to_string())];
        let staging = stage_fk_updates(&sheet, &matched, value_column, &outcome.code_by_key);
        assert_eq!(staging.updates.len(), 2);
        assert_eq!(staging.updates[0].value, "S001");
        assert_eq!(staging.updates[1].value, "S002");
    }

    #[test]
    fn test_blank_cost_center_row_drops_before_matching() {
        let sheet = Sheet::new(
            vec![
                "Cedula".to_string(),
                "CentroCostos".to_string(),
                "Descripcion".to_string(),
            ],
            vec![
                vec![text("8-1-1"), CellValue::Empty, text("Finanzas")],
                vec![text("9-9-9"), CellValue::Empty, CellValue::Empty],
                vec![text("8-1-1"), text("1010"), text("Planta Ensamble")],
            ],
        );
        let employees = vec![EmployeeIdentity {
            cedula: Some("8-1-1".to_string()),
            ..EmployeeIdentity::default()
        }];
        let index = IdentityIndex::build(KeyStrategy::NationalId, &employees);
        let key_column = sheet
            .require_column(KeyStrategy::NationalId.column_candidates())
            .unwrap();
        let code_column = sheet.require_column(COST_CENTER_CODE_COLUMNS).unwrap();
        let matched = resolve_where(&sheet, key_column, KeyStrategy::NationalId, &index, |row| {
            !sheet.cell(row, code_column).is_empty()
        });

        // Rows without a code are keyless for this pipeline: the unknown
        // cedula on row 1 never shows up as unmatched.
        assert_eq!(matched.matched.len(), 1);
        assert_eq!(matched.unmatched, 0);
        assert_eq!(matched.empty, 2);

        // The dangling description on row 0 mints nothing either.
        let description_column = sheet.find_column(COST_CENTER_DESC_COLUMNS);
        let raw = cost_center_values(&sheet, code_column, description_column);
        let (values, _) = collect_values(&COST_CENTERS, raw);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].sourced_code.as_deref(), Some("1010"));

        let outcome = reconcile(&COST_CENTERS, &values, &[], None);
        let staging =
            stage_fk_updates(&sheet, &matched.matched, code_column, &outcome.code_by_key);
        assert_eq!(staging.updates.len(), 1);
        assert_eq!(staging.empty_values, 0);
    }

    #[test]
    fn test_cost_center_display_falls_back_to_code() {
        let sheet = Sheet::new(
            vec!["Cedula".to_string(), "CentroCostos".to_string()],
            vec![vec![text("8-1-1"), CellValue::Number(1010.0)]],
        );
        let code_column = sheet.require_column(COST_CENTER_CODE_COLUMNS).unwrap();
        let raw = cost_center_values(&sheet, code_column, None);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].display, "1010");
        assert_eq!(raw[0].sourced_code.as_deref(), Some("1010"));
    }

    // -------------------------------------------------------------------------
    // HIERARCHY FLOW TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_org_levels_chain_parent_codes() {
        let sheet = Sheet::new(
            vec![
                "Cedula".to_string(),
                "Vicepresidencia".to_string(),
                "Departamento".to_string(),
            ],
            vec![
                vec![
                    text("8-1-1"),
                    text("1 Operaciones"),
                    text("1-2 Recursos Humanos"),
                ],
                vec![text("8-1-2"), text("1 OPERACIONES"), text("1-3 Compras")],
            ],
        );
        let level1_column = sheet.require_column(ORG_LEVEL_COLUMNS[0]).unwrap();
        let level2_column = sheet.require_column(ORG_LEVEL_COLUMNS[1]).unwrap();

        let (values, _) = collect_values(
            &ORG_LEVELS[0],
            org_values(&sheet, level1_column, None),
        );
        let level1 = reconcile(&ORG_LEVELS[0], &values, &[], None);
        assert_eq!(level1.new_records.len(), 1);
        assert_eq!(
            level1.new_records[0].short_description.as_deref(),
            Some("OPERACIONES")
        );

        let (values, conflicts) = collect_values(
            &ORG_LEVELS[1],
            org_values(&sheet, level2_column, Some(level1_column)),
        );
        assert_eq!(conflicts, 0);
        let level2 = reconcile(&ORG_LEVELS[1], &values, &[], Some(&level1.code_by_key));
        assert_eq!(level2.new_records.len(), 2);

        let parent = level1.code_by_key["1 OPERACIONES"].as_str();
        assert!(level2
            .new_records
            .iter()
            .all(|record| record.parent_code.as_deref() == Some(parent)));
    }

    // -------------------------------------------------------------------------
    // FAMILY FLOW TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_family_relationships_reconcile_past_reserved_codes() {
        let sheet = Sheet::new(
            vec![
                "Cedula".to_string(),
                "Beneficiario1".to_string(),
                "Parentesco1".to_string(),
            ],
            vec![vec![text("8-1-1"), text("JUAN"), text("Hermano")]],
        );
        let matched = vec![(0usize, "8-1-1".to_string())];
        let extraction = extract_dependents(&sheet, &matched, 8);

        let observed: Vec<ObservedValue> = extraction
            .canonical_relationships
            .iter()
            .map(|d| ObservedValue::new(d.clone()))
            .collect();
        let outcome = reconcile(&RELATIONSHIP_TYPES, &observed, &[], None);
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].code, "9");
        assert_eq!(outcome.new_records[0].description, "Hermano/a");

        let members = resolve_relationships(extraction.members, &outcome.code_by_key);
        assert_eq!(members[0].relationship_code, "9");
    }
}
