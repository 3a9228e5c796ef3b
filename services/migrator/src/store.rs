//! Database access - every query the migration runs against Postgres.
//!
//! Expected schema, as inherited from the HR system:
//! - employees: cedula TEXT, card_number TEXT, ficha BIGINT, bank_code,
//!   cost_center_code, position_code, org_level1_code .. org_level5_code,
//!   mef_position_code, mef_job_code, mef_role_code, airport_code,
//!   schedule_code, education_level_code, period_days_code,
//!   period_type_code, salary_type_code, union_code, job_level_code,
//!   marital_status, work_email, nationality_code, last_paid_date DATE
//! - reference tables (banks, job_positions, ...): code TEXT primary key,
//!   description TEXT, plus short_description / parent_code where the
//!   dimension calls for them
//! - family_members: employee_cedula, name, relationship_code,
//!   dependent_cedula, birth_date, disability
//! - migration_runs: run_id UUID, pipeline, started_at, finished_at,
//!   status, error, detail JSONB
//!
//! Table and column names are interpolated from the static Dimension
//! descriptors; everything row-valued goes through binds. Writes are
//! set-based: one UNNEST statement per batch instead of one round trip
//! per row.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::matching::{EmployeeIdentity, KeyStrategy};
use crate::reconcile::{Dimension, ReferenceRecord};
use crate::updater::{
    plan_batches, stored_family_key, FamilyMember, NationalityUpdate, StagedUpdate,
};

// =============================================================================
// Reads
// =============================================================================

/// Identifiers of every stored employee, for the matching index.
pub async fn load_identities(pool: &PgPool) -> Result<Vec<EmployeeIdentity>> {
    let rows = sqlx::query_as::<_, (Option<String>, Option<String>, Option<i64>)>(
        "SELECT cedula, card_number, ficha FROM employees",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load employee identities")?;

    Ok(rows
        .into_iter()
        .map(|(cedula, card_number, ficha)| EmployeeIdentity {
            cedula,
            card_number,
            ficha,
        })
        .collect())
}

/// Current rows of one reference table.
pub async fn load_reference(pool: &PgPool, dimension: &Dimension) -> Result<Vec<ReferenceRecord>> {
    let short = match dimension.short_description_column {
        Some(column) => format!("{}::text", column),
        None => "NULL::text".to_string(),
    };
    let parent = match dimension.parent_column {
        Some(column) => format!("{}::text", column),
        None => "NULL::text".to_string(),
    };
    let sql = format!(
        "SELECT {code}::text, COALESCE({description}, ''), {short}, {parent} FROM {table}",
        code = dimension.code_column,
        description = dimension.description_column,
        short = short,
        parent = parent,
        table = dimension.table,
    );

    let rows = sqlx::query_as::<_, (String, String, Option<String>, Option<String>)>(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to load reference table {}", dimension.table))?;

    Ok(rows
        .into_iter()
        .map(|(code, description, short_description, parent_code)| ReferenceRecord {
            code,
            description,
            short_description,
            parent_code,
        })
        .collect())
}

/// Compound keys of every stored dependent, for insert dedup. All three
/// columns are nullable in the legacy table, so they decode as options
/// and the key builder absorbs the gaps.
pub async fn load_family_keys(pool: &PgPool) -> Result<HashSet<(String, String)>> {
    let rows = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>)>(
        "SELECT employee_cedula, dependent_cedula, name FROM family_members",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load stored family members")?;

    Ok(rows
        .into_iter()
        .map(|(employee, dependent_id, name)| {
            stored_family_key(employee.as_deref(), dependent_id.as_deref(), name.as_deref())
        })
        .collect())
}

// =============================================================================
// Reference writes
// =============================================================================

/// Insert new reference records in batches. Column list follows the
/// dimension: code and description always, short description and parent
/// code when the dimension carries them.
pub async fn insert_references(
    tx: &mut Transaction<'_, Postgres>,
    dimension: &Dimension,
    records: &[ReferenceRecord],
    batch_size: usize,
) -> Result<()> {
    let mut columns = vec![dimension.code_column, dimension.description_column];
    let mut arrays = vec!["$1::text[]".to_string(), "$2::text[]".to_string()];
    let mut param = 3;
    if let Some(column) = dimension.short_description_column {
        columns.push(column);
        arrays.push(format!("${}::text[]", param));
        param += 1;
    }
    if let Some(column) = dimension.parent_column {
        columns.push(column);
        arrays.push(format!("${}::text[]", param));
    }
    let sql = format!(
        "INSERT INTO {} ({}) SELECT * FROM UNNEST({})",
        dimension.table,
        columns.join(", "),
        arrays.join(", ")
    );

    for batch in plan_batches(records, batch_size) {
        let codes: Vec<String> = batch.iter().map(|r| r.code.clone()).collect();
        let descriptions: Vec<String> = batch.iter().map(|r| r.description.clone()).collect();
        let shorts: Vec<Option<String>> =
            batch.iter().map(|r| r.short_description.clone()).collect();
        let parents: Vec<Option<String>> = batch.iter().map(|r| r.parent_code.clone()).collect();

        let mut query = sqlx::query(&sql).bind(codes).bind(descriptions);
        if dimension.short_description_column.is_some() {
            query = query.bind(shorts);
        }
        if dimension.parent_column.is_some() {
            query = query.bind(parents);
        }
        query
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to insert into {}", dimension.table))?;
    }
    Ok(())
}

/// Rewrite drifted descriptions on a sourced dimension.
pub async fn update_descriptions(
    tx: &mut Transaction<'_, Postgres>,
    dimension: &Dimension,
    updates: &[(String, String)],
    batch_size: usize,
) -> Result<()> {
    let sql = format!(
        "UPDATE {table} SET {description} = data.description \
         FROM (SELECT UNNEST($1::text[]) AS code, UNNEST($2::text[]) AS description) data \
         WHERE {table}.{code}::text = data.code",
        table = dimension.table,
        description = dimension.description_column,
        code = dimension.code_column,
    );

    for batch in plan_batches(updates, batch_size) {
        let codes: Vec<String> = batch.iter().map(|(code, _)| code.clone()).collect();
        let descriptions: Vec<String> = batch.iter().map(|(_, d)| d.clone()).collect();
        sqlx::query(&sql)
            .bind(codes)
            .bind(descriptions)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to update descriptions in {}", dimension.table))?;
    }
    Ok(())
}

/// Empty a reference table ahead of a full reload.
pub async fn truncate_reference(
    tx: &mut Transaction<'_, Postgres>,
    dimension: &Dimension,
) -> Result<()> {
    let sql = format!("TRUNCATE TABLE {}", dimension.table);
    sqlx::query(&sql)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to truncate {}", dimension.table))?;
    Ok(())
}

// =============================================================================
// Employee writes
// =============================================================================

/// Join column for a strategy and whether it compares numerically.
fn key_join(strategy: KeyStrategy) -> (&'static str, bool) {
    match strategy {
        KeyStrategy::NationalId => ("cedula", false),
        KeyStrategy::CardNumber => ("card_number", false),
        KeyStrategy::Ficha => ("ficha", true),
    }
}

/// Set one employee column from staged updates. Text keys join trimmed;
/// ficha keys are cast and compared numerically.
pub async fn apply_column_updates(
    tx: &mut Transaction<'_, Postgres>,
    column: &str,
    strategy: KeyStrategy,
    updates: &[StagedUpdate],
    batch_size: usize,
) -> Result<()> {
    let (key_column, numeric) = key_join(strategy);
    let join = if numeric {
        format!("employees.{} = data.key::bigint", key_column)
    } else {
        format!("TRIM(employees.{}) = data.key", key_column)
    };
    let sql = format!(
        "UPDATE employees SET {column} = data.value \
         FROM (SELECT UNNEST($1::text[]) AS key, UNNEST($2::text[]) AS value) data \
         WHERE {join}",
        column = column,
        join = join,
    );

    for batch in plan_batches(updates, batch_size) {
        let keys: Vec<String> = batch.iter().map(|u| u.key.clone()).collect();
        let values: Vec<String> = batch.iter().map(|u| u.value.clone()).collect();
        sqlx::query(&sql)
            .bind(keys)
            .bind(values)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to update employees.{}", column))?;
    }
    Ok(())
}

/// Nationality is a paired write, each column under its own guard: a NULL
/// in the staged code or date leaves the stored value alone, so a row can
/// refresh either column without clobbering the other.
pub async fn apply_nationality_updates(
    tx: &mut Transaction<'_, Postgres>,
    strategy: KeyStrategy,
    updates: &[NationalityUpdate],
    batch_size: usize,
) -> Result<()> {
    let (key_column, numeric) = key_join(strategy);
    let join = if numeric {
        format!("employees.{} = data.key::bigint", key_column)
    } else {
        format!("TRIM(employees.{}) = data.key", key_column)
    };
    let sql = format!(
        "UPDATE employees \
         SET nationality_code = COALESCE(data.code, employees.nationality_code), \
         last_paid_date = COALESCE(data.last_paid, employees.last_paid_date) \
         FROM (SELECT UNNEST($1::text[]) AS key, UNNEST($2::text[]) AS code, \
         UNNEST($3::date[]) AS last_paid) data \
         WHERE {join}",
        join = join,
    );

    for batch in plan_batches(updates, batch_size) {
        let keys: Vec<String> = batch.iter().map(|u| u.key.clone()).collect();
        let codes: Vec<Option<String>> = batch.iter().map(|u| u.code.clone()).collect();
        let dates: Vec<Option<NaiveDate>> = batch.iter().map(|u| u.last_paid).collect();
        sqlx::query(&sql)
            .bind(keys)
            .bind(codes)
            .bind(dates)
            .execute(&mut **tx)
            .await
            .context("Failed to update employee nationality")?;
    }
    Ok(())
}

/// Insert deduplicated dependents in batches.
pub async fn insert_family_members(
    tx: &mut Transaction<'_, Postgres>,
    members: &[FamilyMember],
    batch_size: usize,
) -> Result<()> {
    let sql = "INSERT INTO family_members \
               (employee_cedula, name, relationship_code, dependent_cedula, birth_date, disability) \
               SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::date[], $6::bool[])";

    for batch in plan_batches(members, batch_size) {
        let employees: Vec<String> = batch.iter().map(|m| m.employee_key.clone()).collect();
        let names: Vec<String> = batch.iter().map(|m| m.name.clone()).collect();
        let relationships: Vec<String> =
            batch.iter().map(|m| m.relationship_code.clone()).collect();
        let ids: Vec<Option<String>> = batch.iter().map(|m| m.dependent_id.clone()).collect();
        let births: Vec<Option<NaiveDate>> = batch.iter().map(|m| m.birth_date).collect();
        let disabilities: Vec<bool> = batch.iter().map(|m| m.disability).collect();

        sqlx::query(sql)
            .bind(employees)
            .bind(names)
            .bind(relationships)
            .bind(ids)
            .bind(births)
            .bind(disabilities)
            .execute(&mut **tx)
            .await
            .context("Failed to insert family members")?;
    }
    Ok(())
}

// =============================================================================
// Run ledger
// =============================================================================

pub async fn create_run(pool: &PgPool, pipeline: &str) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO migration_runs (run_id, pipeline, started_at, status) \
         VALUES ($1, $2, NOW(), 'running')",
    )
    .bind(run_id)
    .bind(pipeline)
    .execute(pool)
    .await
    .context("Failed to create migration run")?;
    Ok(run_id)
}

pub async fn finish_run(
    pool: &PgPool,
    run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE migration_runs SET finished_at = NOW(), status = $2, error = $3, detail = $4 \
         WHERE run_id = $1",
    )
    .bind(run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await
    .context("Failed to finish migration run")?;
    Ok(())
}
