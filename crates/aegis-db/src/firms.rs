//! Security firms, coverage areas, teams, provider catalogue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use aegis_types::{FirmVerification, GeoPoint, ProviderStatus, ServiceType};

use crate::jsonpoint::{point_from_json, point_to_json, ring_to_json};

#[derive(Debug, Clone)]
pub struct FirmRow {
    pub firm_id: Uuid,
    pub name: String,
    pub registration_number: String,
    pub verification_status: FirmVerification,
    pub credit_balance: i64,
    pub locked: bool,
    pub created_at_utc: DateTime<Utc>,
}

fn map_firm(row: &sqlx::postgres::PgRow) -> Result<FirmRow> {
    Ok(FirmRow {
        firm_id: row.try_get("firm_id")?,
        name: row.try_get("name")?,
        registration_number: row.try_get("registration_number")?,
        verification_status: FirmVerification::parse(
            &row.try_get::<String, _>("verification_status")?,
        )?,
        credit_balance: row.try_get("credit_balance")?,
        locked: row.try_get("locked")?,
        created_at_utc: row.try_get("created_at_utc")?,
    })
}

const FIRM_COLUMNS: &str = r#"
    firm_id, name, registration_number, verification_status, credit_balance, locked, created_at_utc
"#;

pub async fn insert_firm(
    pool: &PgPool,
    firm_id: Uuid,
    name: &str,
    registration_number: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into security_firms (firm_id, name, registration_number)
        values ($1, $2, $3)
        "#,
    )
    .bind(firm_id)
    .bind(name)
    .bind(registration_number)
    .execute(pool)
    .await
    .context("insert_firm failed")?;
    Ok(())
}

pub async fn fetch_firm(pool: &PgPool, firm_id: Uuid) -> Result<Option<FirmRow>> {
    let row = sqlx::query(&format!(
        "select {FIRM_COLUMNS} from security_firms where firm_id = $1"
    ))
    .bind(firm_id)
    .fetch_optional(pool)
    .await
    .context("fetch_firm failed")?;
    row.as_ref().map(map_firm).transpose()
}

/// Row-locked fetch; serialises credit mutations per firm.
pub async fn fetch_firm_for_update(
    tx: &mut Transaction<'_, Postgres>,
    firm_id: Uuid,
) -> Result<Option<FirmRow>> {
    let row = sqlx::query(&format!(
        "select {FIRM_COLUMNS} from security_firms where firm_id = $1 for update"
    ))
    .bind(firm_id)
    .fetch_optional(&mut **tx)
    .await
    .context("fetch_firm_for_update failed")?;
    row.as_ref().map(map_firm).transpose()
}

pub async fn set_firm_verification(
    pool: &PgPool,
    firm_id: Uuid,
    status: FirmVerification,
) -> Result<()> {
    sqlx::query("update security_firms set verification_status = $2 where firm_id = $1")
        .bind(firm_id)
        .bind(status.as_str())
        .execute(pool)
        .await
        .context("set_firm_verification failed")?;
    Ok(())
}

/// Apply a credit delta under the caller's row-lock, appending the ledger
/// row in the same transaction. The check constraint keeps the balance
/// non-negative even if a caller skips the precondition.
pub async fn apply_credit_delta(
    tx: &mut Transaction<'_, Postgres>,
    firm_id: Uuid,
    delta: i64,
    reason: &str,
    external_ref: Option<&str>,
) -> Result<i64> {
    let (balance,): (i64,) = sqlx::query_as(
        r#"
        update security_firms
        set credit_balance = credit_balance + $2
        where firm_id = $1
        returning credit_balance
        "#,
    )
    .bind(firm_id)
    .bind(delta)
    .fetch_one(&mut **tx)
    .await
    .context("apply_credit_delta balance update failed")?;

    sqlx::query(
        r#"
        insert into credit_transactions (firm_id, delta, reason, external_ref)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(firm_id)
    .bind(delta)
    .bind(reason)
    .bind(external_ref)
    .execute(&mut **tx)
    .await
    .context("apply_credit_delta ledger insert failed")?;

    Ok(balance)
}

#[derive(Debug, Clone)]
pub struct CreditTransactionRow {
    pub transaction_id: i64,
    pub delta: i64,
    pub reason: String,
    pub external_ref: Option<String>,
    pub created_at_utc: DateTime<Utc>,
}

/// Append-only ledger rows for a firm, newest first.
pub async fn list_credit_transactions(
    pool: &PgPool,
    firm_id: Uuid,
) -> Result<Vec<CreditTransactionRow>> {
    let rows = sqlx::query(
        r#"
        select transaction_id, delta, reason, external_ref, created_at_utc
        from credit_transactions
        where firm_id = $1
        order by transaction_id desc
        "#,
    )
    .bind(firm_id)
    .fetch_all(pool)
    .await
    .context("list_credit_transactions failed")?;

    rows.iter()
        .map(|row| {
            Ok(CreditTransactionRow {
                transaction_id: row.try_get("transaction_id")?,
                delta: row.try_get("delta")?,
                reason: row.try_get("reason")?,
                external_ref: row.try_get("external_ref")?,
                created_at_utc: row.try_get("created_at_utc")?,
            })
        })
        .collect()
}

/// Has this external payment reference already been applied?
pub async fn credit_external_ref_exists(pool: &PgPool, external_ref: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "select transaction_id from credit_transactions where external_ref = $1",
    )
    .bind(external_ref)
    .fetch_optional(pool)
    .await
    .context("credit_external_ref_exists failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Coverage areas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoverageAreaRow {
    pub area_id: Uuid,
    pub firm_id: Uuid,
    pub name: String,
    pub ring: Value,
    pub active: bool,
}

/// Insert a coverage area. The ring must already be validated/normalised by
/// `aegis_geo::validate_ring`.
pub async fn insert_coverage_area(
    pool: &PgPool,
    area_id: Uuid,
    firm_id: Uuid,
    name: &str,
    ring: &[GeoPoint],
) -> Result<()> {
    sqlx::query(
        r#"
        insert into coverage_areas (area_id, firm_id, name, ring)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(area_id)
    .bind(firm_id)
    .bind(name)
    .bind(ring_to_json(ring))
    .execute(pool)
    .await
    .context("insert_coverage_area failed")?;
    Ok(())
}

pub async fn fetch_area_firm(pool: &PgPool, area_id: Uuid) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("select firm_id from coverage_areas where area_id = $1")
            .bind(area_id)
            .fetch_optional(pool)
            .await
            .context("fetch_area_firm failed")?;
    Ok(row.map(|(firm_id,)| firm_id))
}

pub async fn set_area_active(pool: &PgPool, area_id: Uuid, active: bool) -> Result<()> {
    sqlx::query("update coverage_areas set active = $2 where area_id = $1")
        .bind(area_id)
        .bind(active)
        .execute(pool)
        .await
        .context("set_area_active failed")?;
    Ok(())
}

pub async fn list_areas_for_firm(pool: &PgPool, firm_id: Uuid) -> Result<Vec<CoverageAreaRow>> {
    let rows = sqlx::query(
        "select area_id, firm_id, name, ring, active from coverage_areas where firm_id = $1",
    )
    .bind(firm_id)
    .fetch_all(pool)
    .await
    .context("list_areas_for_firm failed")?;

    rows.iter()
        .map(|row| {
            Ok(CoverageAreaRow {
                area_id: row.try_get("area_id")?,
                firm_id: row.try_get("firm_id")?,
                name: row.try_get("name")?,
                ring: row.try_get("ring")?,
                active: row.try_get("active")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Teams
// ---------------------------------------------------------------------------

pub async fn insert_team(
    pool: &PgPool,
    team_id: Uuid,
    firm_id: Uuid,
    name: &str,
    leader_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into teams (team_id, firm_id, name, leader_id)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(team_id)
    .bind(firm_id)
    .bind(name)
    .bind(leader_id)
    .execute(pool)
    .await
    .context("insert_team failed")?;
    Ok(())
}

pub async fn add_team_member(pool: &PgPool, team_id: Uuid, member_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        insert into team_members (team_id, member_id)
        values ($1, $2)
        on conflict do nothing
        "#,
    )
    .bind(team_id)
    .bind(member_id)
    .execute(pool)
    .await
    .context("add_team_member failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TeamRow {
    pub team_id: Uuid,
    pub firm_id: Uuid,
    pub name: String,
    pub leader_id: Uuid,
}

pub async fn fetch_team(pool: &PgPool, team_id: Uuid) -> Result<Option<TeamRow>> {
    let row = sqlx::query("select team_id, firm_id, name, leader_id from teams where team_id = $1")
        .bind(team_id)
        .fetch_optional(pool)
        .await
        .context("fetch_team failed")?;

    row.map(|row| {
        Ok(TeamRow {
            team_id: row.try_get("team_id")?,
            firm_id: row.try_get("firm_id")?,
            name: row.try_get("name")?,
            leader_id: row.try_get("leader_id")?,
        })
    })
    .transpose()
}

/// Team leader + members, leader first.
pub async fn list_team_participants(pool: &PgPool, team_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select leader_id as participant from teams where team_id = $1
        union
        select member_id as participant from team_members where team_id = $1
        "#,
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("list_team_participants failed")?;

    rows.iter()
        .map(|r| Ok(r.try_get::<Uuid, _>("participant")?))
        .collect()
}

/// Is this principal the leader or a member of the team?
pub async fn is_team_participant(pool: &PgPool, team_id: Uuid, principal_id: Uuid) -> Result<bool> {
    let row: Option<(bool,)> = sqlx::query_as(
        r#"
        select true
        from teams t
        where t.team_id = $1
          and (t.leader_id = $2
               or exists (select 1 from team_members m
                          where m.team_id = $1 and m.member_id = $2))
        "#,
    )
    .bind(team_id)
    .bind(principal_id)
    .fetch_optional(pool)
    .await
    .context("is_team_participant failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Provider types and providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProviderTypeRow {
    pub provider_type_id: Uuid,
    pub code: String,
    pub display_name: String,
    pub service_type: ServiceType,
    pub default_radius_km: f64,
    pub priority: i32,
    pub active: bool,
}

pub async fn insert_provider_type(
    pool: &PgPool,
    t: &ProviderTypeRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into provider_types
            (provider_type_id, code, display_name, service_type, default_radius_km, priority, active)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(t.provider_type_id)
    .bind(&t.code)
    .bind(&t.display_name)
    .bind(t.service_type.as_str())
    .bind(t.default_radius_km)
    .bind(t.priority)
    .bind(t.active)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_provider_type(
    pool: &PgPool,
    provider_type_id: Uuid,
) -> Result<Option<ProviderTypeRow>> {
    let row = sqlx::query(
        r#"
        select provider_type_id, code, display_name, service_type,
               default_radius_km, priority, active
        from provider_types
        where provider_type_id = $1
        "#,
    )
    .bind(provider_type_id)
    .fetch_optional(pool)
    .await
    .context("fetch_provider_type failed")?;

    row.map(|row| {
        Ok(ProviderTypeRow {
            provider_type_id: row.try_get("provider_type_id")?,
            code: row.try_get("code")?,
            display_name: row.try_get("display_name")?,
            service_type: ServiceType::parse(&row.try_get::<String, _>("service_type")?)?,
            default_radius_km: row.try_get("default_radius_km")?,
            priority: row.try_get("priority")?,
            active: row.try_get("active")?,
        })
    })
    .transpose()
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub provider_id: Uuid,
    pub firm_id: Uuid,
    pub provider_type_id: Uuid,
    pub name: String,
    pub current_position: GeoPoint,
    pub coverage_radius_km: f64,
    pub status: ProviderStatus,
    pub active: bool,
}

fn map_provider(row: &sqlx::postgres::PgRow) -> Result<ProviderRow> {
    Ok(ProviderRow {
        provider_id: row.try_get("provider_id")?,
        firm_id: row.try_get("firm_id")?,
        provider_type_id: row.try_get("provider_type_id")?,
        name: row.try_get("name")?,
        current_position: point_from_json(&row.try_get::<Value, _>("current_position")?)?,
        coverage_radius_km: row.try_get("coverage_radius_km")?,
        status: ProviderStatus::parse(&row.try_get::<String, _>("status")?)?,
        active: row.try_get("active")?,
    })
}

const PROVIDER_COLUMNS: &str = r#"
    provider_id, firm_id, provider_type_id, name, current_position,
    coverage_radius_km, status, active
"#;

pub async fn insert_provider(pool: &PgPool, p: &ProviderRow, base: GeoPoint) -> Result<()> {
    sqlx::query(
        r#"
        insert into providers
            (provider_id, firm_id, provider_type_id, name, current_position, base_position,
             coverage_radius_km, status, active)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(p.provider_id)
    .bind(p.firm_id)
    .bind(p.provider_type_id)
    .bind(&p.name)
    .bind(point_to_json(p.current_position))
    .bind(point_to_json(base))
    .bind(p.coverage_radius_km)
    .bind(p.status.as_str())
    .bind(p.active)
    .execute(pool)
    .await
    .context("insert_provider failed")?;
    Ok(())
}

pub async fn fetch_provider(pool: &PgPool, provider_id: Uuid) -> Result<Option<ProviderRow>> {
    let row = sqlx::query(&format!(
        "select {PROVIDER_COLUMNS} from providers where provider_id = $1"
    ))
    .bind(provider_id)
    .fetch_optional(pool)
    .await
    .context("fetch_provider failed")?;
    row.as_ref().map(map_provider).transpose()
}

/// Guarded status flip: only succeeds when the provider is currently in
/// `expected`. Returns false if the guard did not match.
pub async fn transition_provider_status(
    tx: &mut Transaction<'_, Postgres>,
    provider_id: Uuid,
    expected: ProviderStatus,
    next: ProviderStatus,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update providers
        set status = $3
        where provider_id = $1
          and status = $2
        returning provider_id
        "#,
    )
    .bind(provider_id)
    .bind(expected.as_str())
    .bind(next.as_str())
    .fetch_optional(&mut **tx)
    .await
    .context("transition_provider_status failed")?;
    Ok(row.is_some())
}

pub async fn update_provider_position(
    pool: &PgPool,
    provider_id: Uuid,
    position: GeoPoint,
) -> Result<()> {
    sqlx::query("update providers set current_position = $2 where provider_id = $1")
        .bind(provider_id)
        .bind(point_to_json(position))
        .execute(pool)
        .await
        .context("update_provider_position failed")?;
    Ok(())
}
