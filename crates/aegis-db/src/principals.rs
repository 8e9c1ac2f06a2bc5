//! Principal rows: identity, lockout bookkeeping, revocation list.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use aegis_types::{FirmRole, PrincipalKind};

#[derive(Debug, Clone)]
pub struct PrincipalRow {
    pub principal_id: Uuid,
    pub kind: PrincipalKind,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub verified: bool,
    pub suspended: bool,
    pub banned: bool,
    pub prank_count: i32,
    pub failed_login_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub otp_digest: Option<String>,
    pub otp_expires_at: Option<DateTime<Utc>>,
    pub otp_attempts_left: Option<i32>,
    pub firm_id: Option<Uuid>,
    pub firm_role: Option<FirmRole>,
    pub created_at_utc: DateTime<Utc>,
}

fn map_principal(row: &sqlx::postgres::PgRow) -> Result<PrincipalRow> {
    let firm_role: Option<String> = row.try_get("firm_role")?;
    Ok(PrincipalRow {
        principal_id: row.try_get("principal_id")?,
        kind: PrincipalKind::parse(&row.try_get::<String, _>("kind")?)?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        verified: row.try_get("verified")?,
        suspended: row.try_get("suspended")?,
        banned: row.try_get("banned")?,
        prank_count: row.try_get("prank_count")?,
        failed_login_count: row.try_get("failed_login_count")?,
        locked_until: row.try_get("locked_until")?,
        otp_digest: row.try_get("otp_digest")?,
        otp_expires_at: row.try_get("otp_expires_at")?,
        otp_attempts_left: row.try_get("otp_attempts_left")?,
        firm_id: row.try_get("firm_id")?,
        firm_role: firm_role.as_deref().map(FirmRole::parse).transpose()?,
        created_at_utc: row.try_get("created_at_utc")?,
    })
}

const PRINCIPAL_COLUMNS: &str = r#"
    principal_id, kind, email, phone, password_hash, verified, suspended, banned,
    prank_count, failed_login_count, locked_until, otp_digest, otp_expires_at,
    otp_attempts_left, firm_id, firm_role, created_at_utc
"#;

#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub principal_id: Uuid,
    pub kind: PrincipalKind,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub firm_id: Option<Uuid>,
    pub firm_role: Option<FirmRole>,
}

/// Insert a principal (unverified). Unique violations on email/phone bubble
/// up as sqlx errors; callers translate them via the constraint name.
pub async fn insert_principal(pool: &PgPool, p: &NewPrincipal) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into principals (principal_id, kind, email, phone, password_hash, firm_id, firm_role)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(p.principal_id)
    .bind(p.kind.as_str())
    .bind(&p.email)
    .bind(&p.phone)
    .bind(&p.password_hash)
    .bind(p.firm_id)
    .bind(p.firm_role.map(|r| r.as_str()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_principal(pool: &PgPool, principal_id: Uuid) -> Result<Option<PrincipalRow>> {
    let row = sqlx::query(&format!(
        "select {PRINCIPAL_COLUMNS} from principals where principal_id = $1"
    ))
    .bind(principal_id)
    .fetch_optional(pool)
    .await
    .context("fetch_principal failed")?;

    row.as_ref().map(map_principal).transpose()
}

pub async fn fetch_principal_by_email(pool: &PgPool, email: &str) -> Result<Option<PrincipalRow>> {
    let row = sqlx::query(&format!(
        "select {PRINCIPAL_COLUMNS} from principals where lower(email) = lower($1)"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
    .context("fetch_principal_by_email failed")?;

    row.as_ref().map(map_principal).transpose()
}

pub async fn fetch_principal_by_phone(pool: &PgPool, phone: &str) -> Result<Option<PrincipalRow>> {
    let row = sqlx::query(&format!(
        "select {PRINCIPAL_COLUMNS} from principals where phone = $1"
    ))
    .bind(phone)
    .fetch_optional(pool)
    .await
    .context("fetch_principal_by_phone failed")?;

    row.as_ref().map(map_principal).transpose()
}

/// Row-locked fetch inside an open transaction. Used wherever lockout or
/// prank counters mutate, so concurrent updates serialise.
pub async fn fetch_principal_for_update(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
) -> Result<Option<PrincipalRow>> {
    let row = sqlx::query(&format!(
        "select {PRINCIPAL_COLUMNS} from principals where principal_id = $1 for update"
    ))
    .bind(principal_id)
    .fetch_optional(&mut **tx)
    .await
    .context("fetch_principal_for_update failed")?;

    row.as_ref().map(map_principal).transpose()
}

/// Persist the lockout bookkeeping fields in one shot.
pub async fn update_lockout_state(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
    failed_login_count: i32,
    locked_until: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        update principals
        set failed_login_count = $2,
            locked_until = $3
        where principal_id = $1
        "#,
    )
    .bind(principal_id)
    .bind(failed_login_count)
    .bind(locked_until)
    .execute(&mut **tx)
    .await
    .context("update_lockout_state failed")?;
    Ok(())
}

/// Store a fresh unlock OTP, replacing any prior one.
pub async fn set_unlock_otp(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
    digest: &str,
    expires_at: DateTime<Utc>,
    attempts_left: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        update principals
        set otp_digest = $2,
            otp_expires_at = $3,
            otp_attempts_left = $4
        where principal_id = $1
        "#,
    )
    .bind(principal_id)
    .bind(digest)
    .bind(expires_at)
    .bind(attempts_left)
    .execute(&mut **tx)
    .await
    .context("set_unlock_otp failed")?;
    Ok(())
}

pub async fn update_otp_attempts(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
    attempts_left: Option<i32>,
) -> Result<()> {
    sqlx::query(
        r#"
        update principals
        set otp_attempts_left = $2
        where principal_id = $1
        "#,
    )
    .bind(principal_id)
    .bind(attempts_left)
    .execute(&mut **tx)
    .await
    .context("update_otp_attempts failed")?;
    Ok(())
}

pub async fn clear_unlock_otp(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        update principals
        set otp_digest = null,
            otp_expires_at = null,
            otp_attempts_left = null
        where principal_id = $1
        "#,
    )
    .bind(principal_id)
    .execute(&mut **tx)
    .await
    .context("clear_unlock_otp failed")?;
    Ok(())
}

pub async fn mark_verified(pool: &PgPool, principal_id: Uuid) -> Result<()> {
    sqlx::query("update principals set verified = true where principal_id = $1")
        .bind(principal_id)
        .execute(pool)
        .await
        .context("mark_verified failed")?;
    Ok(())
}

pub async fn set_suspended(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
    suspended: bool,
) -> Result<()> {
    sqlx::query("update principals set suspended = $2 where principal_id = $1")
        .bind(principal_id)
        .bind(suspended)
        .execute(&mut **tx)
        .await
        .context("set_suspended failed")?;
    Ok(())
}

/// Ban is sticky: there is deliberately no `set_banned(false)` path here.
/// Reversal is a platform-admin manual operation outside this crate.
pub async fn set_banned(tx: &mut Transaction<'_, Postgres>, principal_id: Uuid) -> Result<()> {
    sqlx::query("update principals set banned = true where principal_id = $1")
        .bind(principal_id)
        .execute(&mut **tx)
        .await
        .context("set_banned failed")?;
    Ok(())
}

/// Increment the prank counter under the caller's row-lock and return the
/// new total.
pub async fn increment_prank_count(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
) -> Result<i32> {
    let (count,): (i32,) = sqlx::query_as(
        r#"
        update principals
        set prank_count = prank_count + 1
        where principal_id = $1
        returning prank_count
        "#,
    )
    .bind(principal_id)
    .fetch_one(&mut **tx)
    .await
    .context("increment_prank_count failed")?;
    Ok(count)
}

/// Office-staff principals of a firm (dashboard audience).
pub async fn list_firm_office_staff(pool: &PgPool, firm_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select principal_id
        from principals
        where firm_id = $1
          and firm_role in ('firm_user','firm_supervisor','firm_admin')
        "#,
    )
    .bind(firm_id)
    .fetch_all(pool)
    .await
    .context("list_firm_office_staff failed")?;
    rows.iter()
        .map(|r| Ok(r.try_get::<Uuid, _>("principal_id")?))
        .collect()
}

/// Supervisors and admins of a firm (silence alerts).
pub async fn list_firm_supervisors(pool: &PgPool, firm_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select principal_id
        from principals
        where firm_id = $1
          and firm_role in ('firm_supervisor','firm_admin')
        "#,
    )
    .bind(firm_id)
    .fetch_all(pool)
    .await
    .context("list_firm_supervisors failed")?;
    rows.iter()
        .map(|r| Ok(r.try_get::<Uuid, _>("principal_id")?))
        .collect()
}

// ---------------------------------------------------------------------------
// Token revocation list
// ---------------------------------------------------------------------------

/// Revoke a token by jti. Idempotent: revoking twice is not an error.
pub async fn revoke_token(pool: &PgPool, jti: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        insert into revoked_tokens (jti, expires_at_utc)
        values ($1, $2)
        on conflict (jti) do nothing
        "#,
    )
    .bind(jti)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("revoke_token failed")?;
    Ok(())
}

pub async fn is_token_revoked(pool: &PgPool, jti: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as("select jti from revoked_tokens where jti = $1")
        .bind(jti)
        .fetch_optional(pool)
        .await
        .context("is_token_revoked failed")?;
    Ok(row.is_some())
}

/// Drop revocation rows whose token would have expired anyway. Returns the
/// number pruned. Safe to run repeatedly.
pub async fn prune_revoked_tokens(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("delete from revoked_tokens where expires_at_utc <= $1")
        .bind(now)
        .execute(pool)
        .await
        .context("prune_revoked_tokens failed")?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Security events
// ---------------------------------------------------------------------------

pub async fn record_security_event(
    pool: &PgPool,
    kind: &str,
    principal_id: Option<Uuid>,
    detail: Value,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into security_events (kind, principal_id, detail)
        values ($1, $2, $3)
        "#,
    )
    .bind(kind)
    .bind(principal_id)
    .bind(detail)
    .execute(pool)
    .await
    .context("record_security_event failed")?;
    Ok(())
}
