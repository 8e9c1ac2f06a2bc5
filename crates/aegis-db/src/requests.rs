//! Panic requests and their append-only satellites.
//!
//! Status transitions are guarded updates: the state read, the precondition
//! check, and the write happen inside one transaction with a row-lock on
//! the request, and every change appends a `request_status_updates` row in
//! the same transaction. Readers therefore never observe a status without
//! its log entry.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use aegis_types::{GeoPoint, LocationSource, RequestStatus, ServiceType};

use crate::jsonpoint::{point_from_json, point_to_json};

#[derive(Debug, Clone)]
pub struct PanicRequestRow {
    pub request_id: Uuid,
    pub requester_phone: String,
    pub requester_user_id: Uuid,
    pub group_id: Uuid,
    pub service_type: ServiceType,
    pub point: GeoPoint,
    pub address: String,
    pub description: Option<String>,
    pub status: RequestStatus,
    pub assigned_team_id: Option<Uuid>,
    pub assigned_provider_id: Option<Uuid>,
    pub call_handler_id: Option<Uuid>,
    pub grace_alert: bool,
    pub silent_mode: bool,
    pub created_at_utc: DateTime<Utc>,
    pub allocated_at_utc: Option<DateTime<Utc>>,
    pub accepted_at_utc: Option<DateTime<Utc>>,
    pub arrived_at_utc: Option<DateTime<Utc>>,
    pub completed_at_utc: Option<DateTime<Utc>>,
}

fn map_request(row: &sqlx::postgres::PgRow) -> Result<PanicRequestRow> {
    Ok(PanicRequestRow {
        request_id: row.try_get("request_id")?,
        requester_phone: row.try_get("requester_phone")?,
        requester_user_id: row.try_get("requester_user_id")?,
        group_id: row.try_get("group_id")?,
        service_type: ServiceType::parse(&row.try_get::<String, _>("service_type")?)?,
        point: point_from_json(&row.try_get::<Value, _>("point")?)?,
        address: row.try_get("address")?,
        description: row.try_get("description")?,
        status: RequestStatus::parse(&row.try_get::<String, _>("status")?)?,
        assigned_team_id: row.try_get("assigned_team_id")?,
        assigned_provider_id: row.try_get("assigned_provider_id")?,
        call_handler_id: row.try_get("call_handler_id")?,
        grace_alert: row.try_get("grace_alert")?,
        silent_mode: row.try_get("silent_mode")?,
        created_at_utc: row.try_get("created_at_utc")?,
        allocated_at_utc: row.try_get("allocated_at_utc")?,
        accepted_at_utc: row.try_get("accepted_at_utc")?,
        arrived_at_utc: row.try_get("arrived_at_utc")?,
        completed_at_utc: row.try_get("completed_at_utc")?,
    })
}

const REQUEST_COLUMNS: &str = r#"
    request_id, requester_phone, requester_user_id, group_id, service_type, point,
    address, description, status, assigned_team_id, assigned_provider_id,
    call_handler_id, grace_alert, silent_mode, created_at_utc, allocated_at_utc,
    accepted_at_utc, arrived_at_utc, completed_at_utc
"#;

#[derive(Debug, Clone)]
pub struct NewPanicRequest {
    pub request_id: Uuid,
    pub requester_phone: String,
    pub requester_user_id: Uuid,
    pub group_id: Uuid,
    pub service_type: ServiceType,
    pub point: GeoPoint,
    pub address: String,
    pub description: Option<String>,
    pub grace_alert: bool,
    pub silent_mode: bool,
}

/// Persist a new pending request and its first status-update row in one
/// transaction.
pub async fn insert_panic_request(pool: &PgPool, req: &NewPanicRequest) -> Result<()> {
    let mut tx = pool.begin().await.context("begin insert_panic_request tx")?;

    sqlx::query(
        r#"
        insert into panic_requests
            (request_id, requester_phone, requester_user_id, group_id, service_type,
             point, address, description, status, grace_alert, silent_mode)
        values ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10)
        "#,
    )
    .bind(req.request_id)
    .bind(&req.requester_phone)
    .bind(req.requester_user_id)
    .bind(req.group_id)
    .bind(req.service_type.as_str())
    .bind(point_to_json(req.point))
    .bind(&req.address)
    .bind(&req.description)
    .bind(req.grace_alert)
    .bind(req.silent_mode)
    .execute(&mut *tx)
    .await
    .context("insert_panic_request failed")?;

    append_status_update(
        &mut tx,
        req.request_id,
        RequestStatus::Pending,
        Some("request created"),
        None,
        None,
    )
    .await?;

    tx.commit().await.context("commit insert_panic_request tx")?;
    Ok(())
}

pub async fn fetch_request(pool: &PgPool, request_id: Uuid) -> Result<Option<PanicRequestRow>> {
    let row = sqlx::query(&format!(
        "select {REQUEST_COLUMNS} from panic_requests where request_id = $1"
    ))
    .bind(request_id)
    .fetch_optional(pool)
    .await
    .context("fetch_request failed")?;
    row.as_ref().map(map_request).transpose()
}

/// Row-locked fetch: every transition goes through this.
pub async fn fetch_request_for_update(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
) -> Result<Option<PanicRequestRow>> {
    let row = sqlx::query(&format!(
        "select {REQUEST_COLUMNS} from panic_requests where request_id = $1 for update"
    ))
    .bind(request_id)
    .fetch_optional(&mut **tx)
    .await
    .context("fetch_request_for_update failed")?;
    row.as_ref().map(map_request).transpose()
}

/// Write the new status (plus the matching timestamp column) under the
/// caller's row-lock.
pub async fn write_request_status(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    status: RequestStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let ts_column = match status {
        RequestStatus::Allocated => "allocated_at_utc",
        RequestStatus::Accepted => "accepted_at_utc",
        RequestStatus::Arrived => "arrived_at_utc",
        RequestStatus::Completed => "completed_at_utc",
        _ => "",
    };

    let sql = if ts_column.is_empty() {
        "update panic_requests set status = $2 where request_id = $1".to_string()
    } else {
        format!(
            "update panic_requests set status = $2, {ts_column} = $3 where request_id = $1"
        )
    };

    let q = sqlx::query(&sql).bind(request_id).bind(status.as_str());
    let q = if ts_column.is_empty() { q } else { q.bind(now) };
    q.execute(&mut **tx)
        .await
        .context("write_request_status failed")?;
    Ok(())
}

pub async fn write_request_assignment(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    team_id: Option<Uuid>,
    provider_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        update panic_requests
        set assigned_team_id = $2,
            assigned_provider_id = $3
        where request_id = $1
        "#,
    )
    .bind(request_id)
    .bind(team_id)
    .bind(provider_id)
    .execute(&mut **tx)
    .await
    .context("write_request_assignment failed")?;
    Ok(())
}

/// Bind the office member handling a call-type request.
pub async fn set_call_handler(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    handler_id: Uuid,
) -> Result<()> {
    sqlx::query("update panic_requests set call_handler_id = $2 where request_id = $1")
        .bind(request_id)
        .bind(handler_id)
        .execute(&mut **tx)
        .await
        .context("set_call_handler failed")?;
    Ok(())
}

/// Update the request's primary point (location-log ingest with
/// `update_primary=true`).
pub async fn update_request_point(pool: &PgPool, request_id: Uuid, point: GeoPoint) -> Result<()> {
    sqlx::query("update panic_requests set point = $2 where request_id = $1")
        .bind(request_id)
        .bind(point_to_json(point))
        .execute(pool)
        .await
        .context("update_request_point failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Status-update log
// ---------------------------------------------------------------------------

pub async fn append_status_update(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    status: RequestStatus,
    message: Option<&str>,
    responder_position: Option<GeoPoint>,
    responder_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into request_status_updates
            (request_id, status, message, responder_position, responder_id)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(request_id)
    .bind(status.as_str())
    .bind(message)
    .bind(responder_position.map(point_to_json))
    .bind(responder_id)
    .execute(&mut **tx)
    .await
    .context("append_status_update failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StatusUpdateRow {
    pub update_id: i64,
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub message: Option<String>,
    pub responder_id: Option<Uuid>,
    pub created_at_utc: DateTime<Utc>,
}

pub async fn list_status_updates(pool: &PgPool, request_id: Uuid) -> Result<Vec<StatusUpdateRow>> {
    let rows = sqlx::query(
        r#"
        select update_id, request_id, status, message, responder_id, created_at_utc
        from request_status_updates
        where request_id = $1
        order by update_id asc
        "#,
    )
    .bind(request_id)
    .fetch_all(pool)
    .await
    .context("list_status_updates failed")?;

    rows.iter()
        .map(|row| {
            Ok(StatusUpdateRow {
                update_id: row.try_get("update_id")?,
                request_id: row.try_get("request_id")?,
                status: RequestStatus::parse(&row.try_get::<String, _>("status")?)?,
                message: row.try_get("message")?,
                responder_id: row.try_get("responder_id")?,
                created_at_utc: row.try_get("created_at_utc")?,
            })
        })
        .collect()
}

/// Timestamp of the most recent status update or location log for a
/// request; used by the silence alert.
pub async fn last_activity_at(
    pool: &PgPool,
    request_id: Uuid,
) -> Result<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
        r#"
        select greatest(
            (select max(created_at_utc) from request_status_updates where request_id = $1),
            (select max(created_at_utc) from location_logs where request_id = $1)
        )
        "#,
    )
    .bind(request_id)
    .fetch_one(pool)
    .await
    .context("last_activity_at failed")?;
    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Dedupe / rate-limit queries
// ---------------------------------------------------------------------------

/// Count non-terminal requests for `(phone, service_type)` created after
/// `since`.
pub async fn count_open_requests_for_phone(
    pool: &PgPool,
    phone: &str,
    service_type: ServiceType,
    since: DateTime<Utc>,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from panic_requests
        where requester_phone = $1
          and service_type = $2
          and status not in ('completed','cancelled')
          and created_at_utc > $3
        "#,
    )
    .bind(phone)
    .bind(service_type.as_str())
    .bind(since)
    .fetch_one(pool)
    .await
    .context("count_open_requests_for_phone failed")?;
    Ok(n)
}

/// Count all requests accepted from this phone after `since` (burst limit).
pub async fn count_recent_requests_for_phone(
    pool: &PgPool,
    phone: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from panic_requests
        where requester_phone = $1
          and created_at_utc > $2
        "#,
    )
    .bind(phone)
    .bind(since)
    .fetch_one(pool)
    .await
    .context("count_recent_requests_for_phone failed")?;
    Ok(n)
}

/// Open requests created before the cutoff in a given status. Used for
/// the pending sweep, where the window runs from creation.
pub async fn list_requests_in_status_older_than(
    pool: &PgPool,
    status: RequestStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<PanicRequestRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {REQUEST_COLUMNS}
        from panic_requests
        where status = $1
          and created_at_utc <= $2
        order by created_at_utc asc
        "#
    ))
    .bind(status.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("list_requests_in_status_older_than failed")?;
    rows.iter().map(map_request).collect()
}

/// Allocated requests whose acceptance window opened before the cutoff.
/// The window runs from `allocated_at_utc`, when the request actually
/// entered Allocated; creation time only backstops legacy rows.
pub async fn list_allocated_older_than(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<PanicRequestRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {REQUEST_COLUMNS}
        from panic_requests
        where status = 'allocated'
          and coalesce(allocated_at_utc, created_at_utc) <= $1
        order by created_at_utc asc
        "#
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("list_allocated_older_than failed")?;
    rows.iter().map(map_request).collect()
}

/// Open accepted/en_route requests (candidates for the silence alert).
pub async fn list_in_progress_requests(pool: &PgPool) -> Result<Vec<PanicRequestRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {REQUEST_COLUMNS}
        from panic_requests
        where status in ('accepted','en_route')
        order by created_at_utc asc
        "#
    ))
    .fetch_all(pool)
    .await
    .context("list_in_progress_requests failed")?;
    rows.iter().map(map_request).collect()
}

// ---------------------------------------------------------------------------
// Provider assignments
// ---------------------------------------------------------------------------

pub async fn insert_provider_assignment(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    provider_id: Uuid,
    distance_km: f64,
    eta_minutes: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into provider_assignments (request_id, provider_id, distance_km, eta_minutes)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(request_id)
    .bind(provider_id)
    .bind(distance_km)
    .bind(eta_minutes)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Deactivate the assignment binding this provider to this request.
pub async fn release_provider_assignment(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    provider_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        update provider_assignments
        set active = false
        where request_id = $1
          and provider_id = $2
          and active
        "#,
    )
    .bind(request_id)
    .bind(provider_id)
    .execute(&mut **tx)
    .await
    .context("release_provider_assignment failed")?;
    Ok(())
}

pub async fn provider_has_active_assignment(
    tx: &mut Transaction<'_, Postgres>,
    provider_id: Uuid,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "select assignment_id from provider_assignments where provider_id = $1 and active",
    )
    .bind(provider_id)
    .fetch_optional(&mut **tx)
    .await
    .context("provider_has_active_assignment failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Location logs
// ---------------------------------------------------------------------------

pub async fn append_location_log(
    pool: &PgPool,
    request_id: Uuid,
    user_id: Uuid,
    point: GeoPoint,
    accuracy_m: Option<f64>,
    source: LocationSource,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into location_logs (request_id, user_id, point, accuracy_m, source)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(request_id)
    .bind(user_id)
    .bind(point_to_json(point))
    .bind(accuracy_m)
    .bind(source.as_str())
    .execute(pool)
    .await
    .context("append_location_log failed")?;
    Ok(())
}

/// Breadcrumb points for a request between two instants, in append order.
pub async fn list_location_points(
    pool: &PgPool,
    request_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<GeoPoint>> {
    let rows = sqlx::query(
        r#"
        select point
        from location_logs
        where request_id = $1
          and created_at_utc >= $2
          and created_at_utc <= $3
        order by log_id asc
        "#,
    )
    .bind(request_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
    .context("list_location_points failed")?;

    rows.iter()
        .map(|row| point_from_json(&row.try_get::<Value, _>("point")?))
        .collect()
}

// ---------------------------------------------------------------------------
// Feedback and fines
// ---------------------------------------------------------------------------

/// Insert the unique feedback row. Returns false if feedback already exists
/// (primary-key conflict swallowed; feedback is write-once).
pub async fn insert_feedback(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    responder_id: Uuid,
    is_prank: bool,
    rating: Option<i32>,
    comments: Option<&str>,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into request_feedback (request_id, responder_id, is_prank, rating, comments)
        values ($1, $2, $3, $4, $5)
        on conflict (request_id) do nothing
        returning request_id
        "#,
    )
    .bind(request_id)
    .bind(responder_id)
    .bind(is_prank)
    .bind(rating)
    .bind(comments)
    .fetch_optional(&mut **tx)
    .await
    .context("insert_feedback failed")?;
    Ok(row.is_some())
}

#[derive(Debug, Clone)]
pub struct FineRow {
    pub fine_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub reason: String,
    pub paid: bool,
    pub paid_at_utc: Option<DateTime<Utc>>,
    pub created_at_utc: DateTime<Utc>,
}

fn map_fine(row: &sqlx::postgres::PgRow) -> Result<FineRow> {
    Ok(FineRow {
        fine_id: row.try_get("fine_id")?,
        user_id: row.try_get("user_id")?,
        amount_cents: row.try_get("amount_cents")?,
        reason: row.try_get("reason")?,
        paid: row.try_get("paid")?,
        paid_at_utc: row.try_get("paid_at_utc")?,
        created_at_utc: row.try_get("created_at_utc")?,
    })
}

pub async fn insert_fine(
    tx: &mut Transaction<'_, Postgres>,
    fine_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into user_fines (fine_id, user_id, amount_cents, reason)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(fine_id)
    .bind(user_id)
    .bind(amount_cents)
    .bind(reason)
    .execute(&mut **tx)
    .await
    .context("insert_fine failed")?;
    Ok(())
}

pub async fn fetch_fine(pool: &PgPool, fine_id: Uuid) -> Result<Option<FineRow>> {
    let row = sqlx::query(
        r#"
        select fine_id, user_id, amount_cents, reason, paid, paid_at_utc, created_at_utc
        from user_fines
        where fine_id = $1
        "#,
    )
    .bind(fine_id)
    .fetch_optional(pool)
    .await
    .context("fetch_fine failed")?;
    row.as_ref().map(map_fine).transpose()
}

/// Mark a fine paid. Guarded: returns false if already paid.
pub async fn mark_fine_paid(
    tx: &mut Transaction<'_, Postgres>,
    fine_id: Uuid,
    paid_at: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update user_fines
        set paid = true,
            paid_at_utc = $2
        where fine_id = $1
          and not paid
        returning fine_id
        "#,
    )
    .bind(fine_id)
    .bind(paid_at)
    .fetch_optional(&mut **tx)
    .await
    .context("mark_fine_paid failed")?;
    Ok(row.is_some())
}

pub async fn count_unpaid_fines(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from user_fines where user_id = $1 and not paid",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await
    .context("count_unpaid_fines failed")?;
    Ok(n)
}

/// Pranks flagged against this user's requests inside the rolling window.
pub async fn count_recent_pranks(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from request_feedback f
        join panic_requests r on r.request_id = f.request_id
        where r.requester_user_id = $1
          and f.is_prank
          and f.created_at_utc > $2
        "#,
    )
    .bind(user_id)
    .bind(now - window)
    .fetch_one(&mut **tx)
    .await
    .context("count_recent_pranks failed")?;
    Ok(n)
}
