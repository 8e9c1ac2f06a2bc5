//! User groups, memberships, and phone rosters.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use aegis_types::{GeoPoint, MembershipRole, PhoneKind};

use crate::jsonpoint::{point_from_json, point_to_json};

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub group_id: Uuid,
    pub name: String,
    pub address: String,
    pub point: GeoPoint,
    pub subscription_id: Option<Uuid>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
}

fn map_group(row: &sqlx::postgres::PgRow) -> Result<GroupRow> {
    Ok(GroupRow {
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        point: point_from_json(&row.try_get::<Value, _>("point")?)?,
        subscription_id: row.try_get("subscription_id")?,
        subscription_expires_at: row.try_get("subscription_expires_at")?,
    })
}

const GROUP_COLUMNS: &str = r#"
    group_id, name, address, point, subscription_id, subscription_expires_at
"#;

/// Create a group together with its owner membership. One transaction: a
/// group without an owner is never observable.
pub async fn insert_group_with_owner(
    pool: &PgPool,
    group_id: Uuid,
    name: &str,
    address: &str,
    point: GeoPoint,
    owner_id: Uuid,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin insert_group tx")?;

    sqlx::query(
        r#"
        insert into user_groups (group_id, name, address, point)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(group_id)
    .bind(name)
    .bind(address)
    .bind(point_to_json(point))
    .execute(&mut *tx)
    .await
    .context("insert_group failed")?;

    sqlx::query(
        r#"
        insert into group_memberships (group_id, user_id, role)
        values ($1, $2, 'owner')
        "#,
    )
    .bind(group_id)
    .bind(owner_id)
    .execute(&mut *tx)
    .await
    .context("insert owner membership failed")?;

    tx.commit().await.context("commit insert_group tx")?;
    Ok(())
}

pub async fn fetch_group(pool: &PgPool, group_id: Uuid) -> Result<Option<GroupRow>> {
    let row = sqlx::query(&format!(
        "select {GROUP_COLUMNS} from user_groups where group_id = $1"
    ))
    .bind(group_id)
    .fetch_optional(pool)
    .await
    .context("fetch_group failed")?;
    row.as_ref().map(map_group).transpose()
}

pub async fn fetch_group_for_update(
    tx: &mut Transaction<'_, Postgres>,
    group_id: Uuid,
) -> Result<Option<GroupRow>> {
    let row = sqlx::query(&format!(
        "select {GROUP_COLUMNS} from user_groups where group_id = $1 for update"
    ))
    .bind(group_id)
    .fetch_optional(&mut **tx)
    .await
    .context("fetch_group_for_update failed")?;
    row.as_ref().map(map_group).transpose()
}

pub async fn set_group_subscription(
    tx: &mut Transaction<'_, Postgres>,
    group_id: Uuid,
    subscription_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update user_groups
        set subscription_id = $2,
            subscription_expires_at = $3
        where group_id = $1
        "#,
    )
    .bind(group_id)
    .bind(subscription_id)
    .bind(expires_at)
    .execute(&mut **tx)
    .await
    .context("set_group_subscription failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Memberships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub role: MembershipRole,
    pub active: bool,
}

pub async fn insert_membership(
    pool: &PgPool,
    group_id: Uuid,
    user_id: Uuid,
    role: MembershipRole,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into group_memberships (group_id, user_id, role)
        values ($1, $2, $3)
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .bind(role.as_str())
    .execute(pool)
    .await
    .context("insert_membership failed")?;
    Ok(())
}

pub async fn fetch_membership(
    pool: &PgPool,
    group_id: Uuid,
    user_id: Uuid,
) -> Result<Option<MembershipRow>> {
    let row = sqlx::query(
        r#"
        select group_id, user_id, role, active
        from group_memberships
        where group_id = $1 and user_id = $2
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("fetch_membership failed")?;

    row.map(|row| {
        Ok(MembershipRow {
            group_id: row.try_get("group_id")?,
            user_id: row.try_get("user_id")?,
            role: MembershipRole::parse(&row.try_get::<String, _>("role")?)?,
            active: row.try_get("active")?,
        })
    })
    .transpose()
}

/// Owner-or-admin check used by subscription application.
pub async fn user_administers_group(pool: &PgPool, group_id: Uuid, user_id: Uuid) -> Result<bool> {
    let m = fetch_membership(pool, group_id, user_id).await?;
    Ok(matches!(
        m,
        Some(MembershipRow {
            active: true,
            role: MembershipRole::Owner | MembershipRole::Admin,
            ..
        })
    ))
}

/// The emergency-override resolver input: find the active membership whose
/// principal owns this phone, joined with the principal's standing flags.
#[derive(Debug, Clone)]
pub struct PhoneMembership {
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub role: MembershipRole,
    pub membership_active: bool,
    pub verified: bool,
    pub suspended: bool,
    pub banned: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

pub async fn fetch_phone_membership(
    pool: &PgPool,
    phone: &str,
    group_id: Uuid,
) -> Result<Option<PhoneMembership>> {
    let row = sqlx::query(
        r#"
        select p.principal_id as user_id,
               m.group_id,
               m.role,
               m.active as membership_active,
               p.verified,
               p.suspended,
               p.banned,
               p.locked_until
        from principals p
        join group_memberships m
          on m.user_id = p.principal_id
        where p.phone = $1
          and m.group_id = $2
        "#,
    )
    .bind(phone)
    .bind(group_id)
    .fetch_optional(pool)
    .await
    .context("fetch_phone_membership failed")?;

    row.map(|row| {
        Ok(PhoneMembership {
            user_id: row.try_get("user_id")?,
            group_id: row.try_get("group_id")?,
            role: MembershipRole::parse(&row.try_get::<String, _>("role")?)?,
            membership_active: row.try_get("membership_active")?,
            verified: row.try_get("verified")?,
            suspended: row.try_get("suspended")?,
            banned: row.try_get("banned")?,
            locked_until: row.try_get("locked_until")?,
        })
    })
    .transpose()
}

/// Active member principals of a group (for realtime routing).
pub async fn list_group_member_ids(pool: &PgPool, group_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "select user_id from group_memberships where group_id = $1 and active",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
    .context("list_group_member_ids failed")?;
    rows.iter()
        .map(|r| Ok(r.try_get::<Uuid, _>("user_id")?))
        .collect()
}

// ---------------------------------------------------------------------------
// Phone roster
// ---------------------------------------------------------------------------

/// Register a phone on a group's roster. The global unique index rejects a
/// phone already rostered anywhere; callers translate the violation.
pub async fn insert_group_phone(
    pool: &PgPool,
    phone_id: Uuid,
    group_id: Uuid,
    phone: &str,
    kind: PhoneKind,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into group_phone_numbers (phone_id, group_id, phone, kind)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(phone_id)
    .bind(group_id)
    .bind(phone)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_group_phones(pool: &PgPool, group_id: Uuid) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from group_phone_numbers where group_id = $1",
    )
    .bind(group_id)
    .fetch_one(pool)
    .await
    .context("count_group_phones failed")?;
    Ok(n)
}
