//! Subscription products and stored entitlements.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProductRow {
    pub product_id: Uuid,
    pub firm_id: Uuid,
    pub name: String,
    pub max_users: i32,
    pub price_cents: i64,
    pub credit_cost: i64,
    pub active: bool,
}

fn map_product(row: &sqlx::postgres::PgRow) -> Result<ProductRow> {
    Ok(ProductRow {
        product_id: row.try_get("product_id")?,
        firm_id: row.try_get("firm_id")?,
        name: row.try_get("name")?,
        max_users: row.try_get("max_users")?,
        price_cents: row.try_get("price_cents")?,
        credit_cost: row.try_get("credit_cost")?,
        active: row.try_get("active")?,
    })
}

const PRODUCT_COLUMNS: &str = r#"
    product_id, firm_id, name, max_users, price_cents, credit_cost, active
"#;

pub async fn insert_product(pool: &PgPool, p: &ProductRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into subscription_products
            (product_id, firm_id, name, max_users, price_cents, credit_cost, active)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(p.product_id)
    .bind(p.firm_id)
    .bind(&p.name)
    .bind(p.max_users)
    .bind(p.price_cents)
    .bind(p.credit_cost)
    .bind(p.active)
    .execute(pool)
    .await
    .context("insert_product failed")?;
    Ok(())
}

pub async fn fetch_product(pool: &PgPool, product_id: Uuid) -> Result<Option<ProductRow>> {
    let row = sqlx::query(&format!(
        "select {PRODUCT_COLUMNS} from subscription_products where product_id = $1"
    ))
    .bind(product_id)
    .fetch_optional(pool)
    .await
    .context("fetch_product failed")?;
    row.as_ref().map(map_product).transpose()
}

pub async fn set_product_active(pool: &PgPool, product_id: Uuid, active: bool) -> Result<()> {
    sqlx::query("update subscription_products set active = $2 where product_id = $1")
        .bind(product_id)
        .bind(active)
        .execute(pool)
        .await
        .context("set_product_active failed")?;
    Ok(())
}

/// Delete a product only if no stored subscription ever referenced it.
/// Returns false when the guard blocks the delete.
pub async fn delete_product_if_unreferenced(pool: &PgPool, product_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        delete from subscription_products
        where product_id = $1
          and not exists (
              select 1 from stored_subscriptions where product_id = $1
          )
        returning product_id
        "#,
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await
    .context("delete_product_if_unreferenced failed")?;
    Ok(row.is_some())
}

pub async fn list_active_products_for_firm(
    pool: &PgPool,
    firm_id: Uuid,
) -> Result<Vec<ProductRow>> {
    let rows = sqlx::query(&format!(
        "select {PRODUCT_COLUMNS} from subscription_products where firm_id = $1 and active"
    ))
    .bind(firm_id)
    .fetch_all(pool)
    .await
    .context("list_active_products_for_firm failed")?;
    rows.iter().map(map_product).collect()
}

/// Active products of approved firms (cache-warm source).
pub async fn list_active_products(pool: &PgPool) -> Result<Vec<ProductRow>> {
    let rows = sqlx::query(
        r#"
        select p.product_id, p.firm_id, p.name, p.max_users, p.price_cents,
               p.credit_cost, p.active
        from subscription_products p
        join security_firms f on f.firm_id = p.firm_id
        where p.active
          and f.verification_status = 'approved'
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_active_products failed")?;
    rows.iter().map(map_product).collect()
}

// ---------------------------------------------------------------------------
// Stored subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredSubscriptionRow {
    pub stored_subscription_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub applied: bool,
    pub applied_to_group: Option<Uuid>,
    pub purchased_at_utc: DateTime<Utc>,
    pub applied_at_utc: Option<DateTime<Utc>>,
}

fn map_stored(row: &sqlx::postgres::PgRow) -> Result<StoredSubscriptionRow> {
    Ok(StoredSubscriptionRow {
        stored_subscription_id: row.try_get("stored_subscription_id")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        applied: row.try_get("applied")?,
        applied_to_group: row.try_get("applied_to_group")?,
        purchased_at_utc: row.try_get("purchased_at_utc")?,
        applied_at_utc: row.try_get("applied_at_utc")?,
    })
}

const STORED_COLUMNS: &str = r#"
    stored_subscription_id, user_id, product_id, applied, applied_to_group,
    purchased_at_utc, applied_at_utc
"#;

pub async fn insert_stored_subscription(
    pool: &PgPool,
    stored_subscription_id: Uuid,
    user_id: Uuid,
    product_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into stored_subscriptions (stored_subscription_id, user_id, product_id)
        values ($1, $2, $3)
        "#,
    )
    .bind(stored_subscription_id)
    .bind(user_id)
    .bind(product_id)
    .execute(pool)
    .await
    .context("insert_stored_subscription failed")?;
    Ok(())
}

pub async fn fetch_stored_subscription(
    pool: &PgPool,
    stored_subscription_id: Uuid,
) -> Result<Option<StoredSubscriptionRow>> {
    let row = sqlx::query(&format!(
        "select {STORED_COLUMNS} from stored_subscriptions where stored_subscription_id = $1"
    ))
    .bind(stored_subscription_id)
    .fetch_optional(pool)
    .await
    .context("fetch_stored_subscription failed")?;
    row.as_ref().map(map_stored).transpose()
}

/// Row-locked fetch: concurrent applies of the same entitlement serialise
/// here.
pub async fn fetch_stored_subscription_for_update(
    tx: &mut Transaction<'_, Postgres>,
    stored_subscription_id: Uuid,
) -> Result<Option<StoredSubscriptionRow>> {
    let row = sqlx::query(&format!(
        "select {STORED_COLUMNS} from stored_subscriptions \
         where stored_subscription_id = $1 for update"
    ))
    .bind(stored_subscription_id)
    .fetch_optional(&mut **tx)
    .await
    .context("fetch_stored_subscription_for_update failed")?;
    row.as_ref().map(map_stored).transpose()
}

/// Flip applied=false → true, binding the group edge. Guarded: returns
/// false if the row was already applied (the edge is immutable).
pub async fn mark_stored_subscription_applied(
    tx: &mut Transaction<'_, Postgres>,
    stored_subscription_id: Uuid,
    group_id: Uuid,
    applied_at: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update stored_subscriptions
        set applied = true,
            applied_to_group = $2,
            applied_at_utc = $3
        where stored_subscription_id = $1
          and applied = false
        returning stored_subscription_id
        "#,
    )
    .bind(stored_subscription_id)
    .bind(group_id)
    .bind(applied_at)
    .fetch_optional(&mut **tx)
    .await
    .context("mark_stored_subscription_applied failed")?;
    Ok(row.is_some())
}

/// Groups whose subscription expires inside the window, for the sweeper's
/// expiry notices.
#[derive(Debug, Clone)]
pub struct ExpiringGroup {
    pub group_id: Uuid,
    pub subscription_expires_at: DateTime<Utc>,
}

pub async fn list_groups_expiring_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ExpiringGroup>> {
    let rows = sqlx::query(
        r#"
        select group_id, subscription_expires_at
        from user_groups
        where subscription_expires_at is not null
          and subscription_expires_at <= $1
        order by subscription_expires_at asc
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("list_groups_expiring_before failed")?;

    rows.iter()
        .map(|row| {
            Ok(ExpiringGroup {
                group_id: row.try_get("group_id")?,
                subscription_expires_at: row.try_get("subscription_expires_at")?,
            })
        })
        .collect()
}
