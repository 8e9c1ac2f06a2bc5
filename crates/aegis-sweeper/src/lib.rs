//! Background scheduler: periodic idempotent sweeps.
//!
//! Each job is a plain async function (testable in isolation) plus a
//! spawned interval loop. Jobs tolerate overlap with live traffic: every
//! mutation re-checks state under a row-lock before acting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use aegis_config::Settings;
use aegis_db::subscriptions::{self, ProductRow};
use aegis_db::{groups, principals, requests, snapshot};
use aegis_dispatch::timeout::{
    find_silent_requests, sweep_allocation_timeouts, sweep_pending_timeouts,
};
use aegis_geo::CoverageSnapshot;
use aegis_realtime::{publish_request_event, SessionDirectory};
use aegis_types::{EnvelopeKind, RealtimeEnvelope};

/// Cache-warmed coverage world, replaced wholesale on each warm tick.
pub type SharedSnapshot = Arc<RwLock<CoverageSnapshot>>;

/// Cache-warmed active products across approved firms.
pub type SharedProducts = Arc<RwLock<Vec<ProductRow>>>;

/// Per-process dedupe of expiry notices: (group, bucket) pairs already
/// notified. Advisory: a restart may repeat a notice, never skip one.
#[derive(Default)]
pub struct NoticeLedger {
    sent: Mutex<HashSet<(Uuid, &'static str)>>,
}

impl NoticeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn first_time(&self, group_id: Uuid, bucket: &'static str) -> bool {
        self.sent.lock().expect("poisoned").insert((group_id, bucket))
    }
}

/// Spawn all four loops. Mirrors the daemon's heartbeat spawner: fire and
/// forget, errors logged per tick.
pub fn spawn_jobs(
    pool: PgPool,
    directory: Arc<SessionDirectory>,
    settings: Arc<Settings>,
    coverage: SharedSnapshot,
    products: SharedProducts,
) {
    let ledger = Arc::new(NoticeLedger::new());

    {
        let pool = pool.clone();
        let directory = Arc::clone(&directory);
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                if let Err(e) = run_expiry_notices(&pool, &directory, &ledger).await {
                    warn!("expiry-notice sweep failed: {e:#}");
                }
            }
        });
    }

    {
        let pool = pool.clone();
        let directory = Arc::clone(&directory);
        let settings = Arc::clone(&settings);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = run_request_timeouts(&pool, &directory, &settings).await {
                    warn!("timeout sweep failed: {e:#}");
                }
            }
        });
    }

    {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                if let Err(e) = run_cache_warm(&pool, &coverage, &products).await {
                    warn!("cache warm failed: {e:#}");
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = run_token_prune(&pool).await {
                warn!("token prune failed: {e:#}");
            }
        }
    });
}

/// T-7d / T-3d / T-1d / T-0 expiry notices to group members.
pub async fn run_expiry_notices(
    pool: &PgPool,
    directory: &SessionDirectory,
    ledger: &NoticeLedger,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let horizon = now + chrono::Duration::days(7);

    for group in subscriptions::list_groups_expiring_before(pool, horizon).await? {
        let remaining = group.subscription_expires_at - now;
        let bucket = if remaining <= chrono::Duration::zero() {
            "expired"
        } else if remaining <= chrono::Duration::days(1) {
            "1d"
        } else if remaining <= chrono::Duration::days(3) {
            "3d"
        } else {
            "7d"
        };
        if !ledger.first_time(group.group_id, bucket) {
            continue;
        }

        let members = groups::list_group_member_ids(pool, group.group_id).await?;
        let envelope = RealtimeEnvelope {
            kind: EnvelopeKind::SubscriptionExpiry,
            request_id: None,
            payload: json!({
                "group_id": group.group_id,
                "expires_at": group.subscription_expires_at,
                "bucket": bucket,
            }),
            ts: now,
        };
        directory.send_to(&members, &envelope);
        info!(group_id = %group.group_id, bucket, "expiry notice sent");
    }
    Ok(())
}

/// Pending/allocated timeouts plus the silence alert.
pub async fn run_request_timeouts(
    pool: &PgPool,
    directory: &SessionDirectory,
    settings: &Settings,
) -> anyhow::Result<()> {
    for request_id in sweep_pending_timeouts(pool, &settings.dispatch).await? {
        if let Some(req) = requests::fetch_request(pool, request_id).await? {
            publish_request_event(
                pool,
                directory,
                &req,
                EnvelopeKind::Cancelled,
                json!({"reason": "no_allocation"}),
            )
            .await;
        }
    }

    for request_id in sweep_allocation_timeouts(pool, &settings.dispatch).await? {
        if let Some(req) = requests::fetch_request(pool, request_id).await? {
            publish_request_event(
                pool,
                directory,
                &req,
                EnvelopeKind::RequestStatusUpdate,
                json!({"status": "pending", "needs_reallocation": true}),
            )
            .await;
        }
    }

    for req in find_silent_requests(pool, &settings.dispatch).await? {
        let Some(firm_id) =
            aegis_ledger::subscription_firm_for_group(pool, req.group_id).await?
        else {
            continue;
        };
        let supervisors = principals::list_firm_supervisors(pool, firm_id).await?;
        let envelope = RealtimeEnvelope::new(
            EnvelopeKind::RequestStatusUpdate,
            req.request_id,
            json!({
                "status": req.status,
                "alert": "no responder activity for 30 minutes",
            }),
        );
        directory.send_to(&supervisors, &envelope);
        warn!(request_id = %req.request_id, "silent request; supervisors alerted");
    }
    Ok(())
}

/// Reload the coverage snapshot and the active-product list.
pub async fn run_cache_warm(
    pool: &PgPool,
    coverage: &SharedSnapshot,
    products: &SharedProducts,
) -> anyhow::Result<()> {
    let fresh = snapshot::load_coverage_snapshot(pool).await?;
    let fresh_products = subscriptions::list_active_products(pool).await?;
    info!(
        firms = fresh.firms.len(),
        areas = fresh.areas.len(),
        providers = fresh.providers.len(),
        products = fresh_products.len(),
        "caches warmed"
    );
    *coverage.write().await = fresh;
    *products.write().await = fresh_products;
    Ok(())
}

/// Drop revocation rows whose tokens have expired anyway.
pub async fn run_token_prune(pool: &PgPool) -> anyhow::Result<()> {
    let pruned = principals::prune_revoked_tokens(pool, Utc::now()).await?;
    if pruned > 0 {
        info!(pruned, "revoked tokens pruned");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_ledger_dedupes_per_bucket() {
        let ledger = NoticeLedger::new();
        let g = Uuid::new_v4();
        assert!(ledger.first_time(g, "7d"));
        assert!(!ledger.first_time(g, "7d"));
        assert!(ledger.first_time(g, "3d"));
        assert!(ledger.first_time(Uuid::new_v4(), "7d"));
    }
}
