//! Audience resolution and the publish helper.

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use aegis_db::requests::PanicRequestRow;
use aegis_db::{firms, principals};
use aegis_ledger::subscription_firm_for_group;
use aegis_types::{EnvelopeKind, RealtimeEnvelope};

use crate::directory::SessionDirectory;
use crate::router::{recipients_for, RequestAudience};

/// Load the request's audience: requester, assigned-team participants,
/// office staff of the subscribed firm, and any watching admins.
pub async fn resolve_audience(
    pool: &PgPool,
    directory: &SessionDirectory,
    req: &PanicRequestRow,
) -> Result<RequestAudience> {
    let team_participants = match req.assigned_team_id {
        Some(team_id) => firms::list_team_participants(pool, team_id).await?,
        None => Vec::new(),
    };

    let (office_staff, watching_admins) =
        match subscription_firm_for_group(pool, req.group_id).await? {
            Some(firm_id) => (
                principals::list_firm_office_staff(pool, firm_id).await?,
                directory.admins_watching(firm_id),
            ),
            None => (Vec::new(), Vec::new()),
        };

    Ok(RequestAudience {
        requester: req.requester_user_id,
        team_participants,
        office_staff,
        watching_admins,
    })
}

/// Resolve the audience and push one envelope. Failures to enumerate the
/// audience are logged, never surfaced: fan-out is best-effort by
/// contract.
pub async fn publish_request_event(
    pool: &PgPool,
    directory: &SessionDirectory,
    req: &PanicRequestRow,
    kind: EnvelopeKind,
    payload: Value,
) {
    let envelope = RealtimeEnvelope::new(kind, req.request_id, payload);
    match resolve_audience(pool, directory, req).await {
        Ok(audience) => {
            let recipients = recipients_for(&audience, kind);
            debug!(request_id = %req.request_id, ?kind, n = recipients.len(), "fan-out");
            directory.send_to(&recipients, &envelope);
        }
        Err(e) => {
            tracing::warn!(request_id = %req.request_id, "audience resolution failed: {e:#}");
        }
    }
}
