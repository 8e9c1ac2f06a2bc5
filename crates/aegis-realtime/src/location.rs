//! Location-log ingest and distance accumulation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use aegis_db::requests;
use aegis_geo::path_distance_km;
use aegis_types::{ApiError, EnvelopeKind, ErrorCode, GeoPoint, LocationSource};

use crate::audience::publish_request_event;
use crate::directory::SessionDirectory;

#[derive(Debug, Clone)]
pub struct LocationIngest {
    pub request_id: Uuid,
    pub point: GeoPoint,
    pub accuracy_m: Option<f64>,
    pub source: LocationSource,
    /// Also move the request's primary point to this sample.
    pub update_primary: bool,
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("location storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

/// Append a breadcrumb, optionally promote it to the request's primary
/// point, and broadcast a `location_update`. Terminal requests refuse new
/// samples.
pub async fn ingest_location(
    pool: &PgPool,
    directory: &SessionDirectory,
    user_id: Uuid,
    ingest: &LocationIngest,
) -> Result<(), ApiError> {
    if !(-180.0..=180.0).contains(&ingest.point.lon)
        || !(-90.0..=90.0).contains(&ingest.point.lat)
    {
        return Err(ApiError::new(
            ErrorCode::InvalidCoordinates,
            "point is outside WGS84 bounds",
        ));
    }

    let req = requests::fetch_request(pool, ingest.request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;
    if req.status.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::ReqExpired,
            "request is already settled",
        ));
    }

    requests::append_location_log(
        pool,
        ingest.request_id,
        user_id,
        ingest.point,
        ingest.accuracy_m,
        ingest.source,
    )
    .await
    .map_err(internal)?;

    if ingest.update_primary {
        requests::update_request_point(pool, ingest.request_id, ingest.point)
            .await
            .map_err(internal)?;
    }

    publish_request_event(
        pool,
        directory,
        &req,
        EnvelopeKind::LocationUpdate,
        json!({
            "point": { "lon": ingest.point.lon, "lat": ingest.point.lat },
            "accuracy_m": ingest.accuracy_m,
            "source": ingest.source,
        }),
    )
    .await;

    Ok(())
}

/// Total distance travelled on a request between two instants: the sum of
/// consecutive-sample great-circle hops.
pub async fn total_distance_km(
    pool: &PgPool,
    request_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<f64, ApiError> {
    let points = requests::list_location_points(pool, request_id, from, to)
        .await
        .map_err(internal)?;
    Ok(path_distance_km(&points))
}
