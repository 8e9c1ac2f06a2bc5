//! Coverage-snapshot loader.
//!
//! Builds the in-process world `aegis-geo` evaluates against: approved
//! firms with the service types they can field, their active polygons, and
//! their active providers. The sweeper re-runs this on its cache-warm tick;
//! callers on the hot path read the latest snapshot, never the tables.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use aegis_geo::{AreaEntry, CoverageSnapshot, FirmEntry, ProviderEntry};
use aegis_types::{ProviderStatus, ServiceType};

use crate::jsonpoint::{point_from_json, ring_from_json};

pub async fn load_coverage_snapshot(pool: &PgPool) -> Result<CoverageSnapshot> {
    // Approved firms with the service types their active providers cover.
    // A firm with any team additionally fields 'security' and 'call'.
    let firm_rows = sqlx::query(
        r#"
        select f.firm_id,
               coalesce(
                   (select array_agg(distinct pt.service_type)
                    from providers p
                    join provider_types pt on pt.provider_type_id = p.provider_type_id
                    where p.firm_id = f.firm_id and p.active and pt.active),
                   '{}'
               ) as provider_services,
               exists (select 1 from teams t where t.firm_id = f.firm_id) as has_team
        from security_firms f
        where f.verification_status = 'approved'
          and not f.locked
        "#,
    )
    .fetch_all(pool)
    .await
    .context("snapshot firm query failed")?;

    let mut firms = Vec::with_capacity(firm_rows.len());
    for row in &firm_rows {
        let firm_id: Uuid = row.try_get("firm_id")?;
        let service_names: Vec<String> = row.try_get("provider_services")?;
        let has_team: bool = row.try_get("has_team")?;

        let mut services: Vec<ServiceType> = Vec::new();
        for name in &service_names {
            let st = ServiceType::parse(name)?;
            if !services.contains(&st) {
                services.push(st);
            }
        }
        if has_team {
            for st in [ServiceType::Security, ServiceType::Call] {
                if !services.contains(&st) {
                    services.push(st);
                }
            }
        }

        firms.push(FirmEntry {
            firm_id,
            approved: true,
            services,
        });
    }

    let area_rows = sqlx::query(
        r#"
        select a.area_id, a.firm_id, a.ring, a.active
        from coverage_areas a
        join security_firms f on f.firm_id = a.firm_id
        where f.verification_status = 'approved'
        "#,
    )
    .fetch_all(pool)
    .await
    .context("snapshot area query failed")?;

    let mut areas = Vec::with_capacity(area_rows.len());
    for row in &area_rows {
        areas.push(AreaEntry {
            area_id: row.try_get("area_id")?,
            firm_id: row.try_get("firm_id")?,
            ring: ring_from_json(&row.try_get::<Value, _>("ring")?)?,
            active: row.try_get("active")?,
        });
    }

    let provider_rows = sqlx::query(
        r#"
        select p.provider_id, p.firm_id, pt.code as provider_type, p.status,
               p.active, p.current_position, p.coverage_radius_km
        from providers p
        join provider_types pt on pt.provider_type_id = p.provider_type_id
        where pt.active
        "#,
    )
    .fetch_all(pool)
    .await
    .context("snapshot provider query failed")?;

    let mut providers = Vec::with_capacity(provider_rows.len());
    for row in &provider_rows {
        providers.push(ProviderEntry {
            provider_id: row.try_get("provider_id")?,
            firm_id: row.try_get("firm_id")?,
            provider_type: row.try_get("provider_type")?,
            status: ProviderStatus::parse(&row.try_get::<String, _>("status")?)?,
            active: row.try_get("active")?,
            current: point_from_json(&row.try_get::<Value, _>("current_position")?)?,
            coverage_radius_km: row.try_get("coverage_radius_km")?,
        });
    }

    Ok(CoverageSnapshot {
        firms,
        areas,
        providers,
    })
}
