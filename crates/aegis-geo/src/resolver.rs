//! The two resolver queries over a loaded coverage snapshot.
//!
//! Inactive polygons, providers, and unapproved firms are invisible to both
//! queries. A firm appears at most once in `covering_firms` even when
//! several of its polygons cover the point.

use aegis_types::{GeoPoint, ProviderStatus, ServiceType};
use uuid::Uuid;

use crate::distance::{eta_minutes, haversine_km};
use crate::polygon::ring_contains;

/// A firm as the resolver sees it: approval plus the service types it can
/// actually field (pre-joined from its providers and teams).
#[derive(Debug, Clone)]
pub struct FirmEntry {
    pub firm_id: Uuid,
    pub approved: bool,
    pub services: Vec<ServiceType>,
}

/// An active-or-not coverage polygon, ring already validated at insert.
#[derive(Debug, Clone)]
pub struct AreaEntry {
    pub area_id: Uuid,
    pub firm_id: Uuid,
    pub ring: Vec<GeoPoint>,
    pub active: bool,
}

/// A dispatchable unit.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub provider_id: Uuid,
    pub firm_id: Uuid,
    pub provider_type: String,
    pub status: ProviderStatus,
    pub active: bool,
    pub current: GeoPoint,
    pub coverage_radius_km: f64,
}

/// The cache-warmed world the resolver evaluates against.
#[derive(Debug, Clone, Default)]
pub struct CoverageSnapshot {
    pub firms: Vec<FirmEntry>,
    pub areas: Vec<AreaEntry>,
    pub providers: Vec<ProviderEntry>,
}

/// Firms with at least one active polygon containing `point`, approved, and
/// offering `service`. Order follows snapshot order; each firm once.
pub fn covering_firms(
    snapshot: &CoverageSnapshot,
    point: GeoPoint,
    service: ServiceType,
) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = Vec::new();
    for firm in &snapshot.firms {
        if !firm.approved || !firm.services.contains(&service) {
            continue;
        }
        let covered = snapshot
            .areas
            .iter()
            .any(|a| a.active && a.firm_id == firm.firm_id && ring_contains(&a.ring, point));
        if covered && !out.contains(&firm.firm_id) {
            out.push(firm.firm_id);
        }
    }
    out
}

/// Does `firm_id` have any active polygon containing `point`?
pub fn firm_covers_point(snapshot: &CoverageSnapshot, firm_id: Uuid, point: GeoPoint) -> bool {
    snapshot
        .areas
        .iter()
        .any(|a| a.active && a.firm_id == firm_id && ring_contains(&a.ring, point))
}

#[derive(Debug, Clone)]
pub struct RankedProvider {
    pub provider_id: Uuid,
    pub firm_id: Uuid,
    pub distance_km: f64,
    pub eta_minutes: u32,
}

/// Available, active providers of `provider_type` whose coverage radius
/// reaches `point`, ranked ascending by great-circle distance.
pub fn nearest_providers(
    snapshot: &CoverageSnapshot,
    point: GeoPoint,
    provider_type: &str,
    radius_km: f64,
    limit: usize,
) -> Vec<RankedProvider> {
    let mut ranked: Vec<RankedProvider> = snapshot
        .providers
        .iter()
        .filter(|p| p.active && p.status == ProviderStatus::Available)
        .filter(|p| p.provider_type == provider_type)
        .filter_map(|p| {
            let d = haversine_km(p.current, point);
            // The provider must reach the point, and the point must sit
            // inside the caller's search radius.
            if d <= p.coverage_radius_km && d <= radius_km {
                Some(RankedProvider {
                    provider_id: p.provider_id,
                    firm_id: p.firm_id,
                    distance_km: d,
                    eta_minutes: eta_minutes(d),
                })
            } else {
                None
            }
        })
        .collect();

    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polygon::validate_ring;
    use aegis_types::GeoPoint;

    fn jhb_square() -> Vec<GeoPoint> {
        validate_ring(&[
            GeoPoint::new(28.0, -26.3),
            GeoPoint::new(28.1, -26.3),
            GeoPoint::new(28.1, -26.1),
            GeoPoint::new(28.0, -26.1),
        ])
        .unwrap()
    }

    fn snapshot_one_firm(firm_id: Uuid, approved: bool, area_active: bool) -> CoverageSnapshot {
        CoverageSnapshot {
            firms: vec![FirmEntry {
                firm_id,
                approved,
                services: vec![ServiceType::Security, ServiceType::Ambulance],
            }],
            areas: vec![AreaEntry {
                area_id: Uuid::new_v4(),
                firm_id,
                ring: jhb_square(),
                active: area_active,
            }],
            providers: vec![],
        }
    }

    #[test]
    fn approved_firm_with_active_area_covers() {
        let firm = Uuid::new_v4();
        let snap = snapshot_one_firm(firm, true, true);
        let point = GeoPoint::new(28.047, -26.204);
        assert_eq!(covering_firms(&snap, point, ServiceType::Security), vec![firm]);
    }

    #[test]
    fn unapproved_or_inactive_is_invisible() {
        let firm = Uuid::new_v4();
        let point = GeoPoint::new(28.047, -26.204);
        assert!(covering_firms(&snapshot_one_firm(firm, false, true), point, ServiceType::Security)
            .is_empty());
        assert!(covering_firms(&snapshot_one_firm(firm, true, false), point, ServiceType::Security)
            .is_empty());
    }

    #[test]
    fn unoffered_service_excluded() {
        let firm = Uuid::new_v4();
        let snap = snapshot_one_firm(firm, true, true);
        let point = GeoPoint::new(28.047, -26.204);
        assert!(covering_firms(&snap, point, ServiceType::Towing).is_empty());
    }

    #[test]
    fn firm_listed_once_despite_overlapping_polygons() {
        let firm = Uuid::new_v4();
        let mut snap = snapshot_one_firm(firm, true, true);
        snap.areas.push(AreaEntry {
            area_id: Uuid::new_v4(),
            firm_id: firm,
            ring: jhb_square(),
            active: true,
        });
        let point = GeoPoint::new(28.047, -26.204);
        assert_eq!(covering_firms(&snap, point, ServiceType::Security).len(), 1);
    }

    fn provider(
        firm_id: Uuid,
        lon: f64,
        lat: f64,
        status: ProviderStatus,
        radius: f64,
    ) -> ProviderEntry {
        ProviderEntry {
            provider_id: Uuid::new_v4(),
            firm_id,
            provider_type: "ambulance".to_string(),
            status,
            active: true,
            current: GeoPoint::new(lon, lat),
            coverage_radius_km: radius,
        }
    }

    #[test]
    fn nearest_providers_ranks_by_distance() {
        let firm = Uuid::new_v4();
        let near = provider(firm, 28.05, -26.21, ProviderStatus::Available, 50.0);
        let far = provider(firm, 28.50, -26.50, ProviderStatus::Available, 100.0);
        let busy = provider(firm, 28.048, -26.205, ProviderStatus::Busy, 50.0);
        let snap = CoverageSnapshot {
            firms: vec![],
            areas: vec![],
            providers: vec![far.clone(), near.clone(), busy],
        };

        let point = GeoPoint::new(28.047, -26.204);
        let ranked = nearest_providers(&snap, point, "ambulance", 200.0, 10);
        assert_eq!(ranked.len(), 2, "busy provider is invisible");
        assert_eq!(ranked[0].provider_id, near.provider_id);
        assert_eq!(ranked[1].provider_id, far.provider_id);
        assert!(ranked[0].distance_km < ranked[1].distance_km);
        assert!(ranked[0].eta_minutes <= ranked[1].eta_minutes);
    }

    #[test]
    fn provider_radius_must_reach_the_point() {
        let firm = Uuid::new_v4();
        let short_reach = provider(firm, 28.50, -26.50, ProviderStatus::Available, 10.0);
        let snap = CoverageSnapshot {
            firms: vec![],
            areas: vec![],
            providers: vec![short_reach],
        };
        let point = GeoPoint::new(28.047, -26.204);
        assert!(nearest_providers(&snap, point, "ambulance", 200.0, 10).is_empty());
    }

    #[test]
    fn limit_truncates() {
        let firm = Uuid::new_v4();
        let providers = (0..5)
            .map(|i| provider(firm, 28.05 + i as f64 * 0.01, -26.21, ProviderStatus::Available, 100.0))
            .collect();
        let snap = CoverageSnapshot {
            firms: vec![],
            areas: vec![],
            providers,
        };
        let point = GeoPoint::new(28.047, -26.204);
        assert_eq!(nearest_providers(&snap, point, "ambulance", 200.0, 3).len(), 3);
    }
}
