//! Great-circle distance and the ETA estimate.

use aegis_types::GeoPoint;

/// Mean earth radius, km (WGS84).
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two WGS84 points, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Total path length of a breadcrumb trail: sum of consecutive-sample hops.
pub fn path_distance_km(samples: &[GeoPoint]) -> f64 {
    samples
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .sum()
}

/// ETA estimate in minutes, rounded up.
///
/// Piecewise average speed: ≤10 km at 40 km/h, ≤50 km at 60 km/h,
/// beyond that 80 km/h.
pub fn eta_minutes(distance_km: f64) -> u32 {
    let hours = if distance_km <= 10.0 {
        distance_km / 40.0
    } else if distance_km <= 50.0 {
        distance_km / 60.0
    } else {
        distance_km / 80.0
    };
    (hours * 60.0).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance() {
        let p = GeoPoint::new(28.047, -26.204);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn johannesburg_to_pretoria_is_about_55km() {
        // Sandton-ish to Pretoria-ish.
        let jhb = GeoPoint::new(28.0473, -26.2041);
        let pta = GeoPoint::new(28.1881, -25.7461);
        let d = haversine_km(jhb, pta);
        assert!((50.0..60.0).contains(&d), "got {d}");
    }

    #[test]
    fn eta_bands() {
        // 8 km at 40 km/h = 12 min exactly.
        assert_eq!(eta_minutes(8.0), 12);
        // 30 km at 60 km/h = 30 min.
        assert_eq!(eta_minutes(30.0), 30);
        // 80 km at 80 km/h = 60 min.
        assert_eq!(eta_minutes(80.0), 60);
        // Rounds up, never down.
        assert_eq!(eta_minutes(8.1), 13);
        assert_eq!(eta_minutes(0.0), 0);
    }

    #[test]
    fn path_distance_sums_hops() {
        let a = GeoPoint::new(28.0, -26.0);
        let b = GeoPoint::new(28.01, -26.0);
        let c = GeoPoint::new(28.02, -26.0);
        let total = path_distance_km(&[a, b, c]);
        let direct = haversine_km(a, c);
        assert!((total - direct).abs() < 0.01, "colinear hops should sum to the direct distance");
        assert_eq!(path_distance_km(&[a]), 0.0);
        assert_eq!(path_distance_km(&[]), 0.0);
    }
}
