//! Ring normalisation, validation, and containment.
//!
//! Coverage polygons arrive as closed rings of `[lon, lat]` vertices.
//! Auto-closure is a normalising step, not a rejection: an unclosed ring
//! gets its first vertex appended. Rejection is reserved for rings with
//! fewer than three distinct vertices or self-intersections.

use aegis_types::GeoPoint;
use geo::{Contains, Coord, LineString, Point, Polygon};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PolygonError {
    #[error("ring has fewer than three distinct vertices")]
    TooFewVertices,
    #[error("ring is self-intersecting")]
    SelfIntersecting,
    #[error("vertex {index} is outside WGS84 bounds")]
    OutOfBounds { index: usize },
}

/// Auto-close a ring: if the last vertex differs from the first, append the
/// first. Idempotent.
pub fn normalize_ring(ring: &[GeoPoint]) -> Vec<GeoPoint> {
    let mut out = ring.to_vec();
    if let (Some(first), Some(last)) = (out.first().copied(), out.last().copied()) {
        if first != last {
            out.push(first);
        }
    }
    out
}

/// Validate a ring (after normalisation). Checks, in order:
/// 1. every vertex inside WGS84 bounds;
/// 2. at least three distinct vertices;
/// 3. no two non-adjacent edges cross.
///
/// Returns the normalised (closed) ring on success.
pub fn validate_ring(ring: &[GeoPoint]) -> Result<Vec<GeoPoint>, PolygonError> {
    for (i, p) in ring.iter().enumerate() {
        if !(-180.0..=180.0).contains(&p.lon) || !(-90.0..=90.0).contains(&p.lat) {
            return Err(PolygonError::OutOfBounds { index: i });
        }
    }

    let closed = normalize_ring(ring);

    let mut distinct: Vec<GeoPoint> = Vec::new();
    for p in &closed[..closed.len().saturating_sub(1)] {
        if !distinct.iter().any(|q| q == p) {
            distinct.push(*p);
        }
    }
    if distinct.len() < 3 {
        return Err(PolygonError::TooFewVertices);
    }

    // Edge-pair crossing test. Adjacent edges share a vertex and are skipped;
    // the closing edge is adjacent to the first.
    let n = closed.len() - 1; // number of edges
    for i in 0..n {
        for j in (i + 1)..n {
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (a1, a2) = (closed[i], closed[i + 1]);
            let (b1, b2) = (closed[j], closed[j + 1]);
            if segments_cross(a1, a2, b1, b2) {
                return Err(PolygonError::SelfIntersecting);
            }
        }
    }

    Ok(closed)
}

/// Proper-crossing test on the lon/lat plane. Shared endpoints between
/// non-adjacent edges count as a crossing (a pinched ring is invalid).
fn segments_cross(a1: GeoPoint, a2: GeoPoint, b1: GeoPoint, b2: GeoPoint) -> bool {
    fn orient(p: GeoPoint, q: GeoPoint, r: GeoPoint) -> f64 {
        (q.lon - p.lon) * (r.lat - p.lat) - (q.lat - p.lat) * (r.lon - p.lon)
    }
    fn on_segment(p: GeoPoint, q: GeoPoint, r: GeoPoint) -> bool {
        r.lon >= p.lon.min(q.lon)
            && r.lon <= p.lon.max(q.lon)
            && r.lat >= p.lat.min(q.lat)
            && r.lat <= p.lat.max(q.lat)
    }

    let d1 = orient(b1, b2, a1);
    let d2 = orient(b1, b2, a2);
    let d3 = orient(a1, a2, b1);
    let d4 = orient(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(b1, b2, a1))
        || (d2 == 0.0 && on_segment(b1, b2, a2))
        || (d3 == 0.0 && on_segment(a1, a2, b1))
        || (d4 == 0.0 && on_segment(a1, a2, b2))
}

/// Point-in-polygon over a validated ring.
pub fn ring_contains(ring: &[GeoPoint], point: GeoPoint) -> bool {
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|p| Coord { x: p.lon, y: p.lat })
        .collect();
    let poly = Polygon::new(LineString::from(coords), vec![]);
    poly.contains(&Point::new(point.lon, point.lat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(28.0, -26.3),
            GeoPoint::new(28.1, -26.3),
            GeoPoint::new(28.1, -26.1),
            GeoPoint::new(28.0, -26.1),
        ]
    }

    #[test]
    fn unclosed_ring_is_auto_closed() {
        let closed = validate_ring(&square()).unwrap();
        assert_eq!(closed.len(), 5);
        assert_eq!(closed.first(), closed.last());
        // Idempotent: validating the closed ring changes nothing.
        assert_eq!(validate_ring(&closed).unwrap(), closed);
    }

    #[test]
    fn too_few_distinct_vertices_rejected() {
        let degenerate = vec![
            GeoPoint::new(28.0, -26.0),
            GeoPoint::new(28.0, -26.0),
            GeoPoint::new(28.1, -26.1),
        ];
        assert_eq!(
            validate_ring(&degenerate).unwrap_err(),
            PolygonError::TooFewVertices
        );
    }

    #[test]
    fn bowtie_rejected() {
        let bowtie = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
            GeoPoint::new(0.0, 1.0),
        ];
        assert_eq!(
            validate_ring(&bowtie).unwrap_err(),
            PolygonError::SelfIntersecting
        );
    }

    #[test]
    fn out_of_bounds_vertex_rejected() {
        let bad = vec![
            GeoPoint::new(200.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ];
        assert_eq!(
            validate_ring(&bad).unwrap_err(),
            PolygonError::OutOfBounds { index: 0 }
        );
    }

    #[test]
    fn containment_inside_and_outside() {
        let ring = validate_ring(&square()).unwrap();
        assert!(ring_contains(&ring, GeoPoint::new(28.05, -26.2)));
        assert!(!ring_contains(&ring, GeoPoint::new(0.0, 0.0)));
        assert!(!ring_contains(&ring, GeoPoint::new(28.2, -26.2)));
    }
}
