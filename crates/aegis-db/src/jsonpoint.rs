//! JSONB encodings for points and rings.
//!
//! Points persist as `{"lon": .., "lat": ..}`; rings as `[[lon,lat], ...]`.
//! Rings are validated by `aegis-geo` before they reach an insert, so a
//! malformed ring coming back out of the store is a data-corruption error,
//! not a user error.

use aegis_types::GeoPoint;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};

pub fn point_to_json(p: GeoPoint) -> Value {
    json!({"lon": p.lon, "lat": p.lat})
}

pub fn point_from_json(v: &Value) -> Result<GeoPoint> {
    let lon = v
        .get("lon")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("point missing lon: {v}"))?;
    let lat = v
        .get("lat")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("point missing lat: {v}"))?;
    Ok(GeoPoint::new(lon, lat))
}

pub fn ring_to_json(ring: &[GeoPoint]) -> Value {
    Value::Array(ring.iter().map(|p| json!([p.lon, p.lat])).collect())
}

pub fn ring_from_json(v: &Value) -> Result<Vec<GeoPoint>> {
    let arr = v
        .as_array()
        .ok_or_else(|| anyhow!("ring is not an array: {v}"))?;
    arr.iter()
        .map(|pair| {
            let xy = pair
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| anyhow!("ring vertex is not [lon,lat]: {pair}"))?;
            let lon = xy[0].as_f64().ok_or_else(|| anyhow!("bad lon: {pair}"))?;
            let lat = xy[1].as_f64().ok_or_else(|| anyhow!("bad lat: {pair}"))?;
            Ok(GeoPoint::new(lon, lat))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_round_trip() {
        let p = GeoPoint::new(28.047, -26.204);
        let v = point_to_json(p);
        assert_eq!(point_from_json(&v).unwrap(), p);
    }

    #[test]
    fn ring_round_trip_preserves_vertices() {
        let ring = vec![
            GeoPoint::new(28.0, -26.3),
            GeoPoint::new(28.1, -26.3),
            GeoPoint::new(28.1, -26.1),
            GeoPoint::new(28.0, -26.3),
        ];
        let v = ring_to_json(&ring);
        assert_eq!(ring_from_json(&v).unwrap(), ring);
    }

    #[test]
    fn malformed_ring_is_an_error() {
        assert!(ring_from_json(&json!({"not": "a ring"})).is_err());
        assert!(ring_from_json(&json!([[1.0]])).is_err());
        assert!(ring_from_json(&json!([["a", "b"]])).is_err());
    }
}
