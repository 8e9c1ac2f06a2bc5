//! Coverage index: polygon validation, great-circle distance, and the two
//! resolver queries (covering firms, nearest providers).
//!
//! Pure and deterministic. The store stays authoritative; callers load row
//! snapshots (cache-warmed by the sweeper) and evaluate here. Nothing in
//! this crate does I/O.

pub mod distance;
pub mod polygon;
pub mod resolver;

pub use distance::{eta_minutes, haversine_km, path_distance_km};
pub use polygon::{normalize_ring, validate_ring, ring_contains, PolygonError};
pub use resolver::{
    covering_firms, firm_covers_point, nearest_providers, AreaEntry, CoverageSnapshot, FirmEntry,
    ProviderEntry, RankedProvider,
};
