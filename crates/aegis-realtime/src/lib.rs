//! Realtime fan-out: the session directory, the routing rules, and
//! location-log ingest.
//!
//! Delivery is at-most-once per session with no replay buffer; the REST
//! surface stays the source of truth. The directory is an in-process
//! mutex-protected map whose interface is a pure function of session
//! lifecycle events, so a pub/sub bus can front it later without changing
//! the contract.

pub mod audience;
pub mod directory;
pub mod location;
pub mod router;

pub use audience::{publish_request_event, resolve_audience};
pub use directory::{SessionDirectory, SessionHandle};
pub use location::{ingest_location, total_distance_km, LocationIngest};
pub use router::{recipients_for, RequestAudience};
