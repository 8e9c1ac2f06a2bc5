//! Abuse control: prank aggregation, progressive fines, suspension, ban.
//!
//! `policy` is pure arithmetic over counts; `apply` runs it inside the
//! caller's transaction so a prank flag, its fine, and the resulting
//! standing change commit atomically. The ban flag is sticky; nothing in
//! this crate clears it.

pub mod apply;
pub mod policy;

pub use apply::{apply_prank_flag, pay_fine, PrankOutcome};
pub use policy::{FineDecision, FinePolicy};
