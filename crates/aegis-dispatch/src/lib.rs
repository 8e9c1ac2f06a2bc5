//! Panic-request lifecycle: ingest, allocation, progress, completion,
//! timeouts.
//!
//! The decision logic (gate ordering, the transition table, timeout
//! classification) is pure and unit-tested; the async modules order the
//! row-locked transactions around it. Every state change appends its
//! status-update row inside the same transaction as the status write.

pub mod allocate;
pub mod complete;
pub mod gates;
pub mod ingest;
pub mod progress;
pub mod retry;
pub mod timeout;
pub mod transitions;

pub use allocate::{allocate, reassign, AllocationTarget, AllocationReceipt};
pub use complete::{complete, CompletionReceipt, Feedback};
pub use gates::{evaluate_ingest, Admission, IngestSnapshot, RequesterStanding};
pub use ingest::{ingest_panic, IngestReceipt, PanicInput};
pub use progress::{cancel_request, handle_call, progress_request};
pub use retry::with_backoff;
pub use timeout::{classify_timeout, TimeoutAction};
pub use transitions::{validate_transition, Actor, TransitionRole};
