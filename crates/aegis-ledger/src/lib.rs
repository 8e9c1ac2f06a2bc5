//! Subscription ledger: firm credits, products, stored subscriptions, and
//! their application to groups.
//!
//! The expiry/grace arithmetic is pure (`standing`); `ops` owns the
//! transactions. External charges always complete before any store write;
//! the gateway's external reference keys the idempotent apply.

pub mod ops;
pub mod standing;

pub use ops::{
    apply_subscription, create_product, purchase_credits, purchase_subscription,
    subscription_firm_for_group, validate_subscription, ApplyReceipt,
};
pub use standing::{evaluate_standing, extended_expiry, SubscriptionStanding};
