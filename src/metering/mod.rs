//! Metering
//!
//! Pure, synchronous building blocks: the per-video interval ledger and the
//! strategy that prices ledger transitions.

pub mod ledger;
pub mod strategy;

pub use ledger::{total_duration, LedgerError, PlayRange, PlaybackLedger};
pub use strategy::{chunk_count, BillingStrategy, LinearPaymentStrategy};
