//! Billing Strategy
//!
//! Turns a before/after pair of ledger snapshots into an amount owed. Billing
//! only ever looks at ledger state, so a replayed span that leaves the ledger
//! unchanged bills nothing.

use super::ledger::{total_duration, PlayRange};
use crate::types::CurrencyAmount;

pub trait BillingStrategy: Send + Sync {
    /// Amount owed for the transition from `previous` to `current`.
    fn amount_owed(&self, previous: &[PlayRange], current: &[PlayRange]) -> CurrencyAmount;

    /// Nothing owed, in this strategy's unit.
    fn zero_amount(&self) -> CurrencyAmount {
        self.amount_owed(&[], &[])
    }
}

// Float sums of many ranges drift by a few ulps; anything this close to a
// chunk boundary counts as sitting on it.
const BOUNDARY_TOLERANCE: f64 = 1e-6;

/// Number of billing chunks started by `duration` seconds of watched video.
pub fn chunk_count(duration: f64, chunk_secs: f64) -> i64 {
    if duration <= 0.0 || chunk_secs <= 0.0 {
        return 0;
    }
    (duration / chunk_secs - BOUNDARY_TOLERANCE).ceil().max(0.0) as i64
}

/// Charges a fixed amount for every started chunk of covered duration.
#[derive(Debug, Clone)]
pub struct LinearPaymentStrategy {
    payment_per_chunk: CurrencyAmount,
    chunk_secs: f64,
}

impl LinearPaymentStrategy {
    pub fn new(payment_per_chunk: CurrencyAmount, chunk_secs: f64) -> Self {
        Self {
            payment_per_chunk,
            chunk_secs,
        }
    }

    pub fn payment_per_chunk(&self) -> CurrencyAmount {
        self.payment_per_chunk
    }

    pub fn chunk_secs(&self) -> f64 {
        self.chunk_secs
    }
}

impl BillingStrategy for LinearPaymentStrategy {
    fn amount_owed(&self, previous: &[PlayRange], current: &[PlayRange]) -> CurrencyAmount {
        let before = chunk_count(total_duration(previous), self.chunk_secs);
        let after = chunk_count(total_duration(current), self.chunk_secs);
        // a ledger never shrinks; if it somehow did, bill nothing rather than refund
        let new_chunks = (after - before).max(0);
        self.payment_per_chunk.times(new_chunks)
    }
}
