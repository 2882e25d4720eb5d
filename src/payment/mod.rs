//! Payment API
//!
//! The Lightning collaborator the metering core drives: create the session's
//! reusable invoice, pay partial amounts into it, and stream settlement
//! updates for the viewer's node. [`graphql::GraphQlPaymentClient`] is the
//! production adapter; tests script their own implementation.

pub mod graphql;
pub mod invoice;

#[cfg(test)]
pub(crate) mod testing;

pub use graphql::GraphQlPaymentClient;
pub use invoice::{Invoice, InvoiceManager};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::CurrencyAmount;

/// Errors surfaced by the payment API
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Payment API request failed: {0}")]
    RequestFailed(String),

    #[error("Payment API returned an error: {0}")]
    Api(String),

    #[error("Failed to parse payment API response: {0}")]
    ParseError(String),

    #[error("Payment timed out after {0}s")]
    Timeout(u64),
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::RequestFailed(err.to_string())
    }
}

/// Invoice flavour requested from the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceType {
    Standard,
    /// Atomic multi-path invoice, payable any number of times
    Amp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Failed,
    Pending,
    NotStarted,
    #[serde(other)]
    Unknown,
}

/// Result of a `pay_invoice` call that reached the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment_id: String,
    pub status: TransactionStatus,
}

/// One settlement update pushed for an observed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub id: String,
    pub status: TransactionStatus,
    pub amount: CurrencyAmount,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

/// Local balance of one node on the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBalance {
    pub node_id: String,
    pub local_balance: Option<CurrencyAmount>,
}

/// Push feed of transaction updates. `Ok(None)` is an empty update (nothing new).
pub type TransactionStream = BoxStream<'static, Result<Option<TransactionUpdate>, PaymentError>>;

#[async_trait]
pub trait PaymentApi: Send + Sync {
    /// Request an invoice for `node_id` and return its encoded payment request.
    async fn create_invoice(
        &self,
        node_id: &str,
        amount: CurrencyAmount,
        memo: &str,
        invoice_type: InvoiceType,
    ) -> Result<String, PaymentError>;

    /// Pay `amount` from `node_id` into `encoded_invoice`.
    async fn pay_invoice(
        &self,
        node_id: &str,
        encoded_invoice: &str,
        timeout: Duration,
        amount: CurrencyAmount,
    ) -> Result<PaymentOutcome, PaymentError>;

    async fn listen_to_transactions(&self, node_ids: &[String]) -> Result<TransactionStream, PaymentError>;

    /// Whether the client holds credentials for the API at all.
    async fn is_authorized(&self) -> bool;

    /// Up to `limit` of the node's most recent transactions, as the API orders them.
    async fn recent_transactions(&self, node_id: &str, limit: usize) -> Result<Vec<TransactionUpdate>, PaymentError>;

    async fn node_balances(&self) -> Result<Vec<NodeBalance>, PaymentError>;
}
