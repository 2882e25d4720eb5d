//! GraphQL Payment Client
//!
//! Implements [`PaymentApi`] against a Lightspark-style GraphQL endpoint:
//!
//! - `create_invoice` / `pay_invoice` map to the corresponding mutations
//! - `listen_to_transactions` polls the node's recent transactions on an
//!   interval and emits each transaction once; polls that find nothing new
//!   emit an empty update
//! - `node_balances` reads the account dashboard
//!
//! Amounts are always sent in millisatoshis.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    InvoiceType, NodeBalance, PaymentApi, PaymentError, PaymentOutcome, TransactionStatus,
    TransactionStream, TransactionUpdate,
};
use crate::config::PaymentConfig;
use crate::types::{CurrencyAmount, CurrencyUnit};

const CREATE_INVOICE_MUTATION: &str = r#"
mutation CreateInvoice($node_id: ID!, $amount_msats: Long!, $memo: String, $invoice_type: InvoiceType) {
  create_invoice(input: { node_id: $node_id, amount_msats: $amount_msats, memo: $memo, invoice_type: $invoice_type }) {
    invoice { data { encoded_payment_request } }
  }
}"#;

const PAY_INVOICE_MUTATION: &str = r#"
mutation PayInvoice($node_id: ID!, $encoded_invoice: String!, $timeout_secs: Int!, $maximum_fees_msats: Long!, $amount_msats: Long) {
  pay_invoice(input: { node_id: $node_id, encoded_invoice: $encoded_invoice, timeout_secs: $timeout_secs, maximum_fees_msats: $maximum_fees_msats, amount_msats: $amount_msats }) {
    payment { id status }
  }
}"#;

const RECENT_TRANSACTIONS_QUERY: &str = r#"
query RecentTransactions($node_ids: [ID!]!, $first: Int!) {
  current_account {
    recent_transactions(lightning_node_ids: $node_ids, first: $first) {
      entities { id status created_at transaction_hash amount { original_value original_unit } }
    }
  }
}"#;

const ACCOUNT_DASHBOARD_QUERY: &str = r#"
query AccountDashboard {
  current_account {
    dashboard_overview_nodes {
      entities { id local_balance { original_value original_unit } }
    }
  }
}"#;

const RECENT_TRANSACTIONS_PAGE: usize = 20;

/// Routing fee ceiling for a payment of `amount_msats`: 0.16% plus 5 msats.
pub fn maximum_fees_msats(amount_msats: i64) -> i64 {
    (amount_msats as f64 * 0.0016 + 5.0).ceil() as i64
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceData {
    create_invoice: CreateInvoiceOutput,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceOutput {
    invoice: InvoiceNode,
}

#[derive(Debug, Deserialize)]
struct InvoiceNode {
    data: InvoiceData,
}

#[derive(Debug, Deserialize)]
struct InvoiceData {
    encoded_payment_request: String,
}

#[derive(Debug, Deserialize)]
struct PayInvoiceData {
    pay_invoice: PayInvoiceOutput,
}

#[derive(Debug, Deserialize)]
struct PayInvoiceOutput {
    payment: PaymentNode,
}

#[derive(Debug, Deserialize)]
struct PaymentNode {
    id: String,
    status: TransactionStatus,
}

#[derive(Debug, Deserialize)]
struct RecentTransactionsData {
    current_account: Option<AccountNode>,
}

#[derive(Debug, Deserialize)]
struct AccountNode {
    recent_transactions: TransactionConnection,
}

#[derive(Debug, Deserialize)]
struct TransactionConnection {
    entities: Vec<TransactionNode>,
}

#[derive(Debug, Deserialize)]
struct TransactionNode {
    id: String,
    status: TransactionStatus,
    created_at: chrono::DateTime<chrono::Utc>,
    transaction_hash: Option<String>,
    amount: AmountNode,
}

#[derive(Debug, Deserialize)]
struct AmountNode {
    original_value: i64,
    original_unit: String,
}

#[derive(Debug, Deserialize)]
struct DashboardData {
    current_account: Option<DashboardAccount>,
}

#[derive(Debug, Deserialize)]
struct DashboardAccount {
    dashboard_overview_nodes: DashboardNodes,
}

#[derive(Debug, Deserialize)]
struct DashboardNodes {
    entities: Vec<DashboardNode>,
}

#[derive(Debug, Deserialize)]
struct DashboardNode {
    id: String,
    local_balance: Option<AmountNode>,
}

impl AmountNode {
    fn into_amount(self) -> CurrencyAmount {
        let unit = CurrencyUnit::from_id(&self.original_unit).unwrap_or(CurrencyUnit::Millisatoshi);
        CurrencyAmount::new(unit, self.original_value)
    }
}

impl TransactionNode {
    fn into_update(self) -> TransactionUpdate {
        TransactionUpdate {
            id: self.id,
            status: self.status,
            amount: self.amount.into_amount(),
            created_at: self.created_at,
            transaction_hash: self.transaction_hash,
        }
    }
}

/// Shared HTTP plumbing, cheap to clone into the polling stream
#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl Transport {
    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, PaymentError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        let parsed: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| PaymentError::ParseError(e.to_string()))?;
        if let Some(error) = parsed.errors.into_iter().next() {
            return Err(PaymentError::Api(error.message));
        }
        parsed
            .data
            .ok_or_else(|| PaymentError::ParseError("response has no data".to_string()))
    }

    async fn recent_transactions(
        &self,
        node_ids: &[String],
        first: usize,
    ) -> Result<Vec<TransactionUpdate>, PaymentError> {
        let data: RecentTransactionsData = self
            .execute(RECENT_TRANSACTIONS_QUERY, json!({ "node_ids": node_ids, "first": first }))
            .await?;
        Ok(data
            .current_account
            .map(|account| account.recent_transactions.entities)
            .unwrap_or_default()
            .into_iter()
            .map(TransactionNode::into_update)
            .collect())
    }
}

pub struct GraphQlPaymentClient {
    transport: Transport,
    poll_interval: Duration,
}

impl GraphQlPaymentClient {
    pub fn new(endpoint: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            transport: Transport {
                http: reqwest::Client::new(),
                endpoint: endpoint.into(),
                client_id: None,
                client_secret: None,
            },
            poll_interval,
        }
    }

    pub fn from_config(config: &PaymentConfig) -> Self {
        let mut client = Self::new(
            config.api_url.clone(),
            Duration::from_millis(config.transaction_poll_ms),
        );
        client.transport.client_id = config.client_id.clone();
        client.transport.client_secret = config.client_secret.clone();
        client
    }

    pub fn with_credentials(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.transport.client_id = Some(client_id.into());
        self.transport.client_secret = Some(client_secret.into());
        self
    }
}

struct PollState {
    transport: Transport,
    node_ids: Vec<String>,
    seen: HashSet<String>,
    interval: Duration,
}

type FeedItem = Result<Option<TransactionUpdate>, PaymentError>;

/// Turn one poll result into feed items: unseen transactions, or a single
/// empty update when nothing is new.
fn fresh_updates(seen: &mut HashSet<String>, transactions: Vec<TransactionUpdate>) -> Vec<FeedItem> {
    let fresh: Vec<FeedItem> = transactions
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .map(|t| Ok(Some(t)))
        .collect();
    if fresh.is_empty() {
        vec![Ok(None)]
    } else {
        fresh
    }
}

#[async_trait]
impl PaymentApi for GraphQlPaymentClient {
    async fn create_invoice(
        &self,
        node_id: &str,
        amount: CurrencyAmount,
        memo: &str,
        invoice_type: InvoiceType,
    ) -> Result<String, PaymentError> {
        let data: CreateInvoiceData = self
            .transport
            .execute(
                CREATE_INVOICE_MUTATION,
                json!({
                    "node_id": node_id,
                    "amount_msats": amount.to_millisatoshis(),
                    "memo": memo,
                    "invoice_type": invoice_type,
                }),
            )
            .await?;
        Ok(data.create_invoice.invoice.data.encoded_payment_request)
    }

    async fn pay_invoice(
        &self,
        node_id: &str,
        encoded_invoice: &str,
        timeout: Duration,
        amount: CurrencyAmount,
    ) -> Result<PaymentOutcome, PaymentError> {
        let amount_msats = amount.to_millisatoshis();
        let data: PayInvoiceData = self
            .transport
            .execute(
                PAY_INVOICE_MUTATION,
                json!({
                    "node_id": node_id,
                    "encoded_invoice": encoded_invoice,
                    "timeout_secs": timeout.as_secs(),
                    "maximum_fees_msats": maximum_fees_msats(amount_msats),
                    "amount_msats": amount_msats,
                }),
            )
            .await?;
        let payment = data.pay_invoice.payment;
        debug!(payment_id = %payment.id, status = ?payment.status, "Payment submitted");
        Ok(PaymentOutcome {
            payment_id: payment.id,
            status: payment.status,
        })
    }

    async fn listen_to_transactions(&self, node_ids: &[String]) -> Result<TransactionStream, PaymentError> {
        // Existing history is not an update; remember it before streaming.
        let initial = self.transport.recent_transactions(node_ids, RECENT_TRANSACTIONS_PAGE).await?;
        let state = PollState {
            transport: self.transport.clone(),
            node_ids: node_ids.to_vec(),
            seen: initial.into_iter().map(|t| t.id).collect(),
            interval: self.poll_interval,
        };

        let polls = stream::unfold(state, |mut state| async move {
            tokio::time::sleep(state.interval).await;
            let batch = match state.transport.recent_transactions(&state.node_ids, RECENT_TRANSACTIONS_PAGE).await {
                Ok(transactions) => fresh_updates(&mut state.seen, transactions),
                Err(e) => {
                    warn!(error = %e, "Transaction poll failed");
                    vec![Err(e)]
                }
            };
            Some((stream::iter(batch), state))
        });

        Ok(polls.flatten().boxed())
    }

    async fn is_authorized(&self) -> bool {
        self.transport.client_id.is_some() && self.transport.client_secret.is_some()
    }

    async fn recent_transactions(&self, node_id: &str, limit: usize) -> Result<Vec<TransactionUpdate>, PaymentError> {
        self.transport.recent_transactions(&[node_id.to_string()], limit).await
    }

    async fn node_balances(&self) -> Result<Vec<NodeBalance>, PaymentError> {
        let data: DashboardData = self.transport.execute(ACCOUNT_DASHBOARD_QUERY, json!({})).await?;
        let account = data
            .current_account
            .ok_or_else(|| PaymentError::Api("no current account".to_string()))?;
        Ok(account
            .dashboard_overview_nodes
            .entities
            .into_iter()
            .map(|node| NodeBalance {
                node_id: node.id,
                local_balance: node.local_balance.map(AmountNode::into_amount),
            })
            .collect())
    }
}
