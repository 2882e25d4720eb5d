// Scripted payment API for unit tests

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    InvoiceType, NodeBalance, PaymentApi, PaymentError, PaymentOutcome, TransactionStatus,
    TransactionStream, TransactionUpdate,
};
use crate::types::CurrencyAmount;

pub(crate) type FeedItem = Result<Option<TransactionUpdate>, PaymentError>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedPayment {
    pub node_id: String,
    pub invoice: String,
    pub timeout: Duration,
    pub amount: CurrencyAmount,
}

#[derive(Default)]
pub(crate) struct ScriptedPaymentApi {
    invoices_created: AtomicUsize,
    subscriptions: AtomicUsize,
    failing_subscriptions: AtomicUsize,
    payments: Mutex<Vec<RecordedPayment>>,
    pay_error: Mutex<Option<PaymentError>>,
    pay_delay: Mutex<Option<Duration>>,
    next_invoice_delay: Mutex<Option<Duration>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<FeedItem>>>,
    unauthorized: AtomicBool,
    history: Mutex<Vec<TransactionUpdate>>,
    history_queries: Mutex<Vec<(String, usize)>>,
    balances: Mutex<Vec<NodeBalance>>,
}

impl ScriptedPaymentApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invoices_created(&self) -> usize {
        self.invoices_created.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn payments(&self) -> Vec<RecordedPayment> {
        self.payments.lock().unwrap().clone()
    }

    pub fn fail_payments_with(&self, error: Option<PaymentError>) {
        *self.pay_error.lock().unwrap() = error;
    }

    pub fn delay_payments(&self, delay: Duration) {
        *self.pay_delay.lock().unwrap() = Some(delay);
    }

    /// Only the next `create_invoice` call takes `delay`.
    pub fn delay_next_invoice(&self, delay: Duration) {
        *self.next_invoice_delay.lock().unwrap() = Some(delay);
    }

    /// The next `count` subscription attempts fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.unauthorized.store(!authorized, Ordering::SeqCst);
    }

    pub fn set_history(&self, transactions: Vec<TransactionUpdate>) {
        *self.history.lock().unwrap() = transactions;
    }

    /// `(node_id, limit)` of every recent transactions query.
    pub fn history_queries(&self) -> Vec<(String, usize)> {
        self.history_queries.lock().unwrap().clone()
    }

    pub fn set_balances(&self, balances: Vec<NodeBalance>) {
        *self.balances.lock().unwrap() = balances;
    }

    /// Push an item into the most recent subscription.
    pub fn push(&self, item: FeedItem) -> bool {
        let feeds = self.feeds.lock().unwrap();
        feeds
            .last()
            .map(|tx| tx.unbounded_send(item).is_ok())
            .unwrap_or(false)
    }

    /// End the most recent subscription stream.
    pub fn close_feed(&self) {
        if let Some(tx) = self.feeds.lock().unwrap().last() {
            tx.close_channel();
        }
    }

    /// Whether the most recent subscription is still being consumed.
    pub fn feed_open(&self) -> bool {
        self.feeds
            .lock()
            .unwrap()
            .last()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

pub(crate) fn transaction(id: &str, sats: i64) -> TransactionUpdate {
    TransactionUpdate {
        id: id.to_string(),
        status: TransactionStatus::Success,
        amount: CurrencyAmount::sats(sats),
        created_at: chrono::Utc::now(),
        transaction_hash: None,
    }
}

#[async_trait]
impl PaymentApi for ScriptedPaymentApi {
    async fn create_invoice(
        &self,
        node_id: &str,
        _amount: CurrencyAmount,
        _memo: &str,
        _invoice_type: InvoiceType,
    ) -> Result<String, PaymentError> {
        let delay = self.next_invoice_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.invoices_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("lnbcrt-{}-{}", node_id, n))
    }

    async fn pay_invoice(
        &self,
        node_id: &str,
        encoded_invoice: &str,
        timeout: Duration,
        amount: CurrencyAmount,
    ) -> Result<PaymentOutcome, PaymentError> {
        let delay = *self.pay_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.payments.lock().unwrap().push(RecordedPayment {
            node_id: node_id.to_string(),
            invoice: encoded_invoice.to_string(),
            timeout,
            amount,
        });
        let error = self.pay_error.lock().unwrap().clone();
        match error {
            Some(error) => Err(error),
            None => Ok(PaymentOutcome {
                payment_id: format!("payment-{}", self.payments.lock().unwrap().len()),
                status: TransactionStatus::Success,
            }),
        }
    }

    async fn listen_to_transactions(&self, _node_ids: &[String]) -> Result<TransactionStream, PaymentError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_subscriptions.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_subscriptions.store(failing - 1, Ordering::SeqCst);
            return Err(PaymentError::RequestFailed("subscription refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }

    async fn is_authorized(&self) -> bool {
        !self.unauthorized.load(Ordering::SeqCst)
    }

    async fn recent_transactions(&self, node_id: &str, limit: usize) -> Result<Vec<TransactionUpdate>, PaymentError> {
        self.history_queries.lock().unwrap().push((node_id.to_string(), limit));
        Ok(self.history.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn node_balances(&self) -> Result<Vec<NodeBalance>, PaymentError> {
        Ok(self.balances.lock().unwrap().clone())
    }
}
