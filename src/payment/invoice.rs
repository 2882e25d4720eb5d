//! Invoice Lifecycle Manager
//!
//! Holds the session's single live invoice: a zero-amount AMP invoice on the
//! creator's node that every partial payment of the session is paid into.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{InvoiceType, PaymentApi};
use crate::storage::{KeyValueStore, StorageError};
use crate::types::{AppResult, CurrencyAmount, CurrencyUnit};

pub const INVOICE_KEY_PREFIX: &str = "invoice:";

pub fn invoice_key(session_id: &str) -> String {
    format!("{}{}", INVOICE_KEY_PREFIX, session_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Invoice {
    pub encoded: String,
}

pub struct InvoiceManager {
    session_id: String,
    memo: String,
    api: Arc<dyn PaymentApi>,
    store: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Invoice>>,
}

impl InvoiceManager {
    pub fn new(
        session_id: impl Into<String>,
        memo: impl Into<String>,
        api: Arc<dyn PaymentApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            memo: memo.into(),
            api,
            store,
            current: RwLock::new(None),
        }
    }

    /// Restore a persisted invoice after a restart.
    pub async fn load(&self) -> AppResult<Option<Invoice>> {
        let stored = self.store.get(&invoice_key(&self.session_id)).await?;
        let invoice = match stored {
            Some(value) => match serde_json::from_value::<Invoice>(value) {
                Ok(invoice) => Some(invoice),
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Discarding unreadable invoice");
                    None
                }
            },
            None => None,
        };
        *self.current.write().await = invoice.clone();
        Ok(invoice)
    }

    /// Create the session invoice on `node_id`, or return the live one.
    pub async fn create_invoice(&self, node_id: &str) -> AppResult<Invoice> {
        let mut current = self.current.write().await;
        if let Some(invoice) = current.as_ref() {
            return Ok(invoice.clone());
        }

        let encoded = self
            .api
            .create_invoice(
                node_id,
                CurrencyAmount::zero(CurrencyUnit::Millisatoshi),
                &self.memo,
                InvoiceType::Amp,
            )
            .await?;
        let invoice = Invoice { encoded };

        let value = serde_json::to_value(&invoice).map_err(StorageError::from)?;
        self.store.set(&invoice_key(&self.session_id), value).await?;

        info!(session_id = %self.session_id, node_id, "Created session invoice");
        *current = Some(invoice.clone());
        Ok(invoice)
    }

    pub async fn get_invoice(&self) -> Option<Invoice> {
        self.current.read().await.clone()
    }

    pub async fn clear_invoice(&self) -> AppResult<()> {
        let mut current = self.current.write().await;
        self.store.remove(&invoice_key(&self.session_id)).await?;
        if current.take().is_some() {
            info!(session_id = %self.session_id, "Cleared session invoice");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::testing::ScriptedPaymentApi;
    use crate::storage::MemoryStore;

    fn manager(api: Arc<ScriptedPaymentApi>, store: Arc<MemoryStore>) -> InvoiceManager {
        InvoiceManager::new("s1", "Streaming payments", api, store)
    }

    #[tokio::test]
    async fn test_create_is_idempotent_within_session() {
        let api = Arc::new(ScriptedPaymentApi::new());
        let invoices = manager(api.clone(), Arc::new(MemoryStore::new()));

        let first = invoices.create_invoice("creator").await.unwrap();
        let second = invoices.create_invoice("creator").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.invoices_created(), 1);
        assert_eq!(invoices.get_invoice().await, Some(first));
    }

    #[tokio::test]
    async fn test_invoice_persisted_and_restored() {
        let api = Arc::new(ScriptedPaymentApi::new());
        let store = Arc::new(MemoryStore::new());
        let created = manager(api.clone(), store.clone())
            .create_invoice("creator")
            .await
            .unwrap();

        assert_eq!(
            store.get("invoice:s1").await.unwrap(),
            Some(serde_json::json!(created.encoded))
        );

        let restored = manager(api.clone(), store);
        assert_eq!(restored.load().await.unwrap(), Some(created.clone()));
        assert_eq!(restored.create_invoice("creator").await.unwrap(), created);
        assert_eq!(api.invoices_created(), 1);
    }

    #[tokio::test]
    async fn test_clear_then_create_issues_new_invoice() {
        let api = Arc::new(ScriptedPaymentApi::new());
        let store = Arc::new(MemoryStore::new());
        let invoices = manager(api.clone(), store.clone());

        let first = invoices.create_invoice("creator").await.unwrap();
        invoices.clear_invoice().await.unwrap();
        let replaced = invoices.create_invoice("creator-2").await.unwrap();
        assert_ne!(first, replaced);
        assert_eq!(api.invoices_created(), 2);

        invoices.clear_invoice().await.unwrap();
        assert_eq!(invoices.get_invoice().await, None);
        assert_eq!(store.get("invoice:s1").await.unwrap(), None);
    }
}
