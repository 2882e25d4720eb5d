//! Transaction Observer
//!
//! Watches settlement updates for the viewer's node and relays them to the UI.
//! Listening follows playback state rather than payment events because
//! confirmations can land after the viewer paused.
//!
//! ```text
//!            start_listening(node)            stop_listening()
//!   Idle ───────────────────────────▶ Listening(node) ───────────▶ Idle
//!                                       │      ▲
//!                       stream dropped  │      │ resubscribed (backoff)
//!                                       ▼      │
//!                                    reconnecting ──▶ degraded warning
//! ```

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::payment::{PaymentApi, TransactionUpdate};
use crate::progress::ProgressChanged;
use crate::utils::with_retry;

/// Messages pushed to the session's UI relay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum RelayEvent {
    TransactionsUpdated {
        transactions: Vec<TransactionUpdate>,
        cached: Vec<TransactionUpdate>,
    },
    ProgressUpdated {
        video_id: String,
        duration: f64,
    },
    ObserverDegraded {
        node_id: String,
        attempts: u32,
    },
}

impl From<ProgressChanged> for RelayEvent {
    fn from(change: ProgressChanged) -> Self {
        RelayEvent::ProgressUpdated {
            video_id: change.video_id,
            duration: change.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverState {
    Idle,
    Listening(String),
}

#[derive(Debug, Clone)]
pub struct ObserverSettings {
    /// Subscription attempts before reporting degraded observability
    pub max_resubscribe_attempts: u32,
    pub resubscribe_backoff: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            max_resubscribe_attempts: 5,
            resubscribe_backoff: Duration::from_millis(500),
        }
    }
}

struct Listener {
    state: ObserverState,
    task: Option<JoinHandle<()>>,
}

struct ObserverInner {
    api: Arc<dyn PaymentApi>,
    relay: broadcast::Sender<RelayEvent>,
    settings: ObserverSettings,
    listener: Mutex<Listener>,
    cache: RwLock<HashMap<String, TransactionUpdate>>,
    degraded: AtomicBool,
}

#[derive(Clone)]
pub struct TransactionObserver {
    inner: Arc<ObserverInner>,
}

impl TransactionObserver {
    pub fn new(
        api: Arc<dyn PaymentApi>,
        relay: broadcast::Sender<RelayEvent>,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                api,
                relay,
                settings,
                listener: Mutex::new(Listener {
                    state: ObserverState::Idle,
                    task: None,
                }),
                cache: RwLock::new(HashMap::new()),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    pub async fn state(&self) -> ObserverState {
        self.inner.listener.lock().await.state.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Listen for `node_id`'s transactions. No-op if a live subscription
    /// for that node is already running; a subscription that gave up is
    /// started over.
    pub async fn start_listening(&self, node_id: &str) {
        let mut listener = self.inner.listener.lock().await;
        let running = listener.task.as_ref().is_some_and(|task| !task.is_finished());
        if running && listener.state == ObserverState::Listening(node_id.to_string()) {
            return;
        }
        if let Some(task) = listener.task.take() {
            task.abort();
            let _ = task.await;
        }

        info!(node_id, "Starting listening for transactions");
        self.inner.degraded.store(false, Ordering::SeqCst);
        listener.state = ObserverState::Listening(node_id.to_string());
        listener.task = Some(tokio::spawn(run_subscription(
            self.inner.clone(),
            node_id.to_string(),
        )));
    }

    /// Cancel the subscription. No-op when idle.
    pub async fn stop_listening(&self) {
        let mut listener = self.inner.listener.lock().await;
        if listener.state == ObserverState::Idle {
            return;
        }

        info!("Stopping listening for transactions");
        listener.state = ObserverState::Idle;
        if let Some(task) = listener.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    /// Every transaction seen this session, oldest first.
    pub async fn cached_transactions(&self) -> Vec<TransactionUpdate> {
        self.inner.cached().await
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.write().await.clear();
    }
}

impl ObserverInner {
    async fn cached(&self) -> Vec<TransactionUpdate> {
        let mut transactions: Vec<_> = self.cache.read().await.values().cloned().collect();
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        transactions
    }

    async fn publish(&self, update: TransactionUpdate) {
        debug!(transaction_id = %update.id, status = ?update.status, "Transaction update");
        self.cache.write().await.insert(update.id.clone(), update.clone());
        let cached = self.cached().await;
        // nobody watching the relay is fine
        let _ = self.relay.send(RelayEvent::TransactionsUpdated {
            transactions: vec![update],
            cached,
        });
    }

    fn report_degraded(&self, node_id: &str) {
        let attempts = self.settings.max_resubscribe_attempts;
        warn!(
            node_id,
            attempts, "Transaction subscription unavailable, confirmations will not be relayed"
        );
        self.degraded.store(true, Ordering::SeqCst);
        let _ = self.relay.send(RelayEvent::ObserverDegraded {
            node_id: node_id.to_string(),
            attempts,
        });
    }
}

async fn run_subscription(inner: Arc<ObserverInner>, node_id: String) {
    let node_ids = vec![node_id.clone()];
    let max_attempts = inner.settings.max_resubscribe_attempts.max(1);
    let backoff = inner.settings.resubscribe_backoff;
    let mut consecutive_drops = 0;

    loop {
        let api = inner.api.clone();
        let ids = node_ids.clone();
        let opened = with_retry(
            move || {
                let api = api.clone();
                let ids = ids.clone();
                async move { api.listen_to_transactions(&ids).await }.boxed()
            },
            max_attempts,
            backoff,
        )
        .await;

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to subscribe to transactions");
                inner.report_degraded(&node_id);
                return;
            }
        };

        let mut healthy = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(Some(update)) => {
                    healthy = true;
                    inner.publish(update).await;
                }
                Ok(None) => healthy = true,
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Transaction subscription dropped");
                    break;
                }
            }
        }

        // a stream that dies before yielding anything counts as a failed attempt
        consecutive_drops = if healthy { 0 } else { consecutive_drops + 1 };
        if consecutive_drops >= max_attempts {
            inner.report_degraded(&node_id);
            return;
        }
        debug!(node_id = %node_id, "Resubscribing to transactions");
        tokio::time::sleep(backoff).await;
    }
}
