use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::metering::{LinearPaymentStrategy, PlayRange};
use crate::observer::ObserverSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::payment::{PaymentApi, TransactionUpdate};
use crate::session::{SessionCredentials, SessionDeps, SessionPhase, SessionRegistry, SessionSettings};
use crate::storage::{StorageBackend, StorageError};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Config,
}

impl AppState {
    /// Wire the session registry from configuration around a payment API.
    pub fn new(config: Config, api: Arc<dyn PaymentApi>) -> Result<Self, StorageError> {
        let backend = StorageBackend::from_config(&config.storage)?;
        Ok(Self::with_backend(config, api, backend))
    }

    pub fn with_backend(config: Config, api: Arc<dyn PaymentApi>, backend: StorageBackend) -> Self {
        let deps = SessionDeps {
            api,
            strategy: Arc::new(LinearPaymentStrategy::new(
                config.billing.payment_per_chunk(),
                config.billing.chunk_seconds,
            )),
            session: SessionSettings {
                invoice_memo: config.payment.invoice_memo.clone(),
                observer: ObserverSettings {
                    max_resubscribe_attempts: config.observer.resubscribe_attempts,
                    resubscribe_backoff: Duration::from_millis(config.observer.resubscribe_backoff_ms),
                },
            },
            orchestrator: OrchestratorSettings {
                billable_video_id: config.billing.billable_video_id.clone(),
                payment_timeout: config.payment.timeout(),
                pause_grace: Duration::from_millis(config.observer.pause_grace_ms),
                ..OrchestratorSettings::default()
            },
        };

        Self {
            registry: Arc::new(SessionRegistry::new(backend, deps)),
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateSessionRequest {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub credentials: SessionCredentials,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
    pub phase: SessionPhase,
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoProgressResponse {
    #[serde(rename = "videoID")]
    pub video_id: String,
    pub played_ranges: Vec<PlayRange>,
    pub played_duration: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<TransactionUpdate>,
}
