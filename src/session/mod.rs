//! Sessions
//!
//! A session is one viewer/creator pairing: its credentials, per-video
//! progress, live invoice, transaction observer and UI relay. Everything
//! lives in an explicit [`SessionContext`]; the [`SessionRegistry`] owns one
//! [`PaymentOrchestrator`] per session id.

pub mod timer;

pub use timer::DelayedTask;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::metering::BillingStrategy;
use crate::observer::{ObserverSettings, RelayEvent, TransactionObserver};
use crate::orchestrator::{OrchestratorSettings, PaymentOrchestrator};
use crate::payment::{InvoiceManager, PaymentApi};
use crate::progress::{ProgressChanged, ProgressStore};
use crate::storage::{KeyValueStore, StorageBackend, StorageError};
use crate::types::{AppError, AppResult};

pub const CREDENTIALS_KEY: &str = "credentials";
const RELAY_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub viewer_node_id: String,
    pub creator_node_id: String,
}

impl SessionCredentials {
    pub fn new(viewer_node_id: impl Into<String>, creator_node_id: impl Into<String>) -> Self {
        Self {
            viewer_node_id: viewer_node_id.into(),
            creator_node_id: creator_node_id.into(),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.viewer_node_id.trim().is_empty() || self.creator_node_id.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "viewer and creator node ids are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// ```text
/// Unauthenticated ─▶ Authenticated ─▶ Streaming ─▶ PausedGrace ─▶ Streaming | Authenticated
///                                  any ─▶ TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unauthenticated,
    Authenticated,
    Streaming,
    PausedGrace,
    TornDown,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub invoice_memo: String,
    pub observer: ObserverSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            invoice_memo: "Streaming payments".to_string(),
            observer: ObserverSettings::default(),
        }
    }
}

pub struct SessionContext {
    pub session_id: String,
    pub progress: ProgressStore,
    pub invoices: InvoiceManager,
    pub observer: TransactionObserver,
    store: Arc<dyn KeyValueStore>,
    relay: broadcast::Sender<RelayEvent>,
    credentials: RwLock<Option<SessionCredentials>>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn PaymentApi>,
        settings: &SessionSettings,
    ) -> Self {
        let session_id = session_id.into();
        let (relay, _) = broadcast::channel(RELAY_CHANNEL_CAPACITY);
        let progress = ProgressStore::new(store.clone());
        tokio::spawn(forward_progress(progress.subscribe(), relay.clone()));

        Self {
            invoices: InvoiceManager::new(
                session_id.clone(),
                settings.invoice_memo.clone(),
                api.clone(),
                store.clone(),
            ),
            observer: TransactionObserver::new(api, relay.clone(), settings.observer.clone()),
            progress,
            session_id,
            store,
            relay,
            credentials: RwLock::new(None),
        }
    }

    /// Restore credentials, ledgers and invoice from the session store.
    pub async fn load(&self) -> AppResult<Option<SessionCredentials>> {
        let credentials = match self.store.get(CREDENTIALS_KEY).await? {
            Some(value) => match serde_json::from_value::<SessionCredentials>(value) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Discarding unreadable credentials");
                    None
                }
            },
            None => None,
        };
        self.progress.load().await?;
        self.invoices.load().await?;
        *self.credentials.write().await = credentials.clone();
        Ok(credentials)
    }

    pub async fn credentials(&self) -> Option<SessionCredentials> {
        self.credentials.read().await.clone()
    }

    pub async fn save_credentials(&self, credentials: &SessionCredentials) -> AppResult<()> {
        let value = serde_json::to_value(credentials).map_err(StorageError::from)?;
        self.store.set(CREDENTIALS_KEY, value).await?;
        *self.credentials.write().await = Some(credentials.clone());
        Ok(())
    }

    pub async fn clear_credentials(&self) -> AppResult<()> {
        self.store.remove(CREDENTIALS_KEY).await?;
        *self.credentials.write().await = None;
        Ok(())
    }

    pub fn subscribe_relay(&self) -> broadcast::Receiver<RelayEvent> {
        self.relay.subscribe()
    }
}

// Ends when the progress store, and with it the sender, is dropped.
async fn forward_progress(
    mut changes: broadcast::Receiver<ProgressChanged>,
    relay: broadcast::Sender<RelayEvent>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                let _ = relay.send(change.into());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress relay lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Everything the registry needs to build a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn PaymentApi>,
    pub strategy: Arc<dyn BillingStrategy>,
    pub session: SessionSettings,
    pub orchestrator: OrchestratorSettings,
}

pub struct SessionRegistry {
    backend: StorageBackend,
    deps: SessionDeps,
    sessions: RwLock<HashMap<String, PaymentOrchestrator>>,
    // per-id locks so a session is built once without holding `sessions`
    opening: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(backend: StorageBackend, deps: SessionDeps) -> Self {
        Self {
            backend,
            deps,
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// The session's orchestrator, opening it from storage if needed.
    /// Only activation and startup restore open sessions; messages for an
    /// id nobody activated are refused by [`SessionRegistry::get`].
    async fn open(&self, session_id: &str) -> AppResult<PaymentOrchestrator> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Ok(session.clone());
        }
        if session_id.trim().is_empty() || session_id.contains(['/', '\\', '.']) {
            return Err(AppError::InvalidRequest(format!("invalid session id: {session_id:?}")));
        }

        let opening = self
            .opening
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let _opening = opening.lock().await;
        let existing = self.sessions.read().await.get(session_id).cloned();
        if let Some(session) = existing {
            self.opening.lock().await.remove(session_id);
            return Ok(session);
        }

        let built = self.build(session_id).await;
        if let Ok(orchestrator) = &built {
            self.sessions
                .write()
                .await
                .insert(session_id.to_string(), orchestrator.clone());
        }
        self.opening.lock().await.remove(session_id);

        let orchestrator = built?;
        let phase = orchestrator.phase().await;
        debug!(session_id, ?phase, "Opened session");
        Ok(orchestrator)
    }

    async fn build(&self, session_id: &str) -> AppResult<PaymentOrchestrator> {
        let store = self.backend.open(session_id).await?;
        let context = Arc::new(SessionContext::new(
            session_id,
            store,
            self.deps.api.clone(),
            &self.deps.session,
        ));
        PaymentOrchestrator::restore(
            context,
            self.deps.strategy.clone(),
            self.deps.api.clone(),
            self.deps.orchestrator.clone(),
        )
        .await
    }

    /// Bind credentials to a session, creating one when no id is given.
    pub async fn activate(
        &self,
        session_id: Option<&str>,
        credentials: SessionCredentials,
    ) -> AppResult<PaymentOrchestrator> {
        credentials.validate()?;
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let orchestrator = self.open(&session_id).await?;
        orchestrator.activate(credentials).await?;
        Ok(orchestrator)
    }

    pub async fn get(&self, session_id: &str) -> AppResult<PaymentOrchestrator> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear the session down and delete everything it stored.
    pub async fn teardown(&self, session_id: &str) -> AppResult<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        session.teardown().await?;
        self.backend.destroy(session_id).await?;
        info!(session_id, "Session removed");
        Ok(())
    }

    /// Reopen every session found in storage. Returns how many were restored.
    pub async fn restore(&self) -> AppResult<usize> {
        let ids = self.backend.session_ids().await?;
        let mut restored = 0;
        for id in ids {
            match self.open(&id).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(session_id = %id, error = %e, "Failed to restore session"),
            }
        }
        info!(sessions = restored, "Restored sessions");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::LinearPaymentStrategy;
    use crate::orchestrator::StreamMessage;
    use crate::payment::testing::ScriptedPaymentApi;
    use crate::types::CurrencyAmount;
    use std::time::Duration;
    use tempfile::TempDir;

    fn deps(api: Arc<ScriptedPaymentApi>) -> SessionDeps {
        SessionDeps {
            api,
            strategy: Arc::new(LinearPaymentStrategy::new(CurrencyAmount::sats(10), 2.0)),
            session: SessionSettings::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }

    fn progress(video_id: &str, prev: f64, progress: f64) -> StreamMessage {
        StreamMessage::VideoProgress {
            video_id: video_id.to_string(),
            prev_progress: Some(prev),
            progress,
        }
    }

    #[test]
    fn test_credentials_wire_format() {
        let credentials: SessionCredentials =
            serde_json::from_str(r#"{"viewerNodeId":"v","creatorNodeId":"c"}"#).unwrap();
        assert_eq!(credentials, SessionCredentials::new("v", "c"));
        assert!(SessionCredentials::new("", "c").validate().is_err());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_registry_futures_are_send() {
        let registry = SessionRegistry::new(StorageBackend::memory(), deps(Arc::new(ScriptedPaymentApi::new())));

        assert_send(&registry.activate(None, SessionCredentials::new("viewer", "creator")));
        assert_send(&registry.open("s1"));
        assert_send(&registry.get("s1"));
        assert_send(&registry.teardown("s1"));
        assert_send(&registry.restore());
    }

    #[tokio::test]
    async fn test_open_is_shared() {
        let registry = SessionRegistry::new(StorageBackend::memory(), deps(Arc::new(ScriptedPaymentApi::new())));

        assert!(matches!(registry.get("s1").await, Err(AppError::SessionNotFound(_))));
        let first = registry.open("s1").await.unwrap();
        let second = registry.open("s1").await.unwrap();

        assert!(first.same_session(&second));
        assert_eq!(first.phase().await, SessionPhase::Unauthenticated);
        assert!(registry.open("../escape").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_restore_does_not_block_other_sessions() {
        let api = Arc::new(ScriptedPaymentApi::new());
        let backend = StorageBackend::memory();
        // credentials persisted but no invoice, so restoring has to create one
        let store = backend.open("slow").await.unwrap();
        let credentials = serde_json::to_value(SessionCredentials::new("viewer", "creator")).unwrap();
        store.set(CREDENTIALS_KEY, credentials).await.unwrap();

        api.delay_next_invoice(Duration::from_secs(30));
        let registry = Arc::new(SessionRegistry::new(backend, deps(api.clone())));
        let restoring = tokio::spawn({
            let registry = registry.clone();
            async move { registry.restore().await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        registry
            .activate(Some("fast"), SessionCredentials::new("viewer-2", "creator-2"))
            .await
            .unwrap();
        assert!(registry.get("fast").await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(30));

        assert_eq!(restoring.await.unwrap().unwrap(), 1);
        assert_eq!(registry.get("slow").await.unwrap().phase().await, SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_activate_generates_session_id() {
        let api = Arc::new(ScriptedPaymentApi::new());
        let registry = SessionRegistry::new(StorageBackend::memory(), deps(api.clone()));

        let session = registry
            .activate(None, SessionCredentials::new("viewer", "creator"))
            .await
            .unwrap();

        assert!(uuid::Uuid::parse_str(session.session_id()).is_ok());
        assert_eq!(session.phase().await, SessionPhase::Authenticated);
        assert_eq!(api.invoices_created(), 1);
        assert_eq!(registry.session_ids().await, vec![session.session_id().to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_removes_session_and_storage() {
        let temp_dir = TempDir::new().unwrap();
        let backend = StorageBackend::File(temp_dir.path().to_path_buf());
        let registry = SessionRegistry::new(backend.clone(), deps(Arc::new(ScriptedPaymentApi::new())));

        registry
            .activate(Some("s1"), SessionCredentials::new("viewer", "creator"))
            .await
            .unwrap();
        registry.teardown("s1").await.unwrap();

        assert!(registry.get("s1").await.is_err());
        assert!(backend.session_ids().await.unwrap().is_empty());
        assert!(matches!(registry.teardown("s1").await, Err(AppError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let api = Arc::new(ScriptedPaymentApi::new());

        {
            let registry = SessionRegistry::new(StorageBackend::File(temp_dir.path().to_path_buf()), deps(api.clone()));
            let session = registry
                .activate(Some("s1"), SessionCredentials::new("viewer", "creator"))
                .await
                .unwrap();
            session.handle(progress("ls_demo", 0.0, 4.0)).await.unwrap();
        }

        let registry = SessionRegistry::new(StorageBackend::File(temp_dir.path().to_path_buf()), deps(api.clone()));
        assert_eq!(registry.restore().await.unwrap(), 1);

        let session = registry.get("s1").await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Authenticated);
        assert_eq!(session.context().progress.get_played_duration("ls_demo").await, 4.0);
        // the persisted invoice is reused, not recreated
        assert_eq!(api.invoices_created(), 1);

        // watching the same span again after the restart bills nothing
        let before = api.payments().len();
        session.handle(progress("ls_demo", 0.0, 4.0)).await.unwrap();
        assert_eq!(api.payments().len(), before);
    }

    #[tokio::test]
    async fn test_progress_changes_reach_relay() {
        let registry = SessionRegistry::new(StorageBackend::memory(), deps(Arc::new(ScriptedPaymentApi::new())));
        let session = registry.open("s1").await.unwrap();
        let mut relay = session.context().subscribe_relay();

        session.handle(progress("other", 0.0, 1.5)).await.unwrap();

        assert_eq!(
            relay.recv().await.unwrap(),
            RelayEvent::ProgressUpdated {
                video_id: "other".to_string(),
                duration: 1.5
            }
        );
    }
}
