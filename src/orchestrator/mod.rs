//! Payment Orchestrator
//!
//! One per session. Consumes playback messages, keeps the transaction
//! observer in step with playback, meters progress through the ledger and
//! pays for newly covered chunks into the session invoice.
//!
//! Session state lives behind one mutex, but it is only held for state
//! transitions: metering is serialised per video by the progress store and
//! payments run without any lock, so a slow payment never blocks play/pause.
//!
//! Progress reports hold the metering lock shared from their phase check
//! until the ledger is persisted; activation and teardown take it exclusively
//! before the state mutex. A report can therefore never write progress into a
//! session that was reset or torn down after it checked the phase.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::metering::BillingStrategy;
use crate::payment::{Invoice, PaymentApi, PaymentError, TransactionStatus, TransactionUpdate};
use crate::session::{DelayedTask, SessionContext, SessionCredentials, SessionPhase};
use crate::types::{AppError, AppResult, CurrencyAmount};

/// Messages sent by the playback host, tagged by `id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum StreamMessage {
    VideoPlay,
    VideoPause,
    VideoProgress {
        #[serde(rename = "videoID")]
        video_id: String,
        #[serde(rename = "prevProgress", default)]
        prev_progress: Option<f64>,
        progress: f64,
    },
    IsVideoPlaying,
    Ping,
    GetVersion,
    GetWalletStatus,
    GetWalletTransactions,
    GetStreamingWalletBalances,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Status { status: String },
    Metering(MeteringReceipt),
    Playing(bool),
    Text(String),
    Version { version: String },
    Transactions { transactions: Vec<TransactionUpdate> },
    Balances { balances: WalletBalances },
}

impl Reply {
    fn status(status: &str) -> Self {
        Reply::Status {
            status: status.to_string(),
        }
    }
}

/// Reply to `video_progress`. The amount is reported whatever became of the payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringReceipt {
    pub amount_to_pay: CurrencyAmount,
    pub payment: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalances {
    pub viewer_balance: CurrencyAmount,
    pub creator_balance: CurrencyAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Nothing new was covered.
    NotRequired,
    NotBillable,
    Paid { payment_id: String },
    Failed { reason: String },
    /// Owed, but there was no invoice or viewer node to pay with.
    MissingContext,
}

const WALLET_TRANSACTIONS_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Only this video is charged; progress on others is still recorded.
    pub billable_video_id: String,
    pub payment_timeout: Duration,
    pub pause_grace: Duration,
    pub version: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            billable_video_id: "ls_demo".to_string(),
            payment_timeout: Duration::from_secs(60),
            pause_grace: Duration::from_secs(3),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

struct OrchestratorState {
    phase: SessionPhase,
    playing: bool,
    pause_timer: Option<DelayedTask>,
}

struct OrchestratorInner {
    context: Arc<SessionContext>,
    strategy: Arc<dyn BillingStrategy>,
    api: Arc<dyn PaymentApi>,
    settings: OrchestratorSettings,
    metering: RwLock<()>,
    state: Mutex<OrchestratorState>,
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl PaymentOrchestrator {
    /// Build the orchestrator for a session, picking up whatever the session
    /// store already holds.
    pub async fn restore(
        context: Arc<SessionContext>,
        strategy: Arc<dyn BillingStrategy>,
        api: Arc<dyn PaymentApi>,
        settings: OrchestratorSettings,
    ) -> AppResult<Self> {
        let phase = match context.load().await? {
            Some(credentials) => {
                if let Err(e) = context.invoices.create_invoice(&credentials.creator_node_id).await {
                    warn!(session_id = %context.session_id, error = %e, "Restored session has no invoice");
                }
                SessionPhase::Authenticated
            }
            None => SessionPhase::Unauthenticated,
        };

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                context,
                strategy,
                api,
                settings,
                metering: RwLock::new(()),
                state: Mutex::new(OrchestratorState {
                    phase,
                    playing: false,
                    pause_timer: None,
                }),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.context.session_id
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    pub fn same_session(&self, other: &PaymentOrchestrator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn is_playing(&self) -> bool {
        self.inner.state.lock().await.playing
    }

    pub async fn handle(&self, message: StreamMessage) -> AppResult<Reply> {
        match message {
            StreamMessage::VideoPlay => {
                self.on_play().await?;
                Ok(Reply::status("ok"))
            }
            StreamMessage::VideoPause => {
                self.on_pause().await?;
                Ok(Reply::status("ok"))
            }
            StreamMessage::VideoProgress {
                video_id,
                prev_progress,
                progress,
            } => {
                let receipt = self
                    .on_progress(&video_id, prev_progress.unwrap_or(0.0), progress)
                    .await?;
                Ok(Reply::Metering(receipt))
            }
            StreamMessage::IsVideoPlaying => Ok(Reply::Playing(self.is_playing().await)),
            StreamMessage::Ping => Ok(Reply::Text("pong".to_string())),
            StreamMessage::GetVersion => Ok(Reply::Version {
                version: self.inner.settings.version.clone(),
            }),
            StreamMessage::GetWalletStatus => {
                let status = if self.inner.api.is_authorized().await {
                    "funded"
                } else {
                    "no_wallet"
                };
                Ok(Reply::status(status))
            }
            StreamMessage::GetWalletTransactions => Ok(Reply::Transactions {
                transactions: self.wallet_transactions().await?,
            }),
            StreamMessage::GetStreamingWalletBalances => Ok(Reply::Balances {
                balances: self.wallet_balances().await?,
            }),
            StreamMessage::Unknown => {
                debug!(session_id = %self.session_id(), "Unknown message received");
                Ok(Reply::status("unknown"))
            }
        }
    }

    /// Bind credentials to the session and return its invoice.
    ///
    /// Identical credentials keep the live invoice; different ones reset the
    /// session first.
    pub async fn activate(&self, credentials: SessionCredentials) -> AppResult<Invoice> {
        let context = &self.inner.context;
        let _metering = self.inner.metering.write().await;
        let mut state = self.inner.state.lock().await;
        self.ensure_open(&state)?;

        match context.credentials().await {
            Some(existing) if existing == credentials => {
                return context.invoices.create_invoice(&credentials.creator_node_id).await;
            }
            Some(_) => {
                info!(session_id = %context.session_id, "Credentials changed, resetting session");
                self.reset(&mut state).await?;
            }
            None => {}
        }

        context.save_credentials(&credentials).await?;
        state.phase = SessionPhase::Authenticated;
        info!(session_id = %context.session_id, viewer = %credentials.viewer_node_id, "Session authenticated");

        context.invoices.create_invoice(&credentials.creator_node_id).await
    }

    /// Cancel everything and forget the session's state. Terminal.
    pub async fn teardown(&self) -> AppResult<()> {
        let _metering = self.inner.metering.write().await;
        let mut state = self.inner.state.lock().await;
        if state.phase == SessionPhase::TornDown {
            return Ok(());
        }
        self.reset(&mut state).await?;
        self.inner.context.clear_credentials().await?;
        state.phase = SessionPhase::TornDown;
        info!(session_id = %self.session_id(), "Session torn down");
        Ok(())
    }

    async fn reset(&self, state: &mut OrchestratorState) -> AppResult<()> {
        let context = &self.inner.context;
        if let Some(timer) = state.pause_timer.take() {
            timer.cancel();
        }
        state.playing = false;
        context.observer.stop_listening().await;
        context.observer.clear_cache().await;
        context.invoices.clear_invoice().await?;
        context.progress.clear().await?;
        state.phase = SessionPhase::Unauthenticated;
        Ok(())
    }

    fn ensure_open(&self, state: &OrchestratorState) -> AppResult<()> {
        if state.phase == SessionPhase::TornDown {
            return Err(AppError::SessionClosed(self.session_id().to_string()));
        }
        Ok(())
    }

    async fn on_play(&self) -> AppResult<()> {
        let context = &self.inner.context;
        let mut state = self.inner.state.lock().await;
        self.ensure_open(&state)?;

        if let Some(timer) = state.pause_timer.take() {
            debug!(session_id = %context.session_id, "Playback resumed within grace period");
            timer.cancel();
        }
        state.playing = true;

        match context.credentials().await {
            Some(credentials) => {
                context.observer.start_listening(&credentials.viewer_node_id).await;
                state.phase = SessionPhase::Streaming;
            }
            None => {
                warn!(session_id = %context.session_id, "Playback without credentials, not listening for transactions");
            }
        }
        Ok(())
    }

    async fn on_pause(&self) -> AppResult<()> {
        let mut state = self.inner.state.lock().await;
        self.ensure_open(&state)?;
        state.playing = false;

        if let Some(timer) = state.pause_timer.take() {
            timer.cancel();
        }
        if !matches!(state.phase, SessionPhase::Streaming | SessionPhase::PausedGrace) {
            return Ok(());
        }

        state.phase = SessionPhase::PausedGrace;
        let orchestrator = self.clone();
        state.pause_timer = Some(DelayedTask::schedule(
            self.inner.settings.pause_grace,
            move |task_id| async move { orchestrator.on_grace_elapsed(task_id).await },
        ));
        Ok(())
    }

    async fn on_grace_elapsed(&self, task_id: u64) {
        let mut state = self.inner.state.lock().await;
        // a stale timer that lost the race with play/teardown
        if state.pause_timer.as_ref().map(DelayedTask::id) != Some(task_id) {
            return;
        }
        state.pause_timer = None;
        if state.phase == SessionPhase::PausedGrace {
            self.inner.context.observer.stop_listening().await;
            state.phase = SessionPhase::Authenticated;
            debug!(session_id = %self.session_id(), "Grace period over, stopped listening");
        }
    }

    async fn on_progress(&self, video_id: &str, prev: f64, curr: f64) -> AppResult<MeteringReceipt> {
        let metering = self.inner.metering.read().await;
        {
            let state = self.inner.state.lock().await;
            self.ensure_open(&state)?;
        }

        let context = &self.inner.context;
        let strategy = &self.inner.strategy;
        let update = context.progress.add_progress(video_id, prev, curr).await?;
        drop(metering);

        if video_id != self.inner.settings.billable_video_id {
            return Ok(MeteringReceipt {
                amount_to_pay: strategy.zero_amount(),
                payment: PaymentStatus::NotBillable,
            });
        }

        let amount = strategy.amount_owed(&update.previous, &update.current);
        if amount.is_zero() {
            return Ok(MeteringReceipt {
                amount_to_pay: amount,
                payment: PaymentStatus::NotRequired,
            });
        }

        let payment = self.pay(amount).await;
        Ok(MeteringReceipt {
            amount_to_pay: amount,
            payment,
        })
    }

    /// The viewer node's recent transactions; none before activation.
    async fn wallet_transactions(&self) -> AppResult<Vec<TransactionUpdate>> {
        let Some(credentials) = self.inner.context.credentials().await else {
            return Ok(Vec::new());
        };
        let transactions = self
            .inner
            .api
            .recent_transactions(&credentials.viewer_node_id, WALLET_TRANSACTIONS_LIMIT)
            .await?;
        Ok(transactions)
    }

    async fn wallet_balances(&self) -> AppResult<WalletBalances> {
        let zero = CurrencyAmount::sats(0);
        let Some(credentials) = self.inner.context.credentials().await else {
            return Ok(WalletBalances {
                viewer_balance: zero,
                creator_balance: zero,
            });
        };

        let nodes = self.inner.api.node_balances().await?;
        // dashboard ids carry a type prefix around the node id
        let balance_of = |node_id: &str| {
            nodes
                .iter()
                .find(|node| node.node_id.contains(node_id))
                .and_then(|node| node.local_balance)
                .unwrap_or(zero)
        };
        Ok(WalletBalances {
            viewer_balance: balance_of(&credentials.viewer_node_id),
            creator_balance: balance_of(&credentials.creator_node_id),
        })
    }

    async fn pay(&self, amount: CurrencyAmount) -> PaymentStatus {
        let context = &self.inner.context;
        let viewer = context.credentials().await.map(|c| c.viewer_node_id);
        let invoice = context.invoices.get_invoice().await;

        let (Some(viewer), Some(invoice)) = (viewer, invoice) else {
            let err = AppError::MissingBillingContext(format!(
                "no invoice or viewer node for session {}",
                context.session_id
            ));
            error!(session_id = %context.session_id, amount = %amount, error = %err, "No invoice to pay while streaming");
            return PaymentStatus::MissingContext;
        };

        let timeout = self.inner.settings.payment_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.inner.api.pay_invoice(&viewer, &invoice.encoded, timeout, amount),
        )
        .await
        .unwrap_or_else(|_| Err(PaymentError::Timeout(timeout.as_secs())));

        match result {
            Ok(outcome) if outcome.status == TransactionStatus::Failed => {
                warn!(session_id = %context.session_id, payment_id = %outcome.payment_id, "Payment failed");
                PaymentStatus::Failed {
                    reason: format!("payment {} failed", outcome.payment_id),
                }
            }
            Ok(outcome) => {
                info!(session_id = %context.session_id, amount = %amount, payment_id = %outcome.payment_id, "Paid for watched chunks");
                PaymentStatus::Paid {
                    payment_id: outcome.payment_id,
                }
            }
            Err(e) => {
                warn!(session_id = %context.session_id, amount = %amount, error = %e, "Payment failed");
                PaymentStatus::Failed { reason: e.to_string() }
            }
        }
    }
}
