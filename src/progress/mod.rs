//! Progress Store
//!
//! Durable per-video playback ledgers for one session.
//!
//! Every progress report for a video runs its (snapshot, add, persist,
//! snapshot) sequence under that video's mutex, so two concurrent reports can
//! never observe the same "before" state and bill the same chunk twice.
//! Reports for different videos only share a read lock on the video map.
//!
//! The new ledger is built on a copy and committed in memory only after the
//! store acknowledged the write: a failed or interrupted persist leaves both
//! memory and disk at the previous state and no payment is attempted.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::metering::{PlayRange, PlaybackLedger};
use crate::storage::{KeyValueStore, StorageError};
use crate::types::{AppError, AppResult};

pub const PROGRESS_KEY_PREFIX: &str = "progress:";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub fn progress_key(video_id: &str) -> String {
    format!("{}{}", PROGRESS_KEY_PREFIX, video_id)
}

/// Published after a report grew a video's ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressChanged {
    pub video_id: String,
    pub duration: f64,
}

/// Ledger snapshots taken immediately before and after one report.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub video_id: String,
    pub previous: Vec<PlayRange>,
    pub current: Vec<PlayRange>,
    pub changed: bool,
}

type SharedLedger = Arc<Mutex<PlaybackLedger>>;

pub struct ProgressStore {
    store: Arc<dyn KeyValueStore>,
    ledgers: RwLock<HashMap<String, SharedLedger>>,
    changes: broadcast::Sender<ProgressChanged>,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            ledgers: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Rebuild every persisted ledger. Returns the number of videos restored.
    pub async fn load(&self) -> AppResult<usize> {
        let keys = self.store.keys(PROGRESS_KEY_PREFIX).await?;
        let mut ledgers = self.ledgers.write().await;
        for key in keys {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            let video_id = &key[PROGRESS_KEY_PREFIX.len()..];
            match serde_json::from_value::<PlaybackLedger>(value) {
                Ok(ledger) => {
                    ledgers.insert(video_id.to_string(), Arc::new(Mutex::new(ledger)));
                }
                Err(e) => warn!(video_id, error = %e, "Discarding unreadable progress entry"),
            }
        }
        info!(videos = ledgers.len(), "Loaded playback progress");
        Ok(ledgers.len())
    }

    /// Record that `[prev, curr]` of `video_id` was watched.
    pub async fn add_progress(&self, video_id: &str, prev: f64, curr: f64) -> AppResult<ProgressUpdate> {
        if video_id.is_empty() {
            warn!("Rejecting progress report without a video id");
            return Err(AppError::MalformedTelemetry("empty video id".to_string()));
        }
        let range = PlayRange::new(prev, curr).map_err(|e| {
            warn!(video_id, prev, curr, error = %e, "Rejecting malformed progress report");
            AppError::from(e)
        })?;

        // The map read guard is held for the whole update so clear() waits for it.
        let (_ledgers, ledger) = loop {
            let ledgers = self.ledgers.read().await;
            if let Some(ledger) = ledgers.get(video_id).cloned() {
                break (ledgers, ledger);
            }
            drop(ledgers);
            self.ledgers
                .write()
                .await
                .entry(video_id.to_string())
                .or_default();
        };

        let mut guard = ledger.lock().await;
        let previous = guard.ranges().to_vec();

        let mut next = guard.clone();
        let changed = next.add(range.start(), range.end())?;
        if changed {
            let value = serde_json::to_value(&next).map_err(StorageError::from)?;
            self.store.set(&progress_key(video_id), value).await?;
            *guard = next;
        }
        let current = guard.ranges().to_vec();
        let duration = guard.total_duration();
        drop(guard);

        debug!(video_id, prev, curr, duration, changed, "Recorded progress");
        if changed {
            // no subscribers is fine
            let _ = self.changes.send(ProgressChanged {
                video_id: video_id.to_string(),
                duration,
            });
        }

        Ok(ProgressUpdate {
            video_id: video_id.to_string(),
            previous,
            current,
            changed,
        })
    }

    /// Copy of the video's ledger; empty for unknown videos.
    pub async fn get_played_ranges(&self, video_id: &str) -> Vec<PlayRange> {
        let ledger = self.ledgers.read().await.get(video_id).cloned();
        match ledger {
            Some(ledger) => ledger.lock().await.ranges().to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn get_played_duration(&self, video_id: &str) -> f64 {
        crate::metering::total_duration(&self.get_played_ranges(video_id).await)
    }

    pub async fn tracked_videos(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ledgers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressChanged> {
        self.changes.subscribe()
    }

    /// Forget all progress, in memory and on disk.
    pub async fn clear(&self) -> AppResult<()> {
        let mut ledgers = self.ledgers.write().await;
        let count = ledgers.len();
        ledgers.clear();
        for key in self.store.keys(PROGRESS_KEY_PREFIX).await? {
            self.store.remove(&key).await?;
        }
        info!(videos = count, "Cleared playback progress");
        Ok(())
    }
}
