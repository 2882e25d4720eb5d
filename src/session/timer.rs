// Cancellable delayed tasks used for the pause grace period

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A future scheduled to run once after a delay.
///
/// Dropping the handle does not cancel the task; call [`DelayedTask::cancel`].
/// The id lets a firing task check it is still the one its owner expects.
#[derive(Debug)]
pub struct DelayedTask {
    id: u64,
    handle: JoinHandle<()>,
}

impl DelayedTask {
    pub fn schedule<F, Fut>(delay: Duration, task: F) -> Self
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task(id).await;
        });
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = DelayedTask::schedule(Duration::from_secs(3), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // cancelling a task that already ran is harmless
        task.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = DelayedTask::schedule(Duration::from_secs(3), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let a = DelayedTask::schedule(Duration::from_secs(60), |_| async {});
        let b = DelayedTask::schedule(Duration::from_secs(60), |_| async {});
        assert_ne!(a.id(), b.id());
        a.cancel();
        b.cancel();
    }
}
