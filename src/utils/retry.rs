// Retry with exponential backoff

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Run `operation` until it succeeds or `max_attempts` attempts have failed.
///
/// The delay after the n-th failure is `base_delay * 2^(n-1)`, capped at 32x.
pub async fn with_retry<F, T, E>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> futures::future::BoxFuture<'static, Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(error);
                }

                let delay = base_delay * 2u32.pow((attempt - 1).min(5));
                debug!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "Retrying");
                sleep(delay).await;
            }
        }
    }
}
