use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::engine::EngineError;
use crate::limits::{RETRY_ATTEMPTS, RETRY_BASE_DELAY_MS};

/// Run `f`, retrying connectivity-class failures with bounded exponential
/// backoff. Conflicts, expiries and validation failures are definitive
/// answers and come back on the first attempt.
pub async fn with_backoff<T, F, Fut>(op: &str, mut f: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!("{op}: transient failure (attempt {attempt}): {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
