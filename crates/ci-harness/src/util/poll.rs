use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Run `check` every `interval` until it yields a value or `timeout` elapses.
///
/// The check always runs at least once. The last sleep is clamped to the time
/// left so the deadline is never overshot by a whole interval.
pub async fn poll_until<T, F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
