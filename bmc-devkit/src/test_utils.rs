/*!
Helpers shared by bmc-agent integration tests
*/

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Install a test subscriber once, honoring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bmc_agent=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10ms until it holds; false on timeout
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!("timeout after {:?} waiting for condition", timeout);
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Run `future` with a deadline, panicking when it does not finish
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("did not finish within {timeout:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_until() {
        let counter = AtomicUsize::new(0);
        let reached = wait_until(Duration::from_secs(1), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(reached);

        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }

    #[tokio::test]
    async fn test_within() {
        assert_eq!(within(Duration::from_secs(1), async { 7 }).await, 7);
    }
}
