//! One-shot countdowns on the tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run `on_fire` after `delay` unless `token` is cancelled first.
///
/// The callback runs on a runtime task, never on the caller's thread.
pub(crate) fn spawn<F>(
    runtime: &Handle,
    delay: Duration,
    token: CancellationToken,
    on_fire: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    runtime.spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => on_fire(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = spawn(
            &Handle::current(),
            Duration::from_millis(50),
            CancellationToken::new(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_countdown_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let token = CancellationToken::new();
        let task = spawn(
            &Handle::current(),
            Duration::from_millis(50),
            token.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
