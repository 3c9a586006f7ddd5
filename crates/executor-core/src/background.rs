use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A process-wide loop that runs one `tick` per interval until cancelled.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// One unit of work. Failures are the task's own business to log.
    async fn tick(&self);
}

/// Spawn `task` on its own loop. The first tick runs immediately.
pub fn spawn_background<T>(task: Arc<T>, cancel: CancellationToken) -> JoinHandle<()>
where
    T: BackgroundTask + ?Sized,
{
    tokio::spawn(async move {
        info!(task = task.name(), interval = ?task.interval(), "Background task started");
        let mut ticker = tokio::time::interval(task.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(task = task.name(), "Background tick");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = task.tick() => {}
                    }
                }
            }
        }
        info!(task = task.name(), "Background task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        ticks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_ticks_until_cancelled() {
        let task = Arc::new(Counter {
            ticks: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let join = spawn_background(Arc::clone(&task), cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        join.await.unwrap();

        let seen = task.ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {}", seen);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), seen);
    }
}
