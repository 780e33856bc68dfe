//! Scheduled compaction of the embedded store

use crate::core::{CacheError, Compactor};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Once a day
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_RECLAIM_RATIO: f64 = 0.7;

/// Run `compact(reclaim_ratio)` every `interval` until the store closes
///
/// The first run happens one full interval after the call. A failed run is
/// logged and retried on the next tick.
pub fn spawn_compaction(
    hook: Arc<dyn Compactor>,
    interval: Duration,
    reclaim_ratio: f64,
) -> JoinHandle<()> {
    let period = if interval.is_zero() {
        warn!("Zero compaction interval, using {:?}", DEFAULT_INTERVAL);
        DEFAULT_INTERVAL
    } else {
        interval
    };

    info!(
        "Starting compaction task (interval={:?}, reclaim_ratio={})",
        period, reclaim_ratio
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match hook.compact(reclaim_ratio).await {
                Ok(_) => {}
                Err(CacheError::Connection(reason)) => {
                    info!("Stopping compaction task: {}", reason);
                    break;
                }
                Err(e) => warn!("Scheduled compaction failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompactionReport, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCompactor {
        runs: AtomicUsize,
        closed: AtomicBool,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Compactor for CountingCompactor {
        async fn compact(&self, reclaim_ratio: f64) -> Result<CompactionReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(CacheError::Connection("store is closed".to_string()));
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Storage("disk full".to_string()));
            }
            Ok(CompactionReport {
                reclaimable_ratio: reclaim_ratio,
                compacted: false,
                size_before: 0,
                size_after: 0,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_waits_one_interval() {
        let hook = Arc::new(CountingCompactor::default());
        let task = spawn_compaction(hook.clone(), Duration::from_secs(60), 0.7);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hook.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hook.runs.load(Ordering::SeqCst), 2);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_schedule() {
        let hook = Arc::new(CountingCompactor::default());
        hook.failing.store(true, Ordering::SeqCst);
        let task = spawn_compaction(hook.clone(), Duration::from_secs(10), 0.5);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(hook.runs.load(Ordering::SeqCst), 3);
        assert!(!task.is_finished());

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_store_closed() {
        let hook = Arc::new(CountingCompactor::default());
        hook.closed.store(true, Ordering::SeqCst);
        let task = spawn_compaction(hook.clone(), Duration::from_secs(10), 0.5);

        tokio::time::sleep(Duration::from_secs(11)).await;
        task.await.unwrap();
        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);
    }
}
