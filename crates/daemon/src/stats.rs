use async_trait::async_trait;
use exitpool_core::{PoolHandle, PoolStats, Shutdown, StatisticsReporter};
use std::time::Duration;
use tracing::{info, warn};

/// Logs a JSON snapshot of the pool counters at a fixed interval
pub struct LogStatistics {
    interval: Duration,
}

impl LogStatistics {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn render(stats: &PoolStats) -> serde_json::Result<String> {
        serde_json::to_string(stats)
    }
}

#[async_trait]
impl StatisticsReporter for LogStatistics {
    async fn run(&self, pool: PoolHandle, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = ticker.tick() => {}
            }

            let stats = pool.snapshot();
            match Self::render(&stats) {
                Ok(json) => info!("Statistics: {} workers active {}", stats.active_workers, json),
                Err(e) => warn!("Statistics: cannot encode snapshot: {}", e),
            }
        }
    }
}
