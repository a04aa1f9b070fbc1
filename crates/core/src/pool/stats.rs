use super::PoolHandle;
use crate::shutdown::Shutdown;
use async_trait::async_trait;

/// Background reporter started once per run
///
/// Reads pool counters only. The task is aborted when the run ends, so
/// implementations may loop forever.
#[async_trait]
pub trait StatisticsReporter: Send + Sync {
    async fn run(&self, pool: PoolHandle, shutdown: Shutdown);
}
