use super::http::{FetchError, FetchRequest, FetchResponse, HttpFetcher};
use crate::retry::{Backoff, RetryDecision, RetryError, RetryPolicy};
use crate::shutdown::Shutdown;
use exitpool_common::{TimeoutPolicy, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How a fetch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Response(FetchResponse),

    /// Timed out under the give-up policy
    GaveUp,

    Cancelled,
}

/// Request loop shared by workers: fixed headers, bounded timeout,
/// endless retry on transient errors and a configurable timeout policy
#[derive(Clone)]
pub struct Fetcher {
    http: Arc<dyn HttpFetcher>,
    user_agent: String,
    timeout: Duration,
    timeout_policy: TimeoutPolicy,
    transient_backoff: Duration,
}

impl Fetcher {
    pub fn new(http: Arc<dyn HttpFetcher>, settings: &WorkerSettings) -> Self {
        Self {
            http,
            user_agent: settings.user_agent.clone(),
            timeout: settings.request_timeout(),
            timeout_policy: settings.timeout_policy,
            transient_backoff: settings.transient_backoff(),
        }
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    fn request(&self, url: &str) -> FetchRequest {
        FetchRequest::get(url, self.timeout).with_header("User-Agent", self.user_agent.as_str())
    }

    /// A single attempt with no retry
    pub async fn fetch_once(&self, url: &str, shutdown: &Shutdown) -> FetchOutcome {
        let request = self.request(url);
        tokio::select! {
            _ = shutdown.wait() => FetchOutcome::Cancelled,
            result = self.http.get(&request) => match result {
                Ok(response) => FetchOutcome::Response(response),
                Err(e) => {
                    warn!("request: {}", e);
                    FetchOutcome::GaveUp
                }
            },
        }
    }

    pub async fn fetch(&self, url: &str, shutdown: &Shutdown) -> FetchOutcome {
        let request = self.request(url);
        let policy = RetryPolicy::infinite(Backoff::Fixed(self.transient_backoff));
        let timeout_policy = self.timeout_policy;

        let result = policy
            .run(
                shutdown,
                |_| self.http.get(&request),
                |error| match error {
                    FetchError::Timeout => match timeout_policy {
                        TimeoutPolicy::GiveUp => RetryDecision::Stop,
                        TimeoutPolicy::RetryAfter { secs } => {
                            RetryDecision::RetryAfter(Duration::from_secs(secs))
                        }
                    },
                    FetchError::Transport(e) => {
                        warn!("request: {}", e);
                        RetryDecision::Retry
                    }
                },
            )
            .await;

        match result {
            Ok(response) => FetchOutcome::Response(response),
            Err(RetryError::Cancelled) => FetchOutcome::Cancelled,
            Err(RetryError::Stopped(_)) | Err(RetryError::Exhausted { .. }) => FetchOutcome::GaveUp,
        }
    }
}
