pub mod circuit;
pub mod control;
pub mod pool;
pub mod retry;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use circuit::{
    Acquisition, AttachOutcome, CircuitBroker, GuardPicker, NodeSelection, NodeSelector,
    PathSelectionError, Rendezvous, RendezvousError, SkipReason, StreamBinder, StreamOwner,
};
pub use control::{ControlLink, LinkError, LinkResult, SubscriptionId};
pub use pool::{PoolController, PoolHandle, PoolStats, RunSummary, StatisticsReporter};
pub use retry::{Backoff, RetryDecision, RetryError, RetryPolicy};
pub use shutdown::Shutdown;
pub use worker::{
    FetchError, FetchOutcome, FetchRequest, FetchResponse, Fetcher, HttpFetcher, ProxyCredentials,
    ReqwestFetcher, Worker, WorkerFactory,
};
