/// Worker strategy launched once per attached exit node
///
/// The pool constructs a worker before acquiring its circuit, drives
/// `prime` while the circuit waits for its first stream, and spawns `run`
/// once the circuit is attached. Streams the worker opens later follow it
/// onto the same circuit as long as they carry its `stream_owner`.

mod fetch;
mod http;

pub use fetch::{FetchOutcome, Fetcher};
pub use http::{FetchError, FetchRequest, FetchResponse, HttpFetcher, ProxyCredentials, ReqwestFetcher};

use crate::circuit::StreamOwner;
use crate::pool::PoolHandle;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use exitpool_common::RelayDescriptor;

#[async_trait]
pub trait Worker: Send + 'static {
    /// The exit node this worker is bound to
    fn exit_node(&self) -> &RelayDescriptor;

    /// SOCKS usernames on this worker's streams. Anonymous workers get the
    /// first unowned stream, which is only safe while nothing else opens
    /// connections through the proxy.
    fn stream_owner(&self) -> StreamOwner {
        StreamOwner::anonymous()
    }

    /// Open the stream that claims the pending circuit. The future is
    /// dropped as soon as the attach wait resolves, so a request that must
    /// complete belongs on a spawned task that `run` picks up.
    async fn prime(&mut self) {}

    /// Long-lived fetch loop; must return promptly once `shutdown` fires
    async fn run(self: Box<Self>, shutdown: Shutdown) -> anyhow::Result<()>;
}

/// Builds one worker per exit node
pub trait WorkerFactory: Send + Sync {
    fn create(&self, exit: RelayDescriptor, pool: PoolHandle) -> Box<dyn Worker>;
}
