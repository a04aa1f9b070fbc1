/// Capability set consumed from the anonymizing network's control link
///
/// Any protocol client that can manage circuits, streams and options and
/// deliver new-stream notifications can drive a pool run.

use async_trait::async_trait;
use exitpool_common::{CircuitId, Fingerprint, RelayDescriptor, StreamEvent, StreamId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Handle identifying one notification subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Command rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Control link closed")]
    Closed,

    #[error("Circuit {circuit} failed: {reason}")]
    CircuitFailed { circuit: CircuitId, reason: String },

    #[error("Malformed reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;

#[async_trait]
pub trait ControlLink: Send + Sync {
    async fn authenticate(&self) -> LinkResult<()>;

    async fn list_circuits(&self) -> LinkResult<Vec<CircuitId>>;

    async fn close_circuit(&self, id: &CircuitId) -> LinkResult<()>;

    async fn list_streams(&self) -> LinkResult<Vec<StreamId>>;

    async fn close_stream(&self, id: &StreamId) -> LinkResult<()>;

    /// Current value of an option, `None` when it is unset
    async fn get_config(&self, key: &str) -> LinkResult<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> LinkResult<()>;

    async fn reset_config(&self, key: &str) -> LinkResult<()>;

    /// Build a circuit through `path`, entry first. With `await_build` the
    /// call resolves only once the link reports the circuit built; callers
    /// bound it with their own timeout.
    async fn new_circuit(&self, path: &[Fingerprint], await_build: bool) -> LinkResult<CircuitId>;

    async fn attach_stream(&self, stream: &StreamId, circuit: &CircuitId) -> LinkResult<()>;

    /// Stream notifications are delivered on the returned channel until
    /// `unsubscribe` is called or the link goes away.
    async fn subscribe_new_streams(
        &self,
    ) -> LinkResult<(SubscriptionId, mpsc::Receiver<StreamEvent>)>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> LinkResult<()>;

    async fn list_relays(&self) -> LinkResult<Vec<RelayDescriptor>>;
}
