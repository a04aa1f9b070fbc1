/// Circuit broker
///
/// Builds a two-hop circuit for one exit node and waits until the stream
/// binder has paired it with its worker's next new stream. Acquisitions must
/// be issued one at a time: the rendezvous holds a single pending circuit.

use super::rendezvous::{AttachOutcome, Rendezvous, StreamOwner};
use crate::control::ControlLink;
use crate::shutdown::Shutdown;
use exitpool_common::{CircuitId, PoolError, RelayDescriptor, StreamId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why an exit node was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BuildFailed(String),
    BuildTimedOut,
    AttachFailed(String),
    AttachTimedOut,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildFailed(e) => write!(f, "creation failed: {}", e),
            Self::BuildTimedOut => write!(f, "creation timed out"),
            Self::AttachFailed(e) => write!(f, "attach failed: {}", e),
            Self::AttachTimedOut => write!(f, "attaching circuit timed out"),
        }
    }
}

/// Outcome of one `acquire_circuit` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Attached { circuit: CircuitId, stream: StreamId },
    Skipped(SkipReason),
}

impl Acquisition {
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }
}

pub struct CircuitBroker {
    link: Arc<dyn ControlLink>,
    rendezvous: Arc<Rendezvous>,
    build_timeout: Duration,
    attach_timeout: Duration,
}

impl CircuitBroker {
    pub fn new(
        link: Arc<dyn ControlLink>,
        rendezvous: Arc<Rendezvous>,
        build_timeout: Duration,
        attach_timeout: Duration,
    ) -> Self {
        Self {
            link,
            rendezvous,
            build_timeout,
            attach_timeout,
        }
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Build `entry -> exit` and wait for one of `owner`'s streams to be
    /// attached to it.
    ///
    /// `kick` is polled alongside the attach wait so the caller can open the
    /// stream that claims the circuit; it is dropped once the wait resolves.
    /// Per-node failures come back as `Acquisition::Skipped`; only
    /// cancellation is an error.
    pub async fn acquire_circuit<K>(
        &self,
        entry: &RelayDescriptor,
        exit: &RelayDescriptor,
        owner: StreamOwner,
        kick: K,
        shutdown: &Shutdown,
    ) -> Result<Acquisition, PoolError>
    where
        K: Future<Output = ()>,
    {
        if let Some(stale) = self.rendezvous.clear().await {
            warn!("Broker: dropping stale pending circuit {}", stale);
        }

        let path = [entry.fingerprint, exit.fingerprint];
        let built = tokio::select! {
            _ = shutdown.wait() => return Err(PoolError::Cancelled),
            built = tokio::time::timeout(self.build_timeout, self.link.new_circuit(&path, true)) => built,
        };

        let circuit = match built {
            Ok(Ok(circuit)) => circuit,
            Ok(Err(e)) => {
                warn!("{}: !!! Creation failed: {}", exit.fingerprint, e);
                return Ok(Acquisition::Skipped(SkipReason::BuildFailed(e.to_string())));
            }
            Err(_) => {
                warn!("{}: !!! Creation timed out after {:?}", exit.fingerprint, self.build_timeout);
                return Ok(Acquisition::Skipped(SkipReason::BuildTimedOut));
            }
        };

        debug!("{}: circuit {} built via {}", exit.fingerprint, circuit, entry.fingerprint);

        let signal = match self.rendezvous.publish(circuit.clone(), owner).await {
            Ok(signal) => signal,
            Err(e) => {
                warn!("{}: cannot publish circuit: {}", exit.fingerprint, e);
                self.discard(&circuit).await;
                return Ok(Acquisition::Skipped(SkipReason::AttachFailed(e.to_string())));
            }
        };

        let wait = tokio::time::timeout(self.attach_timeout, signal);
        tokio::pin!(wait);
        tokio::pin!(kick);
        let mut kicked = false;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    self.rendezvous.withdraw(&circuit).await;
                    return Err(PoolError::Cancelled);
                }
                outcome = &mut wait => break outcome,
                _ = &mut kick, if !kicked => kicked = true,
            }
        };

        let reason = match outcome {
            Ok(Ok(AttachOutcome::Attached(stream))) => {
                info!("{}: stream {} attached to circuit {}", exit.fingerprint, stream, circuit);
                return Ok(Acquisition::Attached { circuit, stream });
            }
            Ok(Ok(AttachOutcome::Failed(e))) => SkipReason::AttachFailed(e),
            Ok(Err(_)) => SkipReason::AttachFailed("stream binder stopped".to_string()),
            Err(_) => SkipReason::AttachTimedOut,
        };

        warn!("{}: {}", exit.fingerprint, reason);
        self.rendezvous.withdraw(&circuit).await;
        self.discard(&circuit).await;
        Ok(Acquisition::Skipped(reason))
    }

    async fn discard(&self, circuit: &CircuitId) {
        if let Err(e) = self.link.close_circuit(circuit).await {
            debug!("Broker: closing unused circuit {} failed: {}", circuit, e);
        }
    }
}
