/// Single-slot handoff between the circuit broker and the stream binder
///
/// The broker publishes the circuit it just built together with the owner
/// of the worker waiting on it; the binder hands it to that owner's first
/// new stream and reports how the attach went. At most one circuit is ever
/// pending. Once attached, the owner stays routed to its circuit until the
/// worker is released.

use exitpool_common::{CircuitId, StreamEvent, StreamId};
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};

/// Result of binding a stream to the pending circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(StreamId),
    Failed(String),
}

/// SOCKS usernames a worker's streams carry
///
/// An anonymous owner cannot be told apart from other clients, so its
/// pending circuit goes to the first new stream nobody else owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOwner {
    usernames: Vec<String>,
}

impl StreamOwner {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_usernames<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            usernames: usernames.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.usernames.is_empty()
    }

    pub fn usernames(&self) -> &[String] {
        &self.usernames
    }

    /// Whether `event` was opened with one of this owner's usernames
    pub fn owns(&self, event: &StreamEvent) -> bool {
        event
            .socks_username
            .as_ref()
            .map_or(false, |username| self.usernames.contains(username))
    }
}

/// A circuit waiting for its first stream
#[derive(Debug)]
pub struct PendingCircuit {
    pub circuit_id: CircuitId,
    owner: StreamOwner,
    signal: oneshot::Sender<AttachOutcome>,
}

impl PendingCircuit {
    pub fn owner(&self) -> &StreamOwner {
        &self.owner
    }

    fn claims(&self, event: &StreamEvent) -> bool {
        self.owner.is_anonymous() || self.owner.owns(event)
    }

    /// Fire the attach signal. Returns false if the broker stopped waiting.
    pub fn complete(self, outcome: AttachOutcome) -> bool {
        self.signal.send(outcome).is_ok()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("circuit {0} is still pending")]
    Occupied(CircuitId),
}

#[derive(Debug, Default)]
pub struct Rendezvous {
    slot: Mutex<Option<PendingCircuit>>,

    /// SOCKS username -> circuit its owner was attached to
    routes: Mutex<HashMap<String, CircuitId>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `circuit_id` the pending circuit for `owner`. The returned
    /// receiver is a fresh attach signal; it fires at most once.
    pub async fn publish(
        &self,
        circuit_id: CircuitId,
        owner: StreamOwner,
    ) -> Result<oneshot::Receiver<AttachOutcome>, RendezvousError> {
        let mut slot = self.slot.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(RendezvousError::Occupied(existing.circuit_id.clone()));
        }

        let (signal, wait) = oneshot::channel();
        *slot = Some(PendingCircuit {
            circuit_id,
            owner,
            signal,
        });
        Ok(wait)
    }

    /// Claim the pending circuit for `event`, leaving the slot empty. Streams
    /// the pending owner did not open leave the slot untouched.
    pub async fn claim(&self, event: &StreamEvent) -> Option<PendingCircuit> {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(pending) if pending.claims(event) => slot.take(),
            _ => None,
        }
    }

    /// Keep routing `owner`'s streams to `circuit_id`
    pub async fn bind(&self, owner: &StreamOwner, circuit_id: &CircuitId) {
        let mut routes = self.routes.lock().await;
        for username in owner.usernames() {
            routes.insert(username.clone(), circuit_id.clone());
        }
    }

    /// Circuit an already attached owner's stream belongs on
    pub async fn route(&self, event: &StreamEvent) -> Option<CircuitId> {
        let username = event.socks_username.as_ref()?;
        self.routes.lock().await.get(username).cloned()
    }

    /// Forget `owner` once its worker is done
    pub async fn release(&self, owner: &StreamOwner) {
        let mut routes = self.routes.lock().await;
        for username in owner.usernames() {
            routes.remove(username);
        }
    }

    /// Clear the slot if it still holds `circuit_id`
    pub async fn withdraw(&self, circuit_id: &CircuitId) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(pending) if &pending.circuit_id == circuit_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Clear whatever is pending
    pub async fn clear(&self) -> Option<CircuitId> {
        self.slot.lock().await.take().map(|p| p.circuit_id)
    }

    pub async fn pending(&self) -> Option<CircuitId> {
        self.slot.lock().await.as_ref().map(|p| p.circuit_id.clone())
    }

    pub async fn is_empty(&self) -> bool {
        self.slot.lock().await.is_none()
    }
}
