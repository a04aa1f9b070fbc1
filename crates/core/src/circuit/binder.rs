/// Stream binder
///
/// Drains new-stream notifications from the control link. A stream whose
/// owner is already attached follows it onto its circuit; otherwise the
/// stream may claim the circuit the broker has pending for its owner. One
/// stream claims one pending circuit, and streams nobody is waiting for are
/// left alone.

use super::rendezvous::{AttachOutcome, Rendezvous};
use crate::control::ControlLink;
use exitpool_common::{CircuitId, StreamEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What the binder did with one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindResult {
    /// Not a new stream, or nothing pending for it
    Ignored,

    /// Claimed the pending circuit
    Attached(CircuitId),

    /// Joined the circuit its owner already runs on
    Routed(CircuitId),

    Failed(CircuitId),
}

#[derive(Clone)]
pub struct StreamBinder {
    link: Arc<dyn ControlLink>,
    rendezvous: Arc<Rendezvous>,
}

impl StreamBinder {
    pub fn new(link: Arc<dyn ControlLink>, rendezvous: Arc<Rendezvous>) -> Self {
        Self { link, rendezvous }
    }

    /// Handle a single notification
    pub async fn handle(&self, event: StreamEvent) -> BindResult {
        if !event.status.awaits_attachment() {
            return BindResult::Ignored;
        }

        if let Some(circuit) = self.rendezvous.route(&event).await {
            return match self.link.attach_stream(&event.stream_id, &circuit).await {
                Ok(()) => {
                    debug!(
                        "Binder: stream {} follows its owner to circuit {}",
                        event.stream_id, circuit
                    );
                    BindResult::Routed(circuit)
                }
                Err(e) => {
                    warn!("Attach stream {} to circuit {}: {}", event.stream_id, circuit, e);
                    BindResult::Failed(circuit)
                }
            };
        }

        let Some(pending) = self.rendezvous.claim(&event).await else {
            debug!("Binder: stream {} to {} has no pending circuit", event.stream_id, event.target);
            return BindResult::Ignored;
        };

        let circuit = pending.circuit_id.clone();
        let (result, outcome) = match self.link.attach_stream(&event.stream_id, &circuit).await {
            Ok(()) => {
                debug!("Binder: stream {} -> circuit {}", event.stream_id, circuit);
                self.rendezvous.bind(pending.owner(), &circuit).await;
                (
                    BindResult::Attached(circuit.clone()),
                    AttachOutcome::Attached(event.stream_id.clone()),
                )
            }
            Err(e) => {
                warn!("Attach stream: {}", e);
                (BindResult::Failed(circuit.clone()), AttachOutcome::Failed(e.to_string()))
            }
        };

        if !pending.complete(outcome) {
            debug!("Binder: broker no longer waiting on circuit {}", circuit);
        }

        result
    }

    /// Drain `events` on a dedicated task until the channel closes
    pub fn spawn(self, mut events: mpsc::Receiver<StreamEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            debug!("Binder: notification channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::StreamOwner;
    use crate::testing::ScriptedLink;
    use exitpool_common::{StreamId, StreamStatus};

    fn new_stream(id: &str) -> StreamEvent {
        StreamEvent::new(StreamId::new(id).unwrap(), StreamStatus::New, "example.com:80")
    }

    #[tokio::test]
    async fn test_ignores_when_nothing_pending() {
        let link = Arc::new(ScriptedLink::new(vec![]));
        let binder = StreamBinder::new(link.clone(), Arc::new(Rendezvous::new()));

        assert_eq!(binder.handle(new_stream("1")).await, BindResult::Ignored);
        assert!(link.attachments().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_streams_past_new_state() {
        let link = Arc::new(ScriptedLink::new(vec![]));
        let rendezvous = Arc::new(Rendezvous::new());
        let _wait = rendezvous
            .publish(CircuitId::new("4").unwrap(), StreamOwner::anonymous())
            .await
            .unwrap();
        let binder = StreamBinder::new(link.clone(), rendezvous.clone());

        let mut event = new_stream("1");
        event.status = StreamStatus::Succeeded;

        assert_eq!(binder.handle(event).await, BindResult::Ignored);
        assert!(!rendezvous.is_empty().await);
    }

    #[tokio::test]
    async fn test_one_stream_per_pending_circuit() {
        let link = Arc::new(ScriptedLink::new(vec![]));
        let rendezvous = Arc::new(Rendezvous::new());
        let circuit = CircuitId::new("4").unwrap();
        let wait = rendezvous.publish(circuit.clone(), StreamOwner::anonymous()).await.unwrap();
        let binder = StreamBinder::new(link.clone(), rendezvous.clone());

        assert_eq!(binder.handle(new_stream("1")).await, BindResult::Attached(circuit.clone()));
        assert_eq!(binder.handle(new_stream("2")).await, BindResult::Ignored);

        assert_eq!(
            wait.await.unwrap(),
            AttachOutcome::Attached(StreamId::new("1").unwrap())
        );
        assert_eq!(link.attachments(), vec![(StreamId::new("1").unwrap(), circuit)]);
    }

    #[tokio::test]
    async fn test_failed_attach_still_clears_and_signals() {
        let link = Arc::new(ScriptedLink::new(vec![]).with_attach_failures());
        let rendezvous = Arc::new(Rendezvous::new());
        let circuit = CircuitId::new("4").unwrap();
        let wait = rendezvous.publish(circuit.clone(), StreamOwner::anonymous()).await.unwrap();
        let binder = StreamBinder::new(link, rendezvous.clone());

        assert_eq!(binder.handle(new_stream("1")).await, BindResult::Failed(circuit));
        assert!(rendezvous.is_empty().await);
        assert!(matches!(wait.await.unwrap(), AttachOutcome::Failed(_)));
    }

    fn owned_stream(id: &str, username: &str) -> StreamEvent {
        new_stream(id).with_socks_username(username)
    }

    #[tokio::test]
    async fn test_other_users_streams_leave_pending_circuit_alone() {
        let link = Arc::new(ScriptedLink::new(vec![]));
        let rendezvous = Arc::new(Rendezvous::new());
        let first = CircuitId::new("1").unwrap();
        let second = CircuitId::new("3").unwrap();
        let a = StreamOwner::with_usernames(["USER-A-XXX", "USER-A-YYY"]);
        let b = StreamOwner::with_usernames(["USER-B-XXX", "USER-B-YYY"]);
        let binder = StreamBinder::new(link.clone(), rendezvous.clone());

        let _first_wait = rendezvous.publish(first.clone(), a).await.unwrap();
        assert_eq!(
            binder.handle(owned_stream("2", "USER-A-YYY")).await,
            BindResult::Attached(first.clone())
        );

        // A keeps opening streams while B's circuit waits
        let second_wait = rendezvous.publish(second.clone(), b).await.unwrap();
        assert_eq!(
            binder.handle(owned_stream("4", "USER-A-XXX")).await,
            BindResult::Routed(first.clone())
        );
        assert_eq!(binder.handle(new_stream("5")).await, BindResult::Ignored);
        assert_eq!(rendezvous.pending().await, Some(second.clone()));

        assert_eq!(
            binder.handle(owned_stream("6", "USER-B-YYY")).await,
            BindResult::Attached(second.clone())
        );
        assert_eq!(
            second_wait.await.unwrap(),
            AttachOutcome::Attached(StreamId::new("6").unwrap())
        );
        assert_eq!(
            link.attachments(),
            vec![
                (StreamId::new("2").unwrap(), first.clone()),
                (StreamId::new("4").unwrap(), first),
                (StreamId::new("6").unwrap(), second),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_attach_does_not_bind_owner() {
        let link = Arc::new(ScriptedLink::new(vec![]).with_attach_failures());
        let rendezvous = Arc::new(Rendezvous::new());
        let owner = StreamOwner::with_usernames(["USER-A-YYY"]);
        let _wait = rendezvous.publish(CircuitId::new("4").unwrap(), owner).await.unwrap();
        let binder = StreamBinder::new(link, rendezvous.clone());

        let event = owned_stream("1", "USER-A-YYY");
        assert!(matches!(binder.handle(event.clone()).await, BindResult::Failed(_)));
        assert_eq!(rendezvous.route(&event).await, None);
    }
}
