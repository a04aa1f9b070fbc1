/// Undo log for everything a run changes on the control link
///
/// Entries are recorded as the run applies them and unwound in reverse by
/// `run`, which does its work at most once no matter how often it is called.

use crate::control::{ControlLink, SubscriptionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for each control-link call made while tearing down
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Teardown {
    link: Arc<dyn ControlLink>,
    subscription: Option<SubscriptionId>,
    binder: Option<JoinHandle<()>>,

    /// Option values to put back, in the order they were overridden
    restore: Vec<(String, Option<String>)>,

    done: bool,
}

impl Teardown {
    pub(crate) fn new(link: Arc<dyn ControlLink>) -> Self {
        Self {
            link,
            subscription: None,
            binder: None,
            restore: Vec::new(),
            done: false,
        }
    }

    pub(crate) fn subscribed(&mut self, subscription: SubscriptionId, binder: JoinHandle<()>) {
        self.subscription = Some(subscription);
        self.binder = Some(binder);
    }

    /// Record the value `key` had before the run touched it
    pub(crate) fn remember(&mut self, key: &str, prior: Option<String>) {
        if self.restore.iter().any(|(k, _)| k == key) {
            return;
        }
        self.restore.push((key.to_string(), prior));
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) async fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let Some(subscription) = self.subscription.take() {
            match tokio::time::timeout(STEP_TIMEOUT, self.link.unsubscribe(subscription)).await {
                Ok(Ok(())) => debug!("Teardown: unsubscribed from stream events"),
                Ok(Err(e)) => warn!("Teardown: unsubscribe failed: {}", e),
                Err(_) => warn!("Teardown: unsubscribe timed out"),
            }
        }

        if let Some(binder) = self.binder.take() {
            binder.abort();
        }

        while let Some((key, prior)) = self.restore.pop() {
            let restored = match &prior {
                Some(value) => {
                    tokio::time::timeout(STEP_TIMEOUT, self.link.set_config(&key, value)).await
                }
                None => tokio::time::timeout(STEP_TIMEOUT, self.link.reset_config(&key)).await,
            };

            match restored {
                Ok(Ok(())) => debug!("Teardown: restored {}", key),
                Ok(Err(e)) => warn!("Teardown: restoring {} failed: {}", key, e),
                Err(_) => warn!("Teardown: restoring {} timed out", key),
            }
        }

        info!("Teardown complete");
    }
}
