/// Pool controller
///
/// Runs one pass over the relay directory: prepares the control link for
/// manual stream routing, acquires a circuit per exit node (strictly one at
/// a time), launches a worker on each attached circuit, joins them, and
/// always undoes its control-link changes on the way out.

mod handle;
mod stats;
mod teardown;

pub use handle::{PoolHandle, PoolStats};
pub use stats::StatisticsReporter;

use crate::circuit::{Acquisition, CircuitBroker, GuardPicker, NodeSelector, Rendezvous, SkipReason, StreamBinder};
use crate::control::ControlLink;
use crate::retry::{Backoff, RetryDecision, RetryError, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::worker::WorkerFactory;
use exitpool_common::config::control;
use exitpool_common::{Fingerprint, PoolConfig, PoolError, RelayDescriptor, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use teardown::Teardown;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Attempts per stale circuit or stream close at startup
const CLOSE_ATTEMPTS: u32 = 3;
const CLOSE_BACKOFF: Duration = Duration::from_millis(500);

/// What a completed run did
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub exit_nodes: usize,
    pub launched: Vec<Fingerprint>,
    pub skipped: Vec<(Fingerprint, SkipReason)>,
    pub worker_errors: usize,
}

type WorkerResult = (Fingerprint, anyhow::Result<()>);

pub struct PoolController {
    link: Arc<dyn ControlLink>,
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    statistics: Option<Arc<dyn StatisticsReporter>>,
    shutdown: Shutdown,
    handle: PoolHandle,
}

impl PoolController {
    pub fn new(
        link: Arc<dyn ControlLink>,
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        Self {
            link,
            config,
            factory,
            statistics: None,
            shutdown: Shutdown::new(),
            handle: PoolHandle::new(),
        }
    }

    pub fn with_statistics(mut self, reporter: Arc<dyn StatisticsReporter>) -> Self {
        self.statistics = Some(reporter);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Counters of the current (or last) run
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// One full pass. Only fatal conditions and cancellation are errors;
    /// the control link is restored before either is returned.
    pub async fn run_once(&mut self) -> Result<RunSummary> {
        self.handle = PoolHandle::new();
        let handle = self.handle.clone();

        self.cancellable(self.link.authenticate())
            .await?
            .map_err(|e| PoolError::authentication(e.to_string()))?;
        info!("Pool: authenticated to control link");

        let mut teardown = Teardown::new(self.link.clone());
        let result = self.drive(&handle, &mut teardown).await;
        teardown.run().await;

        match &result {
            Ok(summary) => info!(
                "Pool: run finished, {} of {} exit nodes launched",
                summary.launched.len(),
                summary.exit_nodes
            ),
            Err(PoolError::Cancelled) => info!("Pool: run cancelled"),
            Err(e) => warn!("Pool: run failed: {}", e),
        }
        result
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            _ = self.shutdown.wait() => Err(PoolError::Cancelled),
            value = fut => Ok(value),
        }
    }

    async fn drive(&self, handle: &PoolHandle, teardown: &mut Teardown) -> Result<RunSummary> {
        let (subscription, events) = self
            .cancellable(self.link.subscribe_new_streams())
            .await?
            .map_err(|e| PoolError::subscription(e.to_string()))?;

        let rendezvous = Arc::new(Rendezvous::new());
        let binder = StreamBinder::new(self.link.clone(), rendezvous.clone()).spawn(events);
        teardown.subscribed(subscription, binder);

        self.prepare_link(teardown).await?;

        let relays = self
            .cancellable(self.link.list_relays())
            .await?
            .map_err(|e| PoolError::directory(e.to_string()))?;
        let selection = NodeSelector::select(&relays);
        info!("{} exit nodes found", selection.exits.len());

        if selection.guards.is_empty() && !selection.exits.is_empty() {
            return Err(PoolError::directory("no guard-capable relays in directory"));
        }
        handle.set_exit_nodes(selection.exits.len());

        let stats_task = self.start_statistics(handle);

        let broker = CircuitBroker::new(
            self.link.clone(),
            rendezvous,
            self.config.circuit.build_timeout(),
            self.config.circuit.attach_timeout(),
        );
        let picker = GuardPicker::new(&selection.guards, &self.config.guards);

        let mut summary = RunSummary {
            exit_nodes: selection.exits.len(),
            ..RunSummary::default()
        };
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        let launched = self
            .launch_workers(&selection.exits, &picker, &broker, handle, &mut workers, &mut summary)
            .await;

        let joined = match launched {
            Ok(()) => self.join_workers(&mut workers, &mut summary).await,
            Err(e) => {
                Self::abort_workers(&mut workers).await;
                Err(e)
            }
        };

        if let Some(task) = stats_task {
            task.abort();
        }

        joined.map(|_| summary)
    }

    /// Manual routing, a clean slate, and the timeout overrides
    async fn prepare_link(&self, teardown: &mut Teardown) -> Result<()> {
        let prior = self.read_option(control::LEAVE_STREAMS_UNATTACHED).await?;
        teardown.remember(control::LEAVE_STREAMS_UNATTACHED, prior);
        self.cancellable(self.link.set_config(control::LEAVE_STREAMS_UNATTACHED, "1"))
            .await?
            .map_err(|e| PoolError::control(format!("cannot enable manual stream routing: {}", e)))?;

        if self.config.circuit.close_stale {
            self.close_stale().await?;
        }

        for (key, value) in self.config.circuit.overrides() {
            let prior = self.read_option(key).await?;
            teardown.remember(key, prior);
            if let Err(e) = self.cancellable(self.link.set_config(key, &value)).await? {
                warn!("Pool: setting {}={} failed: {}", key, value, e);
            }
        }

        Ok(())
    }

    async fn read_option(&self, key: &str) -> Result<Option<String>> {
        match self.cancellable(self.link.get_config(key)).await? {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Pool: reading {} failed, will reset it afterwards: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn close_stale(&self) -> Result<()> {
        let policy = RetryPolicy::attempts(CLOSE_ATTEMPTS, Backoff::Fixed(CLOSE_BACKOFF));

        let circuits = self
            .cancellable(self.link.list_circuits())
            .await?
            .map_err(|e| PoolError::control(e.to_string()))?;
        for circuit in &circuits {
            let closed = policy
                .run(&self.shutdown, |_| self.link.close_circuit(circuit), |_| RetryDecision::Retry)
                .await;
            match closed {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => warn!("Pool: closing circuit {} failed: {}", circuit, e),
            }
        }

        let streams = self
            .cancellable(self.link.list_streams())
            .await?
            .map_err(|e| PoolError::control(e.to_string()))?;
        for stream in &streams {
            let closed = policy
                .run(&self.shutdown, |_| self.link.close_stream(stream), |_| RetryDecision::Retry)
                .await;
            match closed {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => warn!("Pool: closing stream {} failed: {}", stream, e),
            }
        }

        debug!("Pool: closed {} circuits and {} streams", circuits.len(), streams.len());
        Ok(())
    }

    fn start_statistics(&self, handle: &PoolHandle) -> Option<JoinHandle<()>> {
        if !self.config.stats.enabled {
            return None;
        }
        let reporter = self.statistics.clone()?;
        let handle = handle.clone();
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move { reporter.run(handle, shutdown).await }))
    }

    async fn launch_workers(
        &self,
        exits: &[RelayDescriptor],
        picker: &GuardPicker<'_>,
        broker: &CircuitBroker,
        handle: &PoolHandle,
        workers: &mut JoinSet<WorkerResult>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for exit in exits {
            if let Some(max) = self.config.workers.max_workers {
                if handle.launched_workers() >= max {
                    info!("Pool: worker ceiling of {} reached", max);
                    break;
                }
            }

            let entry = {
                let mut rng = rand::thread_rng();
                picker.pick(exit, &mut rng)
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}: no entry guard: {}", exit.fingerprint, e);
                    handle.node_skipped();
                    summary
                        .skipped
                        .push((exit.fingerprint, SkipReason::BuildFailed(e.to_string())));
                    continue;
                }
            };

            info!("{}: Attaching circuit", exit.fingerprint);
            let mut worker = self.factory.create(exit.clone(), handle.clone());
            let owner = worker.stream_owner();

            match broker
                .acquire_circuit(entry, exit, owner.clone(), worker.prime(), &self.shutdown)
                .await?
            {
                Acquisition::Attached { circuit, .. } => {
                    info!("{}: Starting on circuit {}", exit.fingerprint, circuit);
                    let active = handle.worker_launched();
                    let fingerprint = exit.fingerprint;
                    let shutdown = self.shutdown.clone();
                    let rendezvous = broker.rendezvous().clone();
                    workers.spawn(async move {
                        let _active = active;
                        let result = worker.run(shutdown).await;
                        rendezvous.release(&owner).await;
                        (fingerprint, result)
                    });
                    summary.launched.push(exit.fingerprint);
                }
                Acquisition::Skipped(reason) => {
                    handle.node_skipped();
                    summary.skipped.push((exit.fingerprint, reason));
                }
            }
        }

        Ok(())
    }

    async fn join_workers(
        &self,
        workers: &mut JoinSet<WorkerResult>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    Self::abort_workers(workers).await;
                    return Err(PoolError::Cancelled);
                }
                next = workers.join_next() => match next {
                    None => return Ok(()),
                    Some(Ok((fingerprint, Ok(())))) => debug!("{}: worker finished", fingerprint),
                    Some(Ok((fingerprint, Err(e)))) => {
                        warn!("{}: worker failed: {}", fingerprint, e);
                        summary.worker_errors += 1;
                    }
                    Some(Err(e)) => {
                        warn!("Pool: worker task ended abnormally: {}", e);
                        summary.worker_errors += 1;
                    }
                },
            }
        }
    }

    async fn abort_workers(workers: &mut JoinSet<WorkerResult>) {
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}
