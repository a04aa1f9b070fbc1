/// Bundled worker: fetches the configured URLs through its exit node
///
/// Every worker talks to the local SOCKS proxy with credentials derived from
/// its exit fingerprint, so all of its requests share the circuit its first
/// stream was attached to.

use anyhow::anyhow;
use async_trait::async_trait;
use exitpool_common::{RelayDescriptor, WorkerSettings};
use exitpool_core::{
    FetchError, FetchOutcome, Fetcher, HttpFetcher, PoolHandle, ProxyCredentials, ReqwestFetcher,
    Shutdown, StreamOwner, Worker, WorkerFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type Connection = Result<Arc<dyn HttpFetcher>, FetchError>;

/// Builds the HTTP collaborator for one exit node
pub type Connector = Arc<dyn Fn(&RelayDescriptor) -> Connection + Send + Sync>;

/// Request started by `prime`. It owns the stream that claimed the
/// circuit, so it has to finish rather than die with the attach wait;
/// aborted only if the worker is dropped without running.
struct PrimedRequest(Option<JoinHandle<FetchOutcome>>);

impl PrimedRequest {
    async fn finish(mut self) -> Option<FetchOutcome> {
        let task = self.0.take()?;
        task.await.ok()
    }
}

impl Drop for PrimedRequest {
    fn drop(&mut self) {
        if let Some(task) = &self.0 {
            task.abort();
        }
    }
}

pub struct FetchWorker {
    exit: RelayDescriptor,
    pool: PoolHandle,
    owner: StreamOwner,
    fetcher: Result<Fetcher, FetchError>,
    probe_url: Option<String>,
    primed: Option<PrimedRequest>,
    urls: Vec<String>,
    pause: Duration,

    /// Only used by `prime`, which gets no shutdown of its own
    shutdown: Shutdown,
}

#[async_trait]
impl Worker for FetchWorker {
    fn exit_node(&self) -> &RelayDescriptor {
        &self.exit
    }

    fn stream_owner(&self) -> StreamOwner {
        self.owner.clone()
    }

    async fn prime(&mut self) {
        let (Ok(fetcher), Some(url)) = (&self.fetcher, &self.probe_url) else {
            return;
        };
        if self.primed.is_some() {
            return;
        }

        let fetcher = fetcher.clone();
        let url = url.clone();
        let shutdown = self.shutdown.clone();
        self.primed = Some(PrimedRequest(Some(tokio::spawn(async move {
            fetcher.fetch_once(&url, &shutdown).await
        }))));
    }

    /// Finish the primed request, then one pass over the target URLs
    async fn run(self: Box<Self>, shutdown: Shutdown) -> anyhow::Result<()> {
        let FetchWorker {
            exit,
            pool,
            fetcher,
            primed,
            urls,
            pause,
            ..
        } = *self;

        if let Some(primed) = primed {
            match primed.finish().await {
                Some(FetchOutcome::Response(response)) => {
                    pool.record_request(response.status < 400);
                    debug!("{}: probe answered {}", exit.fingerprint, response.status);
                }
                Some(FetchOutcome::GaveUp) => {
                    pool.record_request(false);
                    debug!("{}: probe failed", exit.fingerprint);
                }
                Some(FetchOutcome::Cancelled) | None => {}
            }
        }

        let fetcher =
            fetcher.map_err(|e| anyhow!("{}: cannot build HTTP client: {}", exit.fingerprint, e))?;

        if urls.is_empty() {
            info!("{}: no target URLs configured", exit.fingerprint);
            return Ok(());
        }

        for (i, url) in urls.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            match fetcher.fetch(url, &shutdown).await {
                FetchOutcome::Response(response) => {
                    let ok = response.status < 400;
                    pool.record_request(ok);
                    if ok {
                        info!("{}: {} {}", exit.fingerprint, response.status, url);
                    } else {
                        warn!("{}: {} {}", exit.fingerprint, response.status, url);
                    }
                }
                FetchOutcome::GaveUp => {
                    pool.record_request(false);
                    warn!("{}: gave up on {}", exit.fingerprint, url);
                }
                FetchOutcome::Cancelled => break,
            }
        }

        Ok(())
    }
}

pub struct FetchWorkerFactory {
    settings: WorkerSettings,
    shutdown: Shutdown,
    connector: Connector,
}

impl FetchWorkerFactory {
    /// Workers reach the network through the SOCKS proxy in `settings`
    pub fn new(settings: WorkerSettings, shutdown: Shutdown) -> Self {
        let socks_address = settings.socks_address.clone();
        let connector: Connector = Arc::new(move |exit: &RelayDescriptor| -> Connection {
            let credentials = ProxyCredentials::for_exit(&exit.fingerprint);
            let http: Arc<dyn HttpFetcher> =
                Arc::new(ReqwestFetcher::new(&socks_address, &credentials)?);
            Ok(http)
        });

        Self {
            settings,
            shutdown,
            connector,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }
}

impl WorkerFactory for FetchWorkerFactory {
    fn create(&self, exit: RelayDescriptor, pool: PoolHandle) -> Box<dyn Worker> {
        let fetcher = (self.connector)(&exit).map(|http| Fetcher::new(http, &self.settings));
        let owner = ProxyCredentials::for_exit(&exit.fingerprint).stream_owner();

        Box::new(FetchWorker {
            exit,
            pool,
            owner,
            fetcher,
            probe_url: self.settings.probe_url.clone(),
            primed: None,
            urls: self.settings.urls.clone(),
            pause: self.settings.pause(),
            shutdown: self.shutdown.clone(),
        })
    }
}
