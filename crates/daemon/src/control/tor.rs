/// Control-port client for the local anonymizing-network daemon
///
/// One reader task owns the read half of the connection. Asynchronous 650
/// events are routed to circuit-build waiters and stream subscribers; every
/// other reply is handed to the command that is waiting for it. Commands are
/// serialized, so replies arrive in the order the commands were written.

use super::protocol::{self, CircuitStatus, Event, Reply, ReplyReader};
use async_trait::async_trait;
use exitpool_common::{
    CircuitId, ControlAddress, ControlAuth, ControlSettings, Fingerprint, RelayDescriptor,
    StreamEvent, StreamId,
};
use exitpool_core::{ControlLink, LinkError, LinkResult, SubscriptionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Circuit events buffered for build waiters
const CIRCUIT_EVENT_BUFFER: usize = 256;

/// Stream events buffered per subscriber. The reader never waits on a slow
/// subscriber, so a new stream that overflows this is never attached.
const STREAM_EVENT_BUFFER: usize = 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Commander {
    writer: BoxedWriter,
    replies: mpsc::Receiver<Reply>,

    /// Set while a command waits for its reply. Still set on entry means the
    /// previous caller was dropped mid-command and its reply must be skipped.
    in_flight: bool,
}

struct EventRouter {
    circuits: broadcast::Sender<protocol::CircuitEvent>,
    streams: Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>,

    /// Stream events lost to full subscriber buffers
    dropped: AtomicU64,
}

impl EventRouter {
    fn new() -> Self {
        let (circuits, _) = broadcast::channel(CIRCUIT_EVENT_BUFFER);
        Self {
            circuits,
            streams: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    async fn dispatch(&self, reply: Reply) {
        match protocol::parse_event(&reply) {
            Event::Circuit(event) => {
                debug!("Control: circuit {} {:?}", event.circuit_id, event.status);
                // no receivers just means nobody is building right now
                let _ = self.circuits.send(event);
            }
            Event::Stream(event) => {
                debug!("Control: stream {} {:?} {}", event.stream_id, event.status, event.target);
                let streams = self.streams.lock().await;
                for sender in streams.values() {
                    match sender.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            if event.status.awaits_attachment() {
                                error!(
                                    "Control: subscriber full, new stream {} to {} stays unattached",
                                    event.stream_id, event.target
                                );
                            } else {
                                warn!(
                                    "Control: subscriber full, stream event for {} dropped",
                                    event.stream_id
                                );
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!(
                                "Control: subscriber gone, stream event for {} dropped",
                                event.stream_id
                            );
                        }
                    }
                }
            }
            Event::Other(text) => debug!("Control: ignoring event {}", text),
        }
    }

    async fn close(&self) {
        self.streams.lock().await.clear();
    }
}

pub struct TorControlLink {
    auth: ControlAuth,
    commander: Mutex<Commander>,
    router: Arc<EventRouter>,
    next_subscription: AtomicU64,
    reader: JoinHandle<()>,
}

impl TorControlLink {
    /// Connect to the control port described by `settings`
    pub async fn connect(settings: &ControlSettings) -> LinkResult<Self> {
        match &settings.address {
            ControlAddress::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str()).await?;
                info!("Control: connected to {}", address);
                let (reader, writer) = stream.into_split();
                Ok(Self::from_parts(reader, writer, settings.auth.clone()))
            }
            #[cfg(unix)]
            ControlAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                info!("Control: connected to {}", path.display());
                let (reader, writer) = stream.into_split();
                Ok(Self::from_parts(reader, writer, settings.auth.clone()))
            }
            #[cfg(not(unix))]
            ControlAddress::Unix(path) => Err(LinkError::protocol(format!(
                "unix control sockets are not supported here: {}",
                path.display()
            ))),
        }
    }

    /// Run the client over an already established byte stream
    pub fn from_parts<R, W>(reader: R, writer: W, auth: ControlAuth) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (reply_tx, replies) = mpsc::channel(16);
        let router = Arc::new(EventRouter::new());
        let reader = tokio::spawn(read_loop(reader, reply_tx, router.clone()));

        Self {
            auth,
            commander: Mutex::new(Commander {
                writer: Box::new(writer),
                replies,
                in_flight: false,
            }),
            router,
            next_subscription: AtomicU64::new(0),
            reader,
        }
    }

    /// Send one command line and wait for its reply. Non-250 replies are
    /// returned as `LinkError::Rejected`.
    async fn command(&self, line: &str) -> LinkResult<Reply> {
        let mut commander = self.commander.lock().await;

        if commander.in_flight {
            commander.replies.recv().await.ok_or(LinkError::Closed)?;
        }

        // keep arguments such as passwords out of the log
        debug!("Control: > {}", line.split_whitespace().next().unwrap_or(""));
        commander.in_flight = true;
        commander.writer.write_all(line.as_bytes()).await?;
        commander.writer.write_all(b"\r\n").await?;
        commander.writer.flush().await?;

        let reply = commander.replies.recv().await.ok_or(LinkError::Closed)?;
        commander.in_flight = false;
        reply.into_result()
    }

    async fn set_events(&self, streams: bool) -> LinkResult<()> {
        let line = if streams {
            "SETEVENTS CIRC STREAM"
        } else {
            "SETEVENTS CIRC"
        };
        self.command(line).await.map(|_| ())
    }
}

impl Drop for TorControlLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(reader: R, replies: mpsc::Sender<Reply>, router: Arc<EventRouter>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut assembler = ReplyReader::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Control: connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("Control: read failed: {}", e);
                break;
            }
        };

        match assembler.push(line.trim_end_matches('\r')) {
            Ok(Some(reply)) if reply.is_event() => router.dispatch(reply).await,
            Ok(Some(reply)) => {
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Control: {}", e);
                assembler = ReplyReader::new();
            }
        }
    }

    router.close().await;
}

fn data_value<'a>(reply: &'a Reply, key: &str) -> LinkResult<&'a str> {
    reply
        .value(key)
        .ok_or_else(|| LinkError::protocol(format!("reply carries no {}", key)))
}

#[async_trait]
impl ControlLink for TorControlLink {
    async fn authenticate(&self) -> LinkResult<()> {
        let line = match &self.auth {
            ControlAuth::None => "AUTHENTICATE".to_string(),
            ControlAuth::Password { password } => {
                format!("AUTHENTICATE {}", protocol::quote(password))
            }
            ControlAuth::Cookie { path } => {
                let cookie = tokio::fs::read(path).await?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
        };

        self.command(&line).await?;
        // build waiters rely on circuit events from here on
        self.set_events(false).await?;
        Ok(())
    }

    async fn list_circuits(&self) -> LinkResult<Vec<CircuitId>> {
        let reply = self.command("GETINFO circuit-status").await?;
        Ok(protocol::parse_circuit_status(data_value(&reply, "circuit-status")?))
    }

    async fn close_circuit(&self, id: &CircuitId) -> LinkResult<()> {
        self.command(&format!("CLOSECIRCUIT {}", id)).await.map(|_| ())
    }

    async fn list_streams(&self) -> LinkResult<Vec<StreamId>> {
        let reply = self.command("GETINFO stream-status").await?;
        Ok(protocol::parse_stream_status(data_value(&reply, "stream-status")?))
    }

    async fn close_stream(&self, id: &StreamId) -> LinkResult<()> {
        // reason 1: miscellaneous
        self.command(&format!("CLOSESTREAM {} 1", id)).await.map(|_| ())
    }

    async fn get_config(&self, key: &str) -> LinkResult<Option<String>> {
        let reply = self.command(&format!("GETCONF {}", key)).await?;
        Ok(protocol::parse_getconf(&reply, key))
    }

    async fn set_config(&self, key: &str, value: &str) -> LinkResult<()> {
        self.command(&format!("SETCONF {}", protocol::config_assignment(key, value)))
            .await
            .map(|_| ())
    }

    async fn reset_config(&self, key: &str) -> LinkResult<()> {
        self.command(&format!("RESETCONF {}", key)).await.map(|_| ())
    }

    async fn new_circuit(&self, path: &[Fingerprint], await_build: bool) -> LinkResult<CircuitId> {
        // subscribe before asking so the BUILT event cannot slip past
        let mut events = self.router.circuits.subscribe();

        let hops: Vec<String> = path.iter().map(|fp| fp.to_hex()).collect();
        let reply = self
            .command(&format!("EXTENDCIRCUIT 0 {}", hops.join(",")))
            .await?;
        let circuit = protocol::parse_extended(&reply)?;

        if !await_build {
            return Ok(circuit);
        }

        loop {
            match events.recv().await {
                Ok(event) if event.circuit_id == circuit => match event.status {
                    CircuitStatus::Built => return Ok(circuit),
                    CircuitStatus::Failed | CircuitStatus::Closed => {
                        return Err(LinkError::CircuitFailed {
                            circuit,
                            reason: event.reason.unwrap_or_else(|| "closed".to_string()),
                        });
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Control: missed {} circuit events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Closed),
            }
        }
    }

    async fn attach_stream(&self, stream: &StreamId, circuit: &CircuitId) -> LinkResult<()> {
        self.command(&format!("ATTACHSTREAM {} {}", stream, circuit))
            .await
            .map(|_| ())
    }

    async fn subscribe_new_streams(
        &self,
    ) -> LinkResult<(SubscriptionId, mpsc::Receiver<StreamEvent>)> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(STREAM_EVENT_BUFFER);
        self.router.streams.lock().await.insert(id, tx);

        if let Err(e) = self.set_events(true).await {
            self.router.streams.lock().await.remove(&id);
            return Err(e);
        }

        Ok((SubscriptionId(id), rx))
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> LinkResult<()> {
        let remaining = {
            let mut streams = self.router.streams.lock().await;
            streams.remove(&subscription.0);
            streams.len()
        };

        if remaining == 0 {
            self.set_events(false).await?;
        }
        Ok(())
    }

    async fn list_relays(&self) -> LinkResult<Vec<RelayDescriptor>> {
        let reply = self.command("GETINFO ns/all").await?;
        Ok(protocol::parse_network_status(data_value(&reply, "ns/all")?))
    }
}
