/// In-memory collaborators for unit tests

use crate::control::{ControlLink, LinkError, LinkResult, SubscriptionId};
use crate::worker::{FetchError, FetchRequest, FetchResponse, HttpFetcher};
use async_trait::async_trait;
use exitpool_common::{
    CircuitId, ExitPolicy, Fingerprint, RelayDescriptor, StreamEvent, StreamId, StreamStatus,
    FINGERPRINT_LEN,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub fn relay(id: u8, bandwidth: u64, exit: bool) -> RelayDescriptor {
    let policy = if exit {
        ExitPolicy::AllowsExit
    } else {
        ExitPolicy::RejectAll
    };
    RelayDescriptor::new(
        Fingerprint::from_bytes([id; FINGERPRINT_LEN]),
        format!("relay{}", id),
        bandwidth,
        policy,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildBehavior {
    Succeed,
    Fail,
    Hang,
}

#[derive(Default)]
struct LinkState {
    next_id: u64,
    circuits: Vec<CircuitId>,
    streams: Vec<StreamId>,
    config: HashMap<String, String>,
    config_ops: Vec<String>,
    events: Option<mpsc::Sender<StreamEvent>>,
    subscriptions: usize,
    unsubscribes: usize,
    attachments: Vec<(StreamId, CircuitId)>,
    closed_circuits: Vec<CircuitId>,
    closed_streams: Vec<StreamId>,
    built_paths: Vec<Vec<Fingerprint>>,
}

impl LinkState {
    fn allocate(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

/// Scripted control link: circuits build instantly unless told otherwise,
/// streams appear only when a test emits them
pub struct ScriptedLink {
    relays: Vec<RelayDescriptor>,
    builds: HashMap<Fingerprint, BuildBehavior>,
    fail_auth: bool,
    fail_directory: bool,
    fail_subscribe: bool,
    fail_attach: bool,
    state: Mutex<LinkState>,
}

impl ScriptedLink {
    pub fn new(relays: Vec<RelayDescriptor>) -> Self {
        Self {
            relays,
            builds: HashMap::new(),
            fail_auth: false,
            fail_directory: false,
            fail_subscribe: false,
            fail_attach: false,
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn with_build(mut self, exit: Fingerprint, behavior: BuildBehavior) -> Self {
        self.builds.insert(exit, behavior);
        self
    }

    pub fn with_attach_failures(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn with_auth_failure(mut self) -> Self {
        self.fail_auth = true;
        self
    }

    pub fn with_directory_failure(mut self) -> Self {
        self.fail_directory = true;
        self
    }

    pub fn with_subscribe_failure(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    pub fn with_config(self, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .config
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Pretend a previous run left circuits and streams behind
    pub fn with_leftovers(self, circuits: usize, streams: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for _ in 0..circuits {
                let id = CircuitId::new(state.allocate()).unwrap();
                state.circuits.push(id);
            }
            for _ in 0..streams {
                let id = StreamId::new(state.allocate()).unwrap();
                state.streams.push(id);
            }
        }
        self
    }

    /// Simulate a client opening a connection through the proxy
    pub fn emit_new_stream(&self, target: &str) -> StreamId {
        self.emit(target, None)
    }

    /// Same, with the SOCKS username the client authenticated as
    pub fn emit_new_stream_as(&self, username: &str, target: &str) -> StreamId {
        self.emit(target, Some(username))
    }

    fn emit(&self, target: &str, username: Option<&str>) -> StreamId {
        let mut state = self.state.lock().unwrap();
        let id = StreamId::new(state.allocate()).unwrap();
        state.streams.push(id.clone());
        let mut event = StreamEvent::new(id.clone(), StreamStatus::New, target);
        event.socks_username = username.map(str::to_string);
        if let Some(events) = &state.events {
            let _ = events.try_send(event);
        }
        id
    }

    /// Circuit the given stream was attached to, if any
    pub fn circuit_of(&self, stream: &StreamId) -> Option<CircuitId> {
        self.state
            .lock()
            .unwrap()
            .attachments
            .iter()
            .find(|(s, _)| s == stream)
            .map(|(_, c)| c.clone())
    }

    pub fn attachments(&self) -> Vec<(StreamId, CircuitId)> {
        self.state.lock().unwrap().attachments.clone()
    }

    pub fn closed_circuits(&self) -> Vec<CircuitId> {
        self.state.lock().unwrap().closed_circuits.clone()
    }

    pub fn closed_streams(&self) -> Vec<StreamId> {
        self.state.lock().unwrap().closed_streams.clone()
    }

    pub fn built_paths(&self) -> Vec<Vec<Fingerprint>> {
        self.state.lock().unwrap().built_paths.clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.lock().unwrap().unsubscribes
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().config.get(key).cloned()
    }

    /// Every SET/RESET in order
    pub fn config_ops(&self) -> Vec<String> {
        self.state.lock().unwrap().config_ops.clone()
    }
}

fn rejected(message: &str) -> LinkError {
    LinkError::Rejected {
        code: 551,
        message: message.to_string(),
    }
}

#[async_trait]
impl ControlLink for ScriptedLink {
    async fn authenticate(&self) -> LinkResult<()> {
        if self.fail_auth {
            return Err(LinkError::Rejected {
                code: 515,
                message: "Authentication failed".to_string(),
            });
        }
        Ok(())
    }

    async fn list_circuits(&self) -> LinkResult<Vec<CircuitId>> {
        Ok(self.state.lock().unwrap().circuits.clone())
    }

    async fn close_circuit(&self, id: &CircuitId) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.circuits.retain(|c| c != id);
        state.closed_circuits.push(id.clone());
        Ok(())
    }

    async fn list_streams(&self) -> LinkResult<Vec<StreamId>> {
        Ok(self.state.lock().unwrap().streams.clone())
    }

    async fn close_stream(&self, id: &StreamId) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.streams.retain(|s| s != id);
        state.closed_streams.push(id.clone());
        Ok(())
    }

    async fn get_config(&self, key: &str) -> LinkResult<Option<String>> {
        Ok(self.state.lock().unwrap().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.config.insert(key.to_string(), value.to_string());
        state.config_ops.push(format!("SET {}={}", key, value));
        Ok(())
    }

    async fn reset_config(&self, key: &str) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.config.remove(key);
        state.config_ops.push(format!("RESET {}", key));
        Ok(())
    }

    async fn new_circuit(&self, path: &[Fingerprint], _await_build: bool) -> LinkResult<CircuitId> {
        let behavior = path
            .last()
            .and_then(|exit| self.builds.get(exit).copied())
            .unwrap_or(BuildBehavior::Succeed);

        match behavior {
            BuildBehavior::Succeed => {
                let mut state = self.state.lock().unwrap();
                let id = CircuitId::new(state.allocate()).unwrap();
                state.circuits.push(id.clone());
                state.built_paths.push(path.to_vec());
                Ok(id)
            }
            BuildBehavior::Fail => Err(rejected("Circuit build failed")),
            BuildBehavior::Hang => std::future::pending().await,
        }
    }

    async fn attach_stream(&self, stream: &StreamId, circuit: &CircuitId) -> LinkResult<()> {
        if self.fail_attach {
            return Err(rejected("Unknown stream"));
        }
        self.state
            .lock()
            .unwrap()
            .attachments
            .push((stream.clone(), circuit.clone()));
        Ok(())
    }

    async fn subscribe_new_streams(
        &self,
    ) -> LinkResult<(SubscriptionId, mpsc::Receiver<StreamEvent>)> {
        if self.fail_subscribe {
            return Err(rejected("Unrecognized event"));
        }
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        state.events = Some(tx);
        state.subscriptions += 1;
        Ok((SubscriptionId(state.subscriptions as u64), rx))
    }

    async fn unsubscribe(&self, _subscription: SubscriptionId) -> LinkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.events = None;
        state.unsubscribes += 1;
        Ok(())
    }

    async fn list_relays(&self) -> LinkResult<Vec<RelayDescriptor>> {
        if self.fail_directory {
            return Err(LinkError::Closed);
        }
        Ok(self.relays.clone())
    }
}

/// Scripted HTTP collaborator: plays back status codes or errors, then
/// either answers 200 forever or hangs
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<u16, FetchError>>>,
    requests: Mutex<Vec<FetchRequest>>,
    hang_when_done: bool,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<u16, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            hang_when_done: false,
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hang_when_done = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<FetchRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HttpFetcher for ScriptedFetcher {
    async fn get(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();

        let status = match next {
            Some(result) => result?,
            None if self.hang_when_done => std::future::pending().await,
            None => 200,
        };

        Ok(FetchResponse {
            url: request.url.clone(),
            status,
            body: String::new(),
        })
    }
}
