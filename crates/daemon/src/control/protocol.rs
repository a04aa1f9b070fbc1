/// Control-port wire format
///
/// Replies are one or more lines of `<code><sep><text>`, where `-` continues
/// a reply, `+` opens a dot-terminated data block and a space ends it. Code
/// 650 marks an asynchronous event rather than a command reply.

use data_encoding::BASE64_NOPAD;
use exitpool_common::{
    CircuitId, ExitPolicy, Fingerprint, RelayDescriptor, StreamEvent, StreamId, StreamStatus,
};
use exitpool_core::LinkError;

pub const CODE_OK: u16 = 250;
pub const CODE_EVENT: u16 = 650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub text: String,

    /// Body of a `+` line, without the terminating dot
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn is_event(&self) -> bool {
        self.code == CODE_EVENT
    }

    /// Text of the final line
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Turn a non-250 reply into an error
    pub fn into_result(self) -> Result<Reply, LinkError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(LinkError::Rejected {
                code: self.code,
                message: self.message().to_string(),
            })
        }
    }

    /// Value of `key=...`, taken from the data block when there is one
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let rest = line.text.strip_prefix(key)?.strip_prefix('=')?;
            Some(line.data.as_deref().unwrap_or(rest))
        })
    }
}

/// Incremental reply assembler fed one line at a time
#[derive(Debug, Default)]
pub struct ReplyReader {
    code: Option<u16>,
    lines: Vec<ReplyLine>,
    data: Option<(String, Vec<String>)>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line without its line ending. Returns the reply once its
    /// final line has been seen.
    pub fn push(&mut self, line: &str) -> Result<Option<Reply>, LinkError> {
        if self.data.is_some() {
            if line == "." {
                if let Some((text, body)) = self.data.take() {
                    self.lines.push(ReplyLine {
                        text,
                        data: Some(body.join("\n")),
                    });
                }
            } else if let Some((_, body)) = self.data.as_mut() {
                // dot-stuffed lines lose their leading dot
                let line = line.strip_prefix('.').unwrap_or(line);
                body.push(line.to_string());
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) {
            return Err(LinkError::protocol(format!("short reply line {:?}", line)));
        }

        let (code, rest) = line.split_at(3);
        let code: u16 = code
            .parse()
            .map_err(|_| LinkError::protocol(format!("bad status code in {:?}", line)))?;
        if self.code.is_some_and(|c| c != code) {
            return Err(LinkError::protocol(format!("status changed mid-reply in {:?}", line)));
        }
        self.code = Some(code);

        let mut chars = rest.chars();
        let separator = chars.next();
        let text = chars.as_str().to_string();

        match separator {
            Some('-') => {
                self.lines.push(ReplyLine { text, data: None });
                Ok(None)
            }
            Some('+') => {
                self.data = Some((text, Vec::new()));
                Ok(None)
            }
            Some(' ') => {
                self.lines.push(ReplyLine { text, data: None });
                let reply = Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                };
                self.code = None;
                Ok(Some(reply))
            }
            _ => Err(LinkError::protocol(format!("bad separator in {:?}", line))),
        }
    }
}

/// Quote a value for use in a command line
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\r' => quoted.push_str("\\r"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// `SETCONF` argument, quoting only when needed
pub fn config_assignment(key: &str, value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "._-:/".contains(c)) {
        format!("{}={}", key, value)
    } else {
        format!("{}={}", key, quote(value))
    }
}

/// Value of `key` from a GETCONF reply; a bare key means the option is unset
pub fn parse_getconf(reply: &Reply, key: &str) -> Option<String> {
    reply.lines.iter().find_map(|line| {
        let (name, value) = match line.text.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (line.text.as_str(), None),
        };
        if !name.eq_ignore_ascii_case(key) {
            return None;
        }
        let value = value?.trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Circuit ids from `GETINFO circuit-status`
pub fn parse_circuit_status(body: &str) -> Vec<CircuitId> {
    body.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|id| CircuitId::new(id).ok())
        .collect()
}

/// Stream ids from `GETINFO stream-status`
pub fn parse_stream_status(body: &str) -> Vec<StreamId> {
    body.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|id| StreamId::new(id).ok())
        .collect()
}

/// Circuit id from the reply to `EXTENDCIRCUIT`
pub fn parse_extended(reply: &Reply) -> Result<CircuitId, LinkError> {
    let text = reply.message();
    text.strip_prefix("EXTENDED ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| CircuitId::new(id).ok())
        .ok_or_else(|| LinkError::protocol(format!("unexpected EXTENDCIRCUIT reply {:?}", text)))
}

/// `CIRC` event status values the client cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Extended,
    Built,
    Failed,
    Closed,
    Other(String),
}

impl CircuitStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "LAUNCHED" => Self::Launched,
            "EXTENDED" => Self::Extended,
            "BUILT" => Self::Built,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Built | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    pub circuit_id: CircuitId,
    pub status: CircuitStatus,

    /// `REASON=` keyword, if present
    pub reason: Option<String>,
}

/// Asynchronous notifications this client subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
    Other(String),
}

/// Decode the first line of a 650 reply
pub fn parse_event(reply: &Reply) -> Event {
    let text = reply.lines.first().map(|l| l.text.as_str()).unwrap_or("");
    let mut words = text.split_whitespace();

    match words.next() {
        Some("CIRC") => {
            let id = words.next().and_then(|id| CircuitId::new(id).ok());
            let status = words.next().map(CircuitStatus::parse);
            let reason = words
                .find_map(|w| w.strip_prefix("REASON="))
                .map(str::to_string);
            match (id, status) {
                (Some(circuit_id), Some(status)) => Event::Circuit(CircuitEvent {
                    circuit_id,
                    status,
                    reason,
                }),
                _ => Event::Other(text.to_string()),
            }
        }
        Some("STREAM") => {
            let id = words.next().and_then(|id| StreamId::new(id).ok());
            let status = words.next().map(|s| s.parse::<StreamStatus>());
            let circuit = words.next();
            let target = words.next().unwrap_or("");
            match (id, status) {
                (Some(stream_id), Some(Ok(status))) => {
                    let mut event = StreamEvent::new(stream_id, status, target);
                    // circuit 0 means not yet attached
                    event.circuit_id = circuit
                        .filter(|c| *c != "0")
                        .and_then(|c| CircuitId::new(c).ok());
                    event.socks_username = words
                        .find_map(|w| w.strip_prefix("SOCKS_USERNAME="))
                        .map(unquote);
                    Event::Stream(event)
                }
                _ => Event::Other(text.to_string()),
            }
        }
        _ => Event::Other(text.to_string()),
    }
}

/// Value of a quoted event keyword argument
fn unquote(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Relay directory from `GETINFO ns/all`
///
/// Each router entry starts with an `r` line carrying the base64 identity;
/// `s` carries flags, `w` the bandwidth weight and `p` the exit port summary.
pub fn parse_network_status(body: &str) -> Vec<RelayDescriptor> {
    let mut relays = Vec::new();
    let mut current: Option<EntryBuilder> = None;

    for line in body.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("r") => {
                if let Some(entry) = current.take() {
                    relays.push(entry.finish());
                }
                let nickname = words.next().unwrap_or_default().to_string();
                let fingerprint = words.next().and_then(decode_identity);
                current = fingerprint.map(|fingerprint| EntryBuilder::new(fingerprint, nickname));
            }
            Some("s") => {
                if let Some(entry) = current.as_mut() {
                    for flag in words {
                        match flag {
                            "Exit" => entry.exit_flag = true,
                            "BadExit" => entry.bad_exit = true,
                            _ => {}
                        }
                    }
                }
            }
            Some("w") => {
                // consensus weight stands in for the descriptor's observed bandwidth
                if let Some(entry) = current.as_mut() {
                    entry.bandwidth = words
                        .find_map(|w| w.strip_prefix("Bandwidth="))
                        .and_then(|b| b.parse().ok())
                        .unwrap_or(0);
                }
            }
            Some("p") => {
                if let Some(entry) = current.as_mut() {
                    let action = words.next();
                    let ports = words.next().unwrap_or("");
                    entry.accepts = Some(action == Some("accept") || ports != "1-65535");
                }
            }
            _ => {}
        }
    }

    if let Some(entry) = current {
        relays.push(entry.finish());
    }
    relays
}

fn decode_identity(encoded: &str) -> Option<Fingerprint> {
    let bytes = BASE64_NOPAD.decode(encoded.trim_end_matches('=').as_bytes()).ok()?;
    Fingerprint::from_slice(&bytes).ok()
}

struct EntryBuilder {
    fingerprint: Fingerprint,
    nickname: String,
    bandwidth: u64,
    exit_flag: bool,
    bad_exit: bool,

    /// From the `p` line; falls back to the Exit flag when absent
    accepts: Option<bool>,
}

impl EntryBuilder {
    fn new(fingerprint: Fingerprint, nickname: String) -> Self {
        Self {
            fingerprint,
            nickname,
            bandwidth: 0,
            exit_flag: false,
            bad_exit: false,
            accepts: None,
        }
    }

    fn finish(self) -> RelayDescriptor {
        let exits = !self.bad_exit && self.accepts.unwrap_or(self.exit_flag);
        let policy = if exits {
            ExitPolicy::AllowsExit
        } else {
            ExitPolicy::RejectAll
        };
        RelayDescriptor::new(self.fingerprint, self.nickname, self.bandwidth, policy)
    }
}
