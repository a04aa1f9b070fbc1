use crate::{DomainError, Fingerprint};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Control-link identifiers are 1 to 16 alphanumeric characters
const MAX_ID_LEN: usize = 16;

fn validate_id(raw: &str) -> Result<(), DomainError> {
    if raw.is_empty() || raw.len() > MAX_ID_LEN || !raw.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(DomainError::InvalidIdentifier(raw.to_string()));
    }
    Ok(())
}

/// Identifier of a circuit as assigned by the control link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitId(String);

impl CircuitId {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        validate_id(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircuitId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a stream as assigned by the control link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        validate_id(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether a relay's exit policy lets traffic leave the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitPolicy {
    /// Rejects everything; usable only as an inner hop
    RejectAll,

    /// Permits exiting to at least some destinations
    AllowsExit,
}

impl ExitPolicy {
    pub fn is_exiting_allowed(&self) -> bool {
        matches!(self, Self::AllowsExit)
    }
}

/// A relay as published in the network directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Relay identity
    pub fingerprint: Fingerprint,

    /// Operator-chosen nickname, informational only
    pub nickname: String,

    /// Bandwidth relays are ranked by. Control links that only read the
    /// consensus fill this from the consensus weight rather than the
    /// descriptor's self-reported observed bandwidth.
    pub observed_bandwidth: u64,

    /// Exit capability
    pub exit_policy: ExitPolicy,
}

impl RelayDescriptor {
    pub fn new(
        fingerprint: Fingerprint,
        nickname: impl Into<String>,
        observed_bandwidth: u64,
        exit_policy: ExitPolicy,
    ) -> Self {
        Self {
            fingerprint,
            nickname: nickname.into(),
            observed_bandwidth,
            exit_policy,
        }
    }

    pub fn is_exit(&self) -> bool {
        self.exit_policy.is_exiting_allowed()
    }
}

/// Lifecycle state of a stream as reported by the control link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    /// Newly observed; routing not decided yet
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Other(String),
}

impl StreamStatus {
    /// Only freshly opened connection streams wait for a routing decision
    pub fn awaits_attachment(&self) -> bool {
        matches!(self, Self::New)
    }
}

impl FromStr for StreamStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "REMAP" => Self::Remap,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            other => Self::Other(other.to_string()),
        })
    }
}

/// A stream lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub status: StreamStatus,

    /// Circuit the stream is currently on, if any
    pub circuit_id: Option<CircuitId>,

    /// Destination `host:port`
    pub target: String,

    /// Credentials the client presented to the SOCKS proxy, if any
    pub socks_username: Option<String>,
}

impl StreamEvent {
    pub fn new(stream_id: StreamId, status: StreamStatus, target: impl Into<String>) -> Self {
        Self {
            stream_id,
            status,
            circuit_id: None,
            target: target.into(),
            socks_username: None,
        }
    }

    pub fn with_socks_username(mut self, username: impl Into<String>) -> Self {
        self.socks_username = Some(username.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(CircuitId::new("42").is_ok());
        assert!(CircuitId::new("").is_err());
        assert!(CircuitId::new("a b").is_err());
        assert!(StreamId::new("x".repeat(17)).is_err());
    }

    #[test]
    fn test_stream_status_parsing() {
        assert_eq!("NEW".parse::<StreamStatus>().unwrap(), StreamStatus::New);
        assert!(StreamStatus::New.awaits_attachment());
        assert!(!StreamStatus::NewResolve.awaits_attachment());
        assert_eq!(
            "WEIRD".parse::<StreamStatus>().unwrap(),
            StreamStatus::Other("WEIRD".to_string())
        );
    }

    #[test]
    fn test_exit_policy() {
        let fp = Fingerprint::from_bytes([7u8; crate::FINGERPRINT_LEN]);
        let exit = RelayDescriptor::new(fp, "exit", 100, ExitPolicy::AllowsExit);
        let guard = RelayDescriptor::new(fp, "guard", 100, ExitPolicy::RejectAll);
        assert!(exit.is_exit());
        assert!(!guard.is_exit());
    }
}
