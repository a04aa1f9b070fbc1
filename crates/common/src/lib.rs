use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    CircuitSettings, ConfigError, ControlAddress, ControlAuth, ControlSettings, GuardPolicy,
    PoolConfig, StatsSettings, TimeoutPolicy, WorkerSettings,
};
pub use error::{PoolError, Result};

type DomainResult<T> = std::result::Result<T, DomainError>;
pub use types::{CircuitId, ExitPolicy, RelayDescriptor, StreamEvent, StreamId, StreamStatus};

/// Relay identity digests are SHA-1 sized
pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidFingerprint { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprintHex(String),
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Relay identity as published in the directory
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> DomainResult<Self> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(DomainError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Uppercase hex, the form the control port expects in paths
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Accepts an optional leading `$` and either case
    pub fn from_hex(hex_str: &str) -> DomainResult<Self> {
        let trimmed = hex_str.strip_prefix('$').unwrap_or(hex_str);
        let decoded =
            hex::decode(trimmed).map_err(|err| DomainError::InvalidFingerprintHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> DomainResult<Self> {
        Self::from_slice(value)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: String) -> DomainResult<Self> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.to_hex()
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_rejects_wrong_length() {
        let err = Fingerprint::try_from(&[1u8; 16][..]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidFingerprint { .. }));
    }

    #[test]
    fn fingerprint_accepts_dollar_prefix_and_lowercase() {
        let hex_id = "ab".repeat(FINGERPRINT_LEN);
        let parsed: Fingerprint = format!("${}", hex_id).parse().expect("valid fingerprint");
        assert_eq!(parsed.to_string(), hex_id.to_uppercase());
    }

    #[test]
    fn fingerprint_converts_through_string() {
        let fp = Fingerprint::from_bytes([0xAB; FINGERPRINT_LEN]);
        let text = String::from(fp);
        assert_eq!(Fingerprint::try_from(text).unwrap(), fp);
        assert!(Fingerprint::try_from("ab".to_string()).is_err());
    }

    #[test]
    fn fingerprint_rejects_bad_hex() {
        let err = Fingerprint::from_hex("not-hex").unwrap_err();
        assert!(matches!(err, DomainError::InvalidFingerprintHex(_)));
    }
}
