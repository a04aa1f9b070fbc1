/// HTTP GET over the circuit-scoped SOCKS proxy
///
/// Each exit node gets its own credential pair; the proxy isolates streams
/// by credentials, which keeps a worker's traffic on the circuit its first
/// stream was attached to.

use crate::circuit::StreamOwner;
use async_trait::async_trait;
use exitpool_common::Fingerprint;
use std::time::Duration;
use thiserror::Error;

/// Per-exit proxy credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub http_user: String,
    pub https_user: String,
    pub password: String,
}

impl ProxyCredentials {
    pub fn for_exit(exit: &Fingerprint) -> Self {
        Self {
            http_user: format!("USER-{}-XXX", exit),
            https_user: format!("USER-{}-YYY", exit),
            password: "password".to_string(),
        }
    }

    /// Streams opened with either username belong to this exit's worker
    pub fn stream_owner(&self) -> StreamOwner {
        StreamOwner::with_usernames([self.http_user.clone(), self.https_user.clone()])
    }

    /// Remote DNS resolution so lookups also leave through the circuit
    pub fn http_proxy_url(&self, socks_address: &str) -> String {
        format!("socks5h://{}:{}@{}", self.http_user, self.password, socks_address)
    }

    pub fn https_proxy_url(&self, socks_address: &str) -> String {
        format!("socks5h://{}:{}@{}", self.https_user, self.password, socks_address)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            verify_tls: true,
            timeout,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(String),
}

/// Blocking-style GET collaborator
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// `reqwest` client pinned to one exit node's proxy credentials
pub struct ReqwestFetcher {
    verified: reqwest::Client,
    unverified: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(socks_address: &str, credentials: &ProxyCredentials) -> Result<Self, FetchError> {
        Ok(Self {
            verified: Self::build(socks_address, credentials, true)?,
            unverified: Self::build(socks_address, credentials, false)?,
        })
    }

    fn build(
        socks_address: &str,
        credentials: &ProxyCredentials,
        verify_tls: bool,
    ) -> Result<reqwest::Client, FetchError> {
        let http = reqwest::Proxy::http(credentials.http_proxy_url(socks_address))
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let https = reqwest::Proxy::https(credentials.https_proxy_url(socks_address))
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        reqwest::Client::builder()
            .proxy(http)
            .proxy(https)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(error.to_string())
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let client = if request.verify_tls {
            &self.verified
        } else {
            &self.unverified
        };

        let mut builder = client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;
        let url = response.url().to_string();
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;

        Ok(FetchResponse { url, status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_scoped_to_exit() {
        let a = Fingerprint::from_bytes([0xAA; 20]);
        let b = Fingerprint::from_bytes([0xBB; 20]);

        let creds = ProxyCredentials::for_exit(&a);
        assert_eq!(creds.http_user, format!("USER-{}-XXX", a));
        assert_ne!(creds.http_user, creds.https_user);
        assert_ne!(creds, ProxyCredentials::for_exit(&b));
    }

    #[test]
    fn test_stream_owner_covers_both_usernames() {
        let creds = ProxyCredentials::for_exit(&Fingerprint::from_bytes([0xAA; 20]));
        let owner = creds.stream_owner();
        assert_eq!(owner.usernames(), &[creds.http_user.clone(), creds.https_user.clone()]);

        let other = ProxyCredentials::for_exit(&Fingerprint::from_bytes([0xBB; 20]));
        assert!(!other.stream_owner().usernames().contains(&creds.https_user));
    }

    #[test]
    fn test_proxy_urls_use_remote_dns() {
        let creds = ProxyCredentials::for_exit(&Fingerprint::from_bytes([1; 20]));
        let url = creds.https_proxy_url("127.0.0.1:9050");
        assert!(url.starts_with("socks5h://USER-"));
        assert!(url.ends_with("-YYY:password@127.0.0.1:9050"));
    }

    #[test]
    fn test_client_builds_with_socks_proxy() {
        let creds = ProxyCredentials::for_exit(&Fingerprint::from_bytes([2; 20]));
        assert!(ReqwestFetcher::new("127.0.0.1:9050", &creds).is_ok());
    }
}
