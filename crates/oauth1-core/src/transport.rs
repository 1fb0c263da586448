//! ============================================================================
//! HTTP Transport - Blocking GET/POST used by the token exchanges and the
//! authenticated request operations
//! ============================================================================
//! `ReqwestTransport` is the production client. TLS trust is configured
//! explicitly through `TransportConfig::ca_bundle`. `InMemoryTransport`
//! replays canned replies and records every request for tests.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{HttpMethod, OAuthError};

/// Header list as (name, value) pairs
pub type Headers = [(String, String)];

/// Status and body of an HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP client interface
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpReply, OAuthError>;

    fn post(&self, url: &str, body: &str, headers: &Headers) -> Result<HttpReply, OAuthError>;
}

/// Settings for the production transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// PEM bundle that replaces the built-in root store
    pub ca_bundle: Option<PathBuf>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ca_bundle: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("oauth1-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// reqwest-backed transport (rustls)
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone());

        if let Some(path) = &config.ca_bundle {
            let pem = std::fs::read(path)
                .map_err(|e| anyhow!("Failed to read CA bundle {}: {}", path.display(), e))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| anyhow!("Invalid CA bundle {}: {}", path.display(), e))?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(cert);
            info!("Using CA bundle: {}", path.display());
        }

        let client = builder
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder, headers: &Headers) -> Result<HttpReply, OAuthError> {
        let request = headers
            .iter()
            .fold(request, |req, (name, value)| req.header(name.as_str(), value.as_str()));

        let response = request
            .send()
            .map_err(|e| OAuthError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| OAuthError::Transport(format!("Failed to read response body: {}", e)))?;

        debug!("HTTP {} ({} bytes)", status, body.len());
        Ok(HttpReply { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpReply, OAuthError> {
        self.send(self.client.get(url), headers)
    }

    fn post(&self, url: &str, body: &str, headers: &Headers) -> Result<HttpReply, OAuthError> {
        self.send(self.client.post(url).body(body.to_string()), headers)
    }
}

/// A request seen by `InMemoryTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct InMemoryState {
    /// (url prefix, canned outcome); the longest matching prefix wins
    replies: Vec<(String, Result<HttpReply, String>)>,
    requests: Vec<RecordedRequest>,
}

/// In-memory transport stub for testing
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` for any URL starting with `prefix`
    pub fn insert_response(&self, prefix: impl Into<String>, reply: HttpReply) {
        self.set(prefix.into(), Ok(reply));
    }

    /// Fail with a transport error for any URL starting with `prefix`
    pub fn insert_failure(&self, prefix: impl Into<String>, reason: impl Into<String>) {
        self.set(prefix.into(), Err(reason.into()));
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    fn set(&self, prefix: String, outcome: Result<HttpReply, String>) {
        let mut state = self.lock();
        state.replies.retain(|(p, _)| *p != prefix);
        state.replies.push((prefix, outcome));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        // A panicking test thread must not hide the recorded requests
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, request: RecordedRequest) -> Result<HttpReply, OAuthError> {
        let mut state = self.lock();
        let outcome = state
            .replies
            .iter()
            .filter(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, outcome)| outcome.clone());
        state.requests.push(request);

        match outcome {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(reason)) => Err(OAuthError::Transport(reason)),
            None => Err(OAuthError::Transport("no mock response for url".into())),
        }
    }
}

impl HttpTransport for InMemoryTransport {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpReply, OAuthError> {
        self.respond(RecordedRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            body: None,
            headers: headers.to_vec(),
        })
    }

    fn post(&self, url: &str, body: &str, headers: &Headers) -> Result<HttpReply, OAuthError> {
        self.respond(RecordedRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            body: Some(body.to_string()),
            headers: headers.to_vec(),
        })
    }
}
