//! ============================================================================
//! Session Worker - Drive an AuthSession from async code
//! ============================================================================
//! Token exchanges and signed requests block on the network, so every call
//! runs on Tokio's blocking pool with the session behind a mutex.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::session::AuthSession;
use crate::types::{AuthPhase, HttpMethod, VerifierSubmission};

#[derive(Clone)]
pub struct SessionWorker {
    session: Arc<Mutex<AuthSession>>,
    verifier_tx: UnboundedSender<VerifierSubmission>,
}

impl SessionWorker {
    pub fn new(session: AuthSession) -> Self {
        let verifier_tx = session.verifier_sender();
        Self {
            session: Arc::new(Mutex::new(session)),
            verifier_tx,
        }
    }

    /// Run `f` with exclusive access to the session on the blocking pool
    pub async fn with_session<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut AuthSession) -> R + Send + 'static,
        R: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = session
                .lock()
                .map_err(|e| anyhow!("Session lock poisoned: {}", e))?;
            Ok::<R, anyhow::Error>(f(&mut *guard))
        })
        .await
        .map_err(|e| anyhow!("Session task panicked: {}", e))?
    }

    /// One state machine step; returns the phase afterwards
    pub async fn tick(&self) -> Result<AuthPhase> {
        self.with_session(|session| {
            session.tick();
            session.phase()
        })
        .await
    }

    pub async fn phase(&self) -> Result<AuthPhase> {
        self.with_session(|session| session.phase()).await
    }

    /// Tick every `interval` until the session is authorized or has failed
    pub async fn run_until_settled(&self, interval: Duration) -> Result<AuthPhase> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let phase = self.tick().await?;
            debug!("Session phase: {:?}", phase);
            if matches!(phase, AuthPhase::Authorized | AuthPhase::AccessFailed) {
                return Ok(phase);
            }
        }
    }

    /// Hand a verifier to the session; applied on the next tick
    pub fn submit_verifier(&self, token: Option<String>, verifier: &str) -> Result<()> {
        self.verifier_tx
            .send(VerifierSubmission {
                token,
                verifier: verifier.to_string(),
            })
            .map_err(|_| anyhow!("Session is no longer running"))
    }

    pub async fn request(&self, method: HttpMethod, path: &str, query: &str) -> Result<String> {
        let path = path.to_string();
        let query = query.to_string();
        let body = self
            .with_session(move |session| session.request(method, &path, &query))
            .await??;
        Ok(body)
    }

    /// Signed GET; empty string on any failure
    pub async fn get(&self, path: &str, query: &str) -> String {
        self.request(HttpMethod::Get, path, query)
            .await
            .unwrap_or_else(|e| {
                error!("GET {} failed: {}", path, e);
                String::new()
            })
    }

    /// Signed POST; empty string on any failure
    pub async fn post(&self, path: &str, query: &str) -> String {
        self.request(HttpMethod::Post, path, query)
            .await
            .unwrap_or_else(|e| {
                error!("POST {} failed: {}", path, e);
                String::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthConfig;
    use crate::session::BrowserLauncher;
    use crate::transport::{HttpReply, InMemoryTransport};

    struct NoBrowser;

    impl BrowserLauncher for NoBrowser {
        fn open(&self, _url: &str) -> Result<()> {
            Ok(())
        }
    }

    fn worker(transport: &InMemoryTransport) -> SessionWorker {
        let mut config = OAuthConfig::new("https://api.example.com", "ck", "cs");
        config.listener.enabled = false;
        config.callback_url = Some("oob".to_string());
        let session = AuthSession::new(config, Arc::new(transport.clone()))
            .with_browser(Box::new(NoBrowser));
        SessionWorker::new(session)
    }

    #[tokio::test]
    async fn test_worker_drives_flow() {
        let transport = InMemoryTransport::new();
        transport.insert_response(
            "https://api.example.com/oauth/request_token",
            HttpReply::ok("oauth_token=abc&oauth_token_secret=xyz"),
        );
        transport.insert_response(
            "https://api.example.com/oauth/access_token",
            HttpReply::ok("oauth_token=at&oauth_token_secret=as"),
        );
        transport.insert_response("https://api.example.com/1/", HttpReply::ok("[]"));

        let worker = worker(&transport);
        assert_eq!(worker.tick().await.unwrap(), AuthPhase::AwaitingVerification);

        worker.submit_verifier(Some("abc".to_string()), "111").unwrap();
        let phase = worker.run_until_settled(Duration::from_millis(10)).await.unwrap();
        assert_eq!(phase, AuthPhase::Authorized);

        assert_eq!(worker.get("/1/mentions.json", "count=1").await, "[]");
        assert_eq!(worker.post("/1/update.json", "status=hi").await, "[]");
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn test_worker_reports_failure() {
        let transport = InMemoryTransport::new();
        transport.insert_response(
            "https://api.example.com/oauth/request_token",
            HttpReply::ok("oauth_problem=signature_invalid"),
        );

        let worker = worker(&transport);
        let phase = worker.run_until_settled(Duration::from_millis(10)).await.unwrap();
        assert_eq!(phase, AuthPhase::AccessFailed);

        let failed = worker.with_session(|s| s.access_failed()).await.unwrap();
        assert!(failed);
        assert_eq!(worker.get("/1/mentions.json", "").await, "");
    }
}
