//! ============================================================================
//! Auth Session - OAuth 1.0a authorization state machine
//! ============================================================================
//! The host calls `tick()` once per loop iteration. Each tick advances the
//! flow by at most one network round trip:
//!
//!   NeedRequestToken -> AwaitingVerification -> ReadyForAccessToken
//!     -> Authorized
//!
//! Any protocol failure moves the session to AccessFailed, where it stays
//! until `reset_errors()`. Verifiers arrive from the callback listener or an
//! out-of-band sender over a channel and are applied only inside `tick()`.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::{ensure_query_separator, OAuthConfig};
use crate::exchange::TokenExchange;
use crate::listener::{CallbackHooks, CallbackListener};
use crate::retry::Backoff;
use crate::signer::{percent_encode, RequestSigner, RsaSha1Signer};
use crate::store::{load_validated, CredentialRecord, CredentialStore, RedbCredentialStore};
use crate::transport::{HttpTransport, ReqwestTransport, TransportConfig};
use crate::types::{
    redact, AuthPhase, Credentials, HttpMethod, OAuthError, TokenPair, VerifierSubmission,
};

/// Opens the authorization URL for the user
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Launches the system default browser
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        open::that(url).map_err(|e| anyhow!("Failed to open browser: {}", e))
    }
}

/// One consumer's authorization flow and authenticated requests
pub struct AuthSession {
    config: OAuthConfig,
    credentials: Credentials,
    signer: RequestSigner,
    transport: Arc<dyn HttpTransport>,
    store: Option<Arc<dyn CredentialStore>>,
    browser: Box<dyn BrowserLauncher>,
    hooks: Option<Arc<dyn CallbackHooks>>,
    listener: Option<CallbackListener>,
    verifier_tx: UnboundedSender<VerifierSubmission>,
    verifier_rx: UnboundedReceiver<VerifierSubmission>,
    backoff: Backoff,
    callback_confirmed: bool,
    verification_requested: bool,
    access_failed: bool,
    access_failed_reported: bool,
    last_error: Option<OAuthError>,
    authorization_url: Option<String>,
}

impl AuthSession {
    pub fn new(config: OAuthConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let credentials = Credentials::new(&config.consumer_key, &config.consumer_secret);
        let signer = RequestSigner::new(&config.consumer_key, &config.consumer_secret)
            .with_method(config.signature_method)
            .with_realm(config.endpoints.realm.clone());
        let (verifier_tx, verifier_rx) = mpsc::unbounded_channel();

        Self {
            config,
            credentials,
            signer,
            transport,
            store: None,
            browser: Box::new(SystemBrowser),
            hooks: None,
            listener: None,
            verifier_tx,
            verifier_rx,
            backoff: Backoff::new(),
            callback_confirmed: false,
            verification_requested: false,
            access_failed: false,
            access_failed_reported: false,
            last_error: None,
            authorization_url: None,
        }
    }

    /// Session with the reqwest transport and the redb store described by
    /// `config`, with any stored credentials loaded
    pub fn from_config(config: OAuthConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&TransportConfig {
            ca_bundle: config.ca_bundle.clone(),
            ..Default::default()
        })?;
        let store = RedbCredentialStore::open(config.credentials_path.as_deref())?;
        Ok(Self::new(config, Arc::new(transport)).with_store(Arc::new(store)))
    }

    /// Attach a credential store and load any matching credentials from it
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        if let Err(e) = self.load_credentials() {
            warn!("Could not load stored credentials: {}", e);
        }
        self
    }

    pub fn with_browser(mut self, browser: Box<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_callback_hooks(mut self, hooks: Arc<dyn CallbackHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Supply the RSA-SHA1 primitive used when the signature method is RSA-SHA1
    pub fn with_rsa_signer(mut self, rsa: Arc<dyn RsaSha1Signer>) -> Self {
        self.signer = self.signer.with_rsa_signer(Some(rsa));
        self
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    pub fn phase(&self) -> AuthPhase {
        if self.access_failed {
            AuthPhase::AccessFailed
        } else if self.credentials.is_authorized() {
            AuthPhase::Authorized
        } else if self.credentials.verifier.is_some() {
            AuthPhase::ReadyForAccessToken
        } else if self.credentials.request.is_some() {
            AuthPhase::AwaitingVerification
        } else {
            AuthPhase::NeedRequestToken
        }
    }

    /// Advance the flow by one step
    pub fn tick(&mut self) {
        self.drain_verifiers();

        if self.access_failed {
            if !self.access_failed_reported {
                match &self.last_error {
                    Some(e) => error!("Access failed for {}: {}", self.config.api_name, e),
                    None => error!("Access failed for {}", self.config.api_name),
                }
                self.access_failed_reported = true;
            }
            return;
        }

        if self.credentials.is_authorized() {
            self.stop_listener();
            return;
        }

        if self.credentials.verifier.is_some() {
            self.verification_requested = false;
            self.stop_listener();
            self.acquire_access_token();
        } else if self.credentials.request.is_none() {
            self.acquire_request_token();
        } else if !self.verification_requested {
            let launch = self.config.launch_browser;
            if let Err(e) = self.request_user_verification("", launch) {
                self.mark_failed(e);
                return;
            }
            self.verification_requested = true;
        }
    }

    fn drain_verifiers(&mut self) {
        while let Ok(submission) = self.verifier_rx.try_recv() {
            let result = match &submission.token {
                Some(token) => self.set_verifier(token, &submission.verifier),
                None => self.set_verifier_unchecked(&submission.verifier),
            };
            if let Err(e) = result {
                warn!("Rejected verifier submission: {}", e);
            }
        }
    }

    fn acquire_request_token(&mut self) {
        if !self.backoff.ready(Instant::now()) {
            return;
        }

        if self.config.listener.enabled && self.listener.is_none() {
            match CallbackListener::start(
                &self.config.listener,
                self.verifier_tx.clone(),
                self.hooks.clone(),
            ) {
                Ok(listener) => self.listener = Some(listener),
                Err(e) => warn!("Callback listener unavailable, continuing without it: {}", e),
            }
        }

        let callback = self
            .listener
            .as_ref()
            .map(|l| l.url().to_string())
            .or_else(|| self.config.callback_url.clone());
        let extra = self.config.request_token_params();

        let result = TokenExchange::new(self.transport.as_ref(), &self.signer, &self.config.endpoints)
            .obtain_request_token(callback.as_deref(), &extra);

        match result {
            Ok(response) => {
                self.backoff.reset();
                self.callback_confirmed = response.callback_confirmed;
                if callback.is_some() && !response.callback_confirmed {
                    warn!("Provider did not confirm the callback URL");
                }
                self.credentials.verifier = None;
                self.credentials.request = Some(response.token);
                self.last_error = None;
            }
            Err(e) => self.handle_exchange_error(e),
        }
    }

    fn acquire_access_token(&mut self) {
        if !self.backoff.ready(Instant::now()) {
            return;
        }

        let request = match self.credentials.request.clone() {
            Some(request) => request,
            None => {
                self.mark_failed(OAuthError::MissingConfiguration("request token"));
                return;
            }
        };
        let verifier = self.credentials.verifier.clone().unwrap_or_default();

        let result = TokenExchange::new(self.transport.as_ref(), &self.signer, &self.config.endpoints)
            .obtain_access_token(&request, &verifier);

        match result {
            Ok(response) => {
                self.backoff.reset();
                self.last_error = None;
                if let Some(user_id) = response.user_id {
                    self.credentials.user_id = user_id;
                }
                if let Some(screen_name) = response.screen_name {
                    self.credentials.screen_name = screen_name;
                }
                if let Some(encoded) = response.encoded_user_id {
                    self.credentials.encoded_user_id = encoded;
                }
                self.credentials.access = Some(response.token);
                info!("Authorized {} as '{}'", self.config.api_name, self.credentials.screen_name);

                if let Err(e) = self.save_credentials() {
                    warn!("Keeping credentials in memory only: {}", e);
                }
            }
            Err(e) => self.handle_exchange_error(e),
        }
    }

    /// Transport errors retry with backoff until the budget is spent;
    /// everything else fails the session immediately
    fn handle_exchange_error(&mut self, e: OAuthError) {
        match e {
            OAuthError::Transport(_) => {
                if self.backoff.record_failure(Instant::now(), &self.config.retry) {
                    warn!("Giving up after {} transport failures", self.backoff.failures());
                    self.mark_failed(e);
                } else {
                    warn!("Token exchange failed, will retry: {}", e);
                    self.last_error = Some(e);
                }
            }
            other => self.mark_failed(other),
        }
    }

    fn mark_failed(&mut self, e: OAuthError) {
        debug!("Marking session failed: {}", e);
        self.access_failed = true;
        self.access_failed_reported = false;
        self.verification_requested = false;
        self.last_error = Some(e);
        self.stop_listener();
    }

    fn stop_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
    }

    /// Clear the sticky failure so the next tick resumes the flow
    pub fn reset_errors(&mut self) {
        self.access_failed = false;
        self.access_failed_reported = false;
        self.last_error = None;
        self.backoff.reset();
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Accept a verifier for `token`, which must be the request token on record
    pub fn set_verifier(&mut self, token: &str, verifier: &str) -> Result<(), OAuthError> {
        let expected = self.credentials.request_token().unwrap_or_default();
        if expected.is_empty() || token != expected {
            warn!(
                "Verifier token {} does not match request token {}",
                redact(token),
                redact(expected)
            );
            return Err(OAuthError::ValidationMismatch {
                expected: expected.to_string(),
                received: token.to_string(),
            });
        }
        self.set_verifier_unchecked(verifier)
    }

    /// Accept a verifier (PIN) for the current request token without a token check
    pub fn set_verifier_unchecked(&mut self, verifier: &str) -> Result<(), OAuthError> {
        if self.credentials.request.is_none() {
            warn!("Verifier received before a request token; ignoring");
            return Err(OAuthError::MissingConfiguration("request token"));
        }
        let verifier = verifier.trim();
        if verifier.is_empty() {
            return Err(OAuthError::MissingConfiguration("request token verifier"));
        }
        self.credentials.verifier = Some(verifier.to_string());
        info!("Verifier received");
        Ok(())
    }

    /// Sender for verifiers obtained outside the listener
    pub fn verifier_sender(&self) -> UnboundedSender<VerifierSubmission> {
        self.verifier_tx.clone()
    }

    /// Build the authorization URL for the current request token and
    /// optionally open it in the browser
    pub fn request_user_verification(
        &mut self,
        additional_params: &str,
        launch_browser: bool,
    ) -> Result<String, OAuthError> {
        if self.config.endpoints.authorization_url.is_empty() {
            return Err(OAuthError::MissingConfiguration("authorization URL"));
        }
        let token = self
            .credentials
            .request_token()
            .ok_or(OAuthError::MissingConfiguration("request token"))?;

        let url = format!(
            "{}oauth_token={}{}",
            self.config.endpoints.authorization_url,
            percent_encode(token),
            additional_params
        );
        info!("Authorize this application at: {}", url);

        if launch_browser {
            if let Err(e) = self.browser.open(&url) {
                warn!("{}; open the URL manually", e);
            }
        }

        self.authorization_url = Some(url.clone());
        Ok(url)
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Load stored credentials for this consumer. Returns whether access
    /// tokens were restored.
    pub fn load_credentials(&mut self) -> Result<bool, OAuthError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(false),
        };
        if self.access_failed {
            warn!("Session has failed; call reset_errors before loading credentials");
            return Ok(false);
        }

        let record = load_validated(
            store.as_ref(),
            &self.config.api_name,
            &self.config.consumer_key,
            &self.config.consumer_secret,
        )
        .map_err(|e| OAuthError::Persistence(e.to_string()))?;

        match record {
            Some(record) => {
                record.apply_to(&mut self.credentials);
                info!("Loaded stored credentials for {}", self.config.api_name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist the current access tokens, if authorized and a store is attached
    pub fn save_credentials(&self) -> Result<(), OAuthError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let record = CredentialRecord::from_credentials(&self.config.api_name, &self.credentials)
            .ok_or(OAuthError::MissingConfiguration("access token"))?;

        store.save(&record).map_err(|e| {
            let err = OAuthError::Persistence(e.to_string());
            error!("{}", err);
            err
        })?;
        info!("Saved credentials for {}", self.config.api_name);
        Ok(())
    }

    /// Drop stored and in-memory access tokens
    pub fn forget_credentials(&mut self) -> Result<bool, OAuthError> {
        self.credentials.access = None;
        self.credentials.request = None;
        self.credentials.verifier = None;
        self.verification_requested = false;
        match &self.store {
            Some(store) => store
                .delete(&self.config.api_name)
                .map_err(|e| OAuthError::Persistence(e.to_string())),
            None => Ok(false),
        }
    }

    /// Install access tokens obtained elsewhere; clears any failure
    pub fn set_access_token(&mut self, access: TokenPair) {
        self.reset_errors();
        self.stop_listener();
        self.credentials.access = Some(access);
    }

    pub fn set_user_password(&mut self, password: &str, encoded: &str) {
        self.credentials.user_password = password.to_string();
        self.credentials.encoded_user_password = encoded.to_string();
    }

    // ========================================================================
    // Authenticated Requests
    // ========================================================================

    /// Signed request against `{api_base_url}{path}?{query}`, returning the body
    pub fn request(&self, method: HttpMethod, path: &str, query: &str) -> Result<String, OAuthError> {
        let base = &self.config.endpoints.api_base_url;
        if base.is_empty() {
            return Err(OAuthError::MissingConfiguration("API base URL"));
        }
        if let Some(field) = self.signer.missing_consumer() {
            return Err(OAuthError::MissingConfiguration(field));
        }
        let access = self
            .credentials
            .access
            .as_ref()
            .ok_or(OAuthError::MissingConfiguration("access token"))?;

        let mut url = if path.is_empty() || path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        };
        if !query.is_empty() {
            url = format!("{}{}", ensure_query_separator(&url), query);
        }

        let signed = self.signer.sign(method, &url, &[], Some(access))?;
        let mut headers = vec![("Authorization".to_string(), signed.authorization.clone())];

        let reply = match method {
            HttpMethod::Get => {
                let request_url = signed.request_url();
                debug!("GET {}", request_url);
                self.transport.get(&request_url, &headers)?
            }
            HttpMethod::Post => {
                headers.push((
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ));
                debug!("POST {}", signed.base_url);
                self.transport.post(&signed.base_url, &signed.query, &headers)?
            }
        };

        if !reply.is_success() {
            warn!("{} {} answered HTTP {}", method, signed.base_url, reply.status);
        }
        Ok(reply.body)
    }

    /// Signed GET; empty string on any failure
    pub fn get(&self, path: &str, query: &str) -> String {
        self.request(HttpMethod::Get, path, query).unwrap_or_else(|e| {
            error!("GET {} failed: {}", path, e);
            String::new()
        })
    }

    /// Signed POST with the query sent as a form body; empty string on any failure
    pub fn post(&self, path: &str, query: &str) -> String {
        self.request(HttpMethod::Post, path, query).unwrap_or_else(|e| {
            error!("POST {} failed: {}", path, e);
            String::new()
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_authorized(&self) -> bool {
        !self.access_failed && self.credentials.is_authorized()
    }

    pub fn access_failed(&self) -> bool {
        self.access_failed
    }

    /// Whether the current failure has been logged
    pub(crate) fn access_failed_reported(&self) -> bool {
        self.access_failed_reported
    }

    pub fn last_error(&self) -> Option<&OAuthError> {
        self.last_error.as_ref()
    }

    pub fn callback_confirmed(&self) -> bool {
        self.callback_confirmed
    }

    pub fn verification_requested(&self) -> bool {
        self.verification_requested
    }

    /// Last authorization URL handed to the user
    pub fn authorization_url(&self) -> Option<&str> {
        self.authorization_url.as_deref()
    }

    /// URL of the running callback listener
    pub fn listener_url(&self) -> Option<&str> {
        self.listener.as_ref().map(|l| l.url())
    }

    pub fn screen_name(&self) -> &str {
        &self.credentials.screen_name
    }

    pub fn user_id(&self) -> &str {
        &self.credentials.user_id
    }

    pub fn encoded_user_id(&self) -> &str {
        &self.credentials.encoded_user_id
    }

    pub fn user_password(&self) -> &str {
        &self.credentials.user_password
    }

    pub fn encoded_user_password(&self) -> &str {
        &self.credentials.encoded_user_password
    }
}
