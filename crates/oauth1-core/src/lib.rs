//! ============================================================================
//! OAUTH1-CORE: OAuth 1.0a Client
//! ============================================================================
//! This crate handles the client side of three-legged OAuth 1.0a:
//! - Request signing (HMAC-SHA1, PLAINTEXT, RSA-SHA1 via a supplied signer)
//! - Request-token and access-token exchanges
//! - A tick-driven authorization state machine with a local callback listener
//! - Credential persistence in redb
//! ============================================================================

pub mod config;
pub mod exchange;
pub mod listener;
pub mod providers;
pub mod retry;
pub mod session;
pub mod signer;
pub mod store;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use types::*;
pub use config::{EndpointConfig, ListenerConfig, OAuthConfig};
pub use exchange::TokenExchange;
pub use listener::{CallbackHooks, CallbackListener};
pub use retry::RetryConfig;
pub use session::{AuthSession, BrowserLauncher, SystemBrowser};
pub use signer::{Nonce, RequestSigner, RsaSha1Signer, SignedRequest};
pub use store::{CredentialRecord, CredentialStore, MemoryCredentialStore, RedbCredentialStore};
pub use transport::{HttpReply, HttpTransport, InMemoryTransport, ReqwestTransport, TransportConfig};
pub use worker::SessionWorker;
