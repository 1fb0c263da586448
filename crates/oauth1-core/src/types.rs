//! ============================================================================
//! Core Types for the OAuth 1.0a Client
//! ============================================================================
//! Credentials, signing context, token responses, session phases and the
//! error taxonomy shared by every module.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered key/value map as returned by the token endpoints
pub type ResponseParams = BTreeMap<String, String>;

/// Token and its matching secret.
/// Either both halves are present or the pair does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub token: String,
    pub secret: String,
}

impl TokenPair {
    /// Build a pair, returning None if either half is empty
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let secret = secret.into();
        if token.is_empty() || secret.is_empty() {
            None
        } else {
            Some(Self { token, secret })
        }
    }
}

/// All credential material a session holds
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Temporary credentials from the request-token round trip
    pub request: Option<TokenPair>,
    pub verifier: Option<String>,
    /// Token credentials; `Some` means authorized
    pub access: Option<TokenPair>,
    pub screen_name: String,
    pub user_id: String,
    pub encoded_user_id: String,
    pub user_password: String,
    pub encoded_user_password: String,
}

impl Credentials {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            ..Default::default()
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.access.is_some()
    }

    pub fn request_token(&self) -> Option<&str> {
        self.request.as_ref().map(|p| p.token.as_str())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access.as_ref().map(|p| p.token.as_str())
    }

    /// Consumer key and secret are both set
    pub fn has_consumer(&self) -> bool {
        !self.consumer_key.is_empty() && !self.consumer_secret.is_empty()
    }
}

/// Signature method used for `oauth_signature_method`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureMethod {
    #[default]
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    #[serde(rename = "RSA-SHA1")]
    RsaSha1,
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::RsaSha1 => "RSA-SHA1",
            Self::Plaintext => "PLAINTEXT",
        }
    }

}

impl std::str::FromStr for SignatureMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HMAC-SHA1" | "HMAC" => Ok(Self::HmacSha1),
            "RSA-SHA1" | "RSA" => Ok(Self::RsaSha1),
            "PLAINTEXT" => Ok(Self::Plaintext),
            _ => Err(format!("unknown signature method '{}'", s)),
        }
    }
}

impl fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method that takes part in the signature base string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed reply from the request-token endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTokenResponse {
    pub token: TokenPair,
    pub callback_confirmed: bool,
    /// Every well-formed `key=value` pair of the reply, known or not
    pub params: ResponseParams,
}

/// Parsed reply from the access-token endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AccessTokenResponse {
    pub token: TokenPair,
    pub user_id: Option<String>,
    pub screen_name: Option<String>,
    pub encoded_user_id: Option<String>,
    pub params: ResponseParams,
}

/// Where the authorization flow currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    /// Sticky failure, cleared only by `reset_errors`
    AccessFailed,
    NeedRequestToken,
    AwaitingVerification,
    ReadyForAccessToken,
    Authorized,
}

/// A verifier delivered by the callback listener or typed in by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierSubmission {
    /// Request token the verifier belongs to; None for a bare PIN
    pub token: Option<String>,
    pub verifier: String,
}

/// Error types for the OAuth client
#[derive(Debug, Clone, thiserror::Error)]
pub enum OAuthError {
    #[error("Missing configuration: {0}")]
    MissingConfiguration(&'static str),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("OAuth protocol error: {reason}")]
    Protocol {
        reason: String,
        params: ResponseParams,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request token mismatch: expected {expected}, got {received}")]
    ValidationMismatch { expected: String, received: String },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl OAuthError {
    /// Params carried by a protocol error, if any
    pub fn params(&self) -> Option<&ResponseParams> {
        match self {
            Self::Protocol { params, .. } => Some(params),
            _ => None,
        }
    }
}

/// Shorten a secret for log output
pub(crate) fn redact(value: &str) -> String {
    let shown: String = value.chars().take(6).collect();
    if value.chars().count() > 6 {
        format!("{}...", shown)
    } else {
        shown
    }
}
