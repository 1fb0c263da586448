//! ============================================================================
//! Configuration - Endpoints, consumer credentials and listener settings
//! ============================================================================
//! Built in code or from `OAUTH1_*` environment variables. Endpoint URLs are
//! derived from the API base URL unless overridden.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::retry::RetryConfig;
use crate::types::SignatureMethod;

/// Default API name used to key stored credentials
pub const DEFAULT_API_NAME: &str = "GENERIC";

/// Default directory served by the callback listener
pub const DEFAULT_DOC_ROOT: &str = "VerifierCallbackServer/";

/// Make sure parameters can be appended directly to `url`.
/// Empty input stays empty.
pub fn ensure_query_separator(url: &str) -> String {
    if url.is_empty() || url.ends_with('?') || url.ends_with('&') {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&", url)
    } else {
        format!("{}?", url)
    }
}

/// OAuth endpoint URLs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub api_base_url: String,
    pub request_token_url: String,
    pub access_token_url: String,
    pub authorization_url: String,
    /// Sent in the Authorization header only, never signed
    pub realm: Option<String>,
}

impl EndpointConfig {
    /// Derive all endpoints from the API base URL
    pub fn new(api_base_url: &str) -> Self {
        let mut endpoints = Self::default();
        endpoints.set_api_base_url(api_base_url, true);
        endpoints
    }

    /// Use explicit endpoint URLs
    pub fn with_endpoints(
        api_base_url: &str,
        request_token_url: &str,
        access_token_url: &str,
        authorization_url: &str,
    ) -> Self {
        let mut endpoints = Self::default();
        endpoints.set_api_base_url(api_base_url, false);
        endpoints.set_request_token_url(request_token_url);
        endpoints.set_access_token_url(access_token_url);
        endpoints.set_authorization_url(authorization_url);
        endpoints
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        let realm = realm.into();
        self.realm = if realm.is_empty() { None } else { Some(realm) };
        self
    }

    /// Set the base URL, optionally re-deriving the three OAuth endpoints
    pub fn set_api_base_url(&mut self, url: &str, derive_endpoints: bool) {
        self.api_base_url = url.trim_end_matches('/').to_string();
        if derive_endpoints {
            let base = self.api_base_url.clone();
            self.set_request_token_url(&format!("{}/oauth/request_token", base));
            self.set_access_token_url(&format!("{}/oauth/access_token", base));
            self.set_authorization_url(&format!("{}/oauth/authorize", base));
        }
    }

    pub fn set_request_token_url(&mut self, url: &str) {
        self.request_token_url = ensure_query_separator(url);
    }

    pub fn set_access_token_url(&mut self, url: &str) {
        self.access_token_url = ensure_query_separator(url);
    }

    pub fn set_authorization_url(&mut self, url: &str) {
        self.authorization_url = ensure_query_separator(url);
    }
}

/// Local verifier callback listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub enabled: bool,
    /// Interface to bind
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
    /// Directory whose `index.html` is served after the redirect
    pub doc_root: PathBuf,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root: PathBuf::from(DEFAULT_DOC_ROOT),
        }
    }
}

/// Everything needed to run an authorization session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Name the credentials are stored under
    pub api_name: String,
    pub endpoints: EndpointConfig,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub signature_method: SignatureMethod,
    /// Explicit `oauth_callback`, e.g. "oob"; the listener URL wins when it runs
    pub callback_url: Option<String>,
    /// Sent as `xoauth_displayname` on the request-token call
    pub display_name: Option<String>,
    /// Sent as `scope` on the request-token call
    pub scope: Option<String>,
    pub listener: ListenerConfig,
    /// Open the authorization page in the system browser
    pub launch_browser: bool,
    /// PEM bundle used instead of the built-in roots
    pub ca_bundle: Option<PathBuf>,
    /// Credential database path (default ~/.oauth1/credentials.redb)
    pub credentials_path: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl OAuthConfig {
    pub fn new(api_base_url: &str, consumer_key: &str, consumer_secret: &str) -> Self {
        Self {
            api_name: DEFAULT_API_NAME.to_string(),
            endpoints: EndpointConfig::new(api_base_url),
            consumer_key: consumer_key.to_string(),
            consumer_secret: consumer_secret.to_string(),
            signature_method: SignatureMethod::default(),
            callback_url: None,
            display_name: None,
            scope: None,
            listener: ListenerConfig::default(),
            launch_browser: true,
            ca_bundle: None,
            credentials_path: None,
            retry: RetryConfig::default(),
        }
    }

    /// Load from `OAUTH1_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = get("OAUTH1_API_URL").ok_or_else(|| anyhow!("OAUTH1_API_URL is not set"))?;
        let consumer_key = get("OAUTH1_CONSUMER_KEY").unwrap_or_default();
        let consumer_secret = get("OAUTH1_CONSUMER_SECRET").unwrap_or_default();

        let mut config = Self::new(&api_url, &consumer_key, &consumer_secret);

        if let Some(name) = get("OAUTH1_API_NAME") {
            config.api_name = name;
        }
        if let Some(url) = get("OAUTH1_REQUEST_TOKEN_URL") {
            config.endpoints.set_request_token_url(&url);
        }
        if let Some(url) = get("OAUTH1_ACCESS_TOKEN_URL") {
            config.endpoints.set_access_token_url(&url);
        }
        if let Some(url) = get("OAUTH1_AUTHORIZE_URL") {
            config.endpoints.set_authorization_url(&url);
        }
        config.endpoints.realm = get("OAUTH1_REALM");

        if let Some(method) = get("OAUTH1_SIGNATURE_METHOD") {
            config.signature_method = method
                .parse::<SignatureMethod>()
                .map_err(|e| anyhow!("Invalid OAUTH1_SIGNATURE_METHOD: {}", e))?;
        }

        config.callback_url = get("OAUTH1_CALLBACK_URL");
        config.display_name = get("OAUTH1_DISPLAY_NAME");
        config.scope = get("OAUTH1_SCOPE");

        if let Some(flag) = get("OAUTH1_CALLBACK_SERVER") {
            config.listener.enabled = parse_bool(&flag)
                .ok_or_else(|| anyhow!("OAUTH1_CALLBACK_SERVER must be true or false, got '{}'", flag))?;
        }
        if let Some(port) = get("OAUTH1_CALLBACK_PORT") {
            config.listener.port = port
                .parse()
                .map_err(|e| anyhow!("Invalid OAUTH1_CALLBACK_PORT '{}': {}", port, e))?;
        }
        if let Some(root) = get("OAUTH1_CALLBACK_DOC_ROOT") {
            config.listener.doc_root = PathBuf::from(root);
        }
        if let Some(flag) = get("OAUTH1_LAUNCH_BROWSER") {
            config.launch_browser = parse_bool(&flag).unwrap_or(true);
        }

        config.ca_bundle = get("OAUTH1_CA_BUNDLE").map(PathBuf::from);
        config.credentials_path = get("OAUTH1_CREDENTIALS_PATH").map(PathBuf::from);

        Ok(config)
    }

    /// Provider-specific parameters appended to the request-token call
    pub fn request_token_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(name) = self.display_name.as_deref().filter(|s| !s.is_empty()) {
            params.push(("xoauth_displayname".to_string(), name.to_string()));
        }
        if let Some(scope) = self.scope.as_deref().filter(|s| !s.is_empty()) {
            params.push(("scope".to_string(), scope.to_string()));
        }
        params
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_endpoints_derived_from_base() {
        let endpoints = EndpointConfig::new("https://api.example.com/");
        assert_eq!(endpoints.api_base_url, "https://api.example.com");
        assert_eq!(endpoints.request_token_url, "https://api.example.com/oauth/request_token?");
        assert_eq!(endpoints.access_token_url, "https://api.example.com/oauth/access_token?");
        assert_eq!(endpoints.authorization_url, "https://api.example.com/oauth/authorize?");
        assert!(endpoints.realm.is_none());
    }

    #[test]
    fn test_explicit_endpoints_are_kept() {
        let endpoints = EndpointConfig::with_endpoints(
            "https://api.example.com",
            "https://auth.example.com/request",
            "https://auth.example.com/access?v=2",
            "https://auth.example.com/authorize?",
        );
        assert_eq!(endpoints.request_token_url, "https://auth.example.com/request?");
        assert_eq!(endpoints.access_token_url, "https://auth.example.com/access?v=2&");
        assert_eq!(endpoints.authorization_url, "https://auth.example.com/authorize?");
    }

    #[test]
    fn test_query_separator() {
        assert_eq!(ensure_query_separator(""), "");
        assert_eq!(ensure_query_separator("http://a/b"), "http://a/b?");
        assert_eq!(ensure_query_separator("http://a/b?"), "http://a/b?");
        assert_eq!(ensure_query_separator("http://a/b?x=1"), "http://a/b?x=1&");
    }

    #[test]
    fn test_empty_realm_is_none() {
        let endpoints = EndpointConfig::new("https://api.example.com").with_realm("");
        assert!(endpoints.realm.is_none());
        let endpoints = EndpointConfig::new("https://api.example.com").with_realm("Photos");
        assert_eq!(endpoints.realm.as_deref(), Some("Photos"));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("OAUTH1_API_URL", "https://api.example.com"),
            ("OAUTH1_CONSUMER_KEY", "ck"),
            ("OAUTH1_CONSUMER_SECRET", "cs"),
            ("OAUTH1_SIGNATURE_METHOD", "PLAINTEXT"),
            ("OAUTH1_CALLBACK_SERVER", "false"),
            ("OAUTH1_CALLBACK_PORT", "9876"),
            ("OAUTH1_DISPLAY_NAME", "My App"),
            ("OAUTH1_REALM", "Example"),
            ("OAUTH1_ACCESS_TOKEN_URL", "https://other.example.com/access"),
        ]
        .into_iter()
        .collect();

        let config = OAuthConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.consumer_key, "ck");
        assert_eq!(config.consumer_secret, "cs");
        assert_eq!(config.signature_method, SignatureMethod::Plaintext);
        assert!(!config.listener.enabled);
        assert_eq!(config.listener.port, 9876);
        assert_eq!(config.endpoints.realm.as_deref(), Some("Example"));
        assert_eq!(config.endpoints.access_token_url, "https://other.example.com/access?");
        assert_eq!(
            config.endpoints.request_token_url,
            "https://api.example.com/oauth/request_token?"
        );
        assert_eq!(
            config.request_token_params(),
            vec![("xoauth_displayname".to_string(), "My App".to_string())]
        );
    }

    #[test]
    fn test_from_lookup_requires_api_url() {
        assert!(OAuthConfig::from_lookup(|_| None).is_err());
    }

    #[test]
    fn test_from_lookup_rejects_bad_method() {
        let result = OAuthConfig::from_lookup(|k| match k {
            "OAUTH1_API_URL" => Some("https://api.example.com".to_string()),
            "OAUTH1_SIGNATURE_METHOD" => Some("MD5".to_string()),
            _ => None,
        });
        assert!(result.is_err());
    }
}
