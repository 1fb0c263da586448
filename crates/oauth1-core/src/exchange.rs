//! ============================================================================
//! Token Exchange - Request-token and access-token round trips
//! ============================================================================
//! Both calls are signed GETs. Replies are `key=value&...` bodies; known
//! fields are picked out by exact key and everything well-formed is kept in
//! the returned params map.
//! ============================================================================

use percent_encoding::percent_decode_str;
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::signer::RequestSigner;
use crate::transport::HttpTransport;
use crate::types::{
    redact, AccessTokenResponse, HttpMethod, OAuthError, RequestTokenResponse, ResponseParams,
    TokenPair,
};

/// Parse a form-style token reply. Segments without exactly one `=` are
/// skipped.
pub fn parse_response(body: &str) -> ResponseParams {
    let mut params = ResponseParams::new();
    for segment in body.trim().split('&').filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = segment.split('=').collect();
        if parts.len() != 2 {
            warn!("Return parameter did not have 2 values: {} - skipping", segment);
            continue;
        }
        params.insert(decode(parts[0]), decode(parts[1]));
    }
    params
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Performs the two OAuth round trips for one consumer
pub struct TokenExchange<'a> {
    transport: &'a dyn HttpTransport,
    signer: &'a RequestSigner,
    endpoints: &'a EndpointConfig,
}

impl<'a> TokenExchange<'a> {
    pub fn new(
        transport: &'a dyn HttpTransport,
        signer: &'a RequestSigner,
        endpoints: &'a EndpointConfig,
    ) -> Self {
        Self {
            transport,
            signer,
            endpoints,
        }
    }

    /// Obtain temporary credentials. `callback_url` becomes `oauth_callback`;
    /// `extra_params` are passed through untouched.
    pub fn obtain_request_token(
        &self,
        callback_url: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<RequestTokenResponse, OAuthError> {
        if self.endpoints.request_token_url.is_empty() {
            return Err(OAuthError::MissingConfiguration("request token URL"));
        }
        if let Some(field) = self.signer.missing_consumer() {
            return Err(OAuthError::MissingConfiguration(field));
        }

        let mut params = Vec::with_capacity(extra_params.len() + 1);
        if let Some(callback) = callback_url.filter(|c| !c.is_empty()) {
            params.push(("oauth_callback".to_string(), callback.to_string()));
        }
        params.extend(extra_params.iter().cloned());

        let reply = self.send(&self.endpoints.request_token_url, &params, None)?;

        let mut token = None;
        let mut secret = None;
        let mut callback_confirmed = false;
        for (key, value) in &reply {
            match key.as_str() {
                "oauth_token" => token = Some(value.clone()),
                "oauth_token_secret" => secret = Some(value.clone()),
                "oauth_callback_confirmed" => callback_confirmed = parse_flag(value),
                "oauth_problem" => error!("Got oauth problem: {}", value),
                _ => debug!("Got an unknown parameter: {}={}", key, value),
            }
        }

        let token = Self::require_pair(token, secret, "Request", &reply)?;
        info!("Obtained request token {}", redact(&token.token));

        Ok(RequestTokenResponse {
            token,
            callback_confirmed,
            params: reply,
        })
    }

    /// Exchange the authorized request token and verifier for token credentials
    pub fn obtain_access_token(
        &self,
        request: &TokenPair,
        verifier: &str,
    ) -> Result<AccessTokenResponse, OAuthError> {
        if self.endpoints.access_token_url.is_empty() {
            return Err(OAuthError::MissingConfiguration("access token URL"));
        }
        if let Some(field) = self.signer.missing_consumer() {
            return Err(OAuthError::MissingConfiguration(field));
        }
        if request.token.is_empty() {
            return Err(OAuthError::MissingConfiguration("request token"));
        }
        if request.secret.is_empty() {
            return Err(OAuthError::MissingConfiguration("request token secret"));
        }
        if verifier.is_empty() {
            return Err(OAuthError::MissingConfiguration("request token verifier"));
        }

        let params = vec![("oauth_verifier".to_string(), verifier.to_string())];
        let reply = self.send(&self.endpoints.access_token_url, &params, Some(request))?;

        let mut token = None;
        let mut secret = None;
        let mut user_id = None;
        let mut screen_name = None;
        let mut encoded_user_id = None;
        for (key, value) in &reply {
            match key.as_str() {
                "oauth_token" => token = Some(value.clone()),
                "oauth_token_secret" => secret = Some(value.clone()),
                "user_id" => user_id = Some(value.clone()),
                "screen_name" => screen_name = Some(value.clone()),
                "encoded_user_id" => encoded_user_id = Some(value.clone()),
                "oauth_problem" => error!("Got oauth problem: {}", value),
                _ => debug!("Got an unknown parameter: {}={}", key, value),
            }
        }

        let token = Self::require_pair(token, secret, "Access", &reply)?;
        info!("Obtained access token {}", redact(&token.token));

        Ok(AccessTokenResponse {
            token,
            user_id,
            screen_name,
            encoded_user_id,
            params: reply,
        })
    }

    fn send(
        &self,
        url: &str,
        params: &[(String, String)],
        token: Option<&TokenPair>,
    ) -> Result<ResponseParams, OAuthError> {
        let signed = self.signer.sign(HttpMethod::Get, url, params, token)?;
        let request_url = signed.request_url();
        debug!("Token request: {}", request_url);

        let headers = vec![("Authorization".to_string(), signed.authorization)];
        let reply = self.transport.get(&request_url, &headers)?;
        if !reply.is_success() {
            warn!("Token endpoint answered HTTP {}: {}", reply.status, reply.body);
        }
        if reply.body.trim().is_empty() {
            debug!("Token endpoint returned an empty body");
        }
        Ok(parse_response(&reply.body))
    }

    fn require_pair(
        token: Option<String>,
        secret: Option<String>,
        kind: &str,
        reply: &ResponseParams,
    ) -> Result<TokenPair, OAuthError> {
        let token = token.unwrap_or_default();
        let secret = secret.unwrap_or_default();
        if secret.is_empty() {
            warn!("{} token secret not returned", kind);
        }
        if token.is_empty() {
            warn!("{} token not returned", kind);
        }

        TokenPair::new(token, secret).ok_or_else(|| {
            let reason = match reply.get("oauth_problem") {
                Some(problem) => format!("{} token rejected: {}", kind, problem),
                None => format!("{} token response missing token or secret", kind),
            };
            OAuthError::Protocol {
                reason,
                params: reply.clone(),
            }
        })
    }
}
