//! ============================================================================
//! Request Signer - OAuth 1.0a signatures and Authorization headers
//! ============================================================================
//! Builds the normalized parameter string and signature base string
//! (RFC 5849 section 3.4), signs it with HMAC-SHA1, PLAINTEXT or an external
//! RSA-SHA1 signer, and serializes the result two ways:
//! - non-oauth parameters for the request URI or form body
//! - oauth parameters for the `Authorization: OAuth ...` header
//! ============================================================================

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use std::sync::Arc;
use url::Url;

use crate::types::{HttpMethod, OAuthError, SignatureMethod, TokenPair};

/// Everything except RFC 3986 unreserved characters: ALPHA / DIGIT / "-" / "." / "_" / "~"
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const OAUTH_PREFIX: &str = "oauth_";

/// Percent-encode a string according to RFC 3986
pub fn percent_encode(s: &str) -> String {
    utf8_percent_encode(s, OAUTH_ENCODE_SET).to_string()
}

/// RSA-SHA1 primitive supplied by the application (holds the private key)
pub trait RsaSha1Signer: Send + Sync {
    /// Sign the signature base string, returning the raw signature bytes
    fn sign(&self, base_string: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Nonce and timestamp for one signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce {
    pub nonce: String,
    pub timestamp: i64,
}

impl Nonce {
    /// Fresh random nonce stamped with the current time
    pub fn generate() -> Self {
        let nonce = (0..16)
            .map(|_| format!("{:02x}", rand::random::<u8>()))
            .collect();
        Self {
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn fixed(nonce: impl Into<String>, timestamp: i64) -> Self {
        Self {
            nonce: nonce.into(),
            timestamp,
        }
    }
}

/// Output of a signing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Scheme, authority and path of the target, without query
    pub base_url: String,
    /// Non-oauth parameters, encoded and `&`-joined
    pub query: String,
    /// Full `Authorization` header value, starting with `OAuth `
    pub authorization: String,
    /// The string the signature was computed over
    pub base_string: String,
}

impl SignedRequest {
    /// Target URL carrying the non-oauth parameters
    pub fn request_url(&self) -> String {
        if self.query.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}?{}", self.base_url, self.query)
        }
    }
}

/// Signs requests for one consumer
#[derive(Clone)]
pub struct RequestSigner {
    consumer_key: String,
    consumer_secret: String,
    method: SignatureMethod,
    realm: Option<String>,
    rsa: Option<Arc<dyn RsaSha1Signer>>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("consumer_key", &self.consumer_key)
            .field("method", &self.method)
            .field("realm", &self.realm)
            .field("rsa", &self.rsa.is_some())
            .finish()
    }
}

impl RequestSigner {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            method: SignatureMethod::default(),
            realm: None,
            rsa: None,
        }
    }

    pub fn with_method(mut self, method: SignatureMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_realm(mut self, realm: Option<String>) -> Self {
        self.realm = realm.filter(|r| !r.is_empty());
        self
    }

    pub fn with_rsa_signer(mut self, rsa: Option<Arc<dyn RsaSha1Signer>>) -> Self {
        self.rsa = rsa;
        self
    }

    pub fn method(&self) -> SignatureMethod {
        self.method
    }

    /// Name of the first empty consumer field, if any
    pub fn missing_consumer(&self) -> Option<&'static str> {
        if self.consumer_key.is_empty() {
            Some("consumer key")
        } else if self.consumer_secret.is_empty() {
            Some("consumer secret")
        } else {
            None
        }
    }

    /// Sign with a fresh nonce and the current time
    pub fn sign(
        &self,
        http_method: HttpMethod,
        url: &str,
        extra_params: &[(String, String)],
        token: Option<&TokenPair>,
    ) -> Result<SignedRequest, OAuthError> {
        self.sign_with(http_method, url, extra_params, token, &Nonce::generate())
    }

    /// Sign with an explicit nonce and timestamp
    pub fn sign_with(
        &self,
        http_method: HttpMethod,
        url: &str,
        extra_params: &[(String, String)],
        token: Option<&TokenPair>,
        nonce: &Nonce,
    ) -> Result<SignedRequest, OAuthError> {
        if self.consumer_key.is_empty() {
            return Err(OAuthError::Signing("consumer key is empty".into()));
        }
        if self.consumer_secret.is_empty() {
            return Err(OAuthError::Signing("consumer secret is empty".into()));
        }

        let parsed = Url::parse(url)
            .map_err(|e| OAuthError::Signing(format!("invalid URL '{}': {}", url, e)))?;
        let base_url = normalized_base_url(&parsed);

        let mut params: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.extend(extra_params.iter().cloned());

        // Caller-provided oauth values take precedence over generated ones
        let mut add_default = |key: &str, value: String| {
            if !params.iter().any(|(k, _)| k == key) {
                params.push((key.to_string(), value));
            }
        };
        add_default("oauth_consumer_key", self.consumer_key.clone());
        add_default("oauth_nonce", nonce.nonce.clone());
        add_default("oauth_signature_method", self.method.as_str().to_string());
        add_default("oauth_timestamp", nonce.timestamp.to_string());
        add_default("oauth_version", "1.0".to_string());
        if let Some(token) = token {
            add_default("oauth_token", token.token.clone());
        }

        let mut encoded: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k != "oauth_signature")
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .collect();
        encoded.sort();

        let normalized = join_pairs(encoded.iter(), "&", false);
        let base_string = format!(
            "{}&{}&{}",
            http_method.as_str(),
            percent_encode(&base_url),
            percent_encode(&normalized)
        );

        let token_secret = token.map(|t| t.secret.as_str()).unwrap_or("");
        let signature = self.compute_signature(&base_string, token_secret)?;

        let query = join_pairs(
            encoded.iter().filter(|(k, _)| !k.starts_with(OAUTH_PREFIX)),
            "&",
            false,
        );

        let mut header_params: Vec<(String, String)> = encoded
            .iter()
            .filter(|(k, _)| k.starts_with(OAUTH_PREFIX))
            .cloned()
            .collect();
        header_params.push(("oauth_signature".to_string(), percent_encode(&signature)));
        header_params.sort();

        let mut authorization = String::from("OAuth ");
        if let Some(realm) = &self.realm {
            authorization.push_str(&format!("realm=\"{}\", ", realm));
        }
        authorization.push_str(&join_pairs(header_params.iter(), ", ", true));

        Ok(SignedRequest {
            base_url,
            query,
            authorization,
            base_string,
        })
    }

    fn compute_signature(&self, base_string: &str, token_secret: &str) -> Result<String, OAuthError> {
        let key = format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(token_secret)
        );

        match self.method {
            SignatureMethod::HmacSha1 => hmac_sha1(&key, base_string),
            SignatureMethod::Plaintext => Ok(key),
            SignatureMethod::RsaSha1 => {
                let rsa = self
                    .rsa
                    .as_ref()
                    .ok_or_else(|| OAuthError::Signing("RSA-SHA1 selected but no RSA signer configured".into()))?;
                let raw = rsa
                    .sign(base_string.as_bytes())
                    .map_err(|e| OAuthError::Signing(format!("RSA-SHA1 signing failed: {}", e)))?;
                Ok(BASE64.encode(raw))
            }
        }
    }
}

/// Compute HMAC-SHA1 and return base64-encoded result
fn hmac_sha1(key: &str, data: &str) -> Result<String, OAuthError> {
    type HmacSha1 = Hmac<Sha1>;

    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| OAuthError::Signing(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Scheme and host lowercased, default port dropped, no query or fragment
fn normalized_base_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_lowercase();
    // `Url::port` is None for the scheme's default port
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}

fn join_pairs<'a>(
    pairs: impl Iterator<Item = &'a (String, String)>,
    separator: &str,
    quoted: bool,
) -> String {
    pairs
        .map(|(k, v)| {
            if quoted {
                format!("{}=\"{}\"", k, v)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Worked example from the OAuth Core 1.0 specification, appendix A
    fn photos_signer() -> RequestSigner {
        RequestSigner::new("dpf43f3p2l4k3l03", "kd94hf93k423kf44")
    }

    fn photos_token() -> TokenPair {
        TokenPair::new("nnch734d00sl2jdk", "pfkkdhi9sl3r4s00").unwrap()
    }

    fn photos_nonce() -> Nonce {
        Nonce::fixed("kllo9940pd9333jh", 1191242096)
    }

    const PHOTOS_URL: &str = "http://photos.example.net/photos?file=vacation.jpg&size=original";

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("hello world"), "hello%20world");
        assert_eq!(percent_encode("foo=bar&baz"), "foo%3Dbar%26baz");
        assert_eq!(percent_encode("test-value_123.txt"), "test-value_123.txt");
        assert_eq!(percent_encode("~tilde"), "~tilde");
        assert_eq!(percent_encode("a+b*c"), "a%2Bb%2Ac");
    }

    #[test]
    fn test_hmac_sha1_known_signature() {
        let token = photos_token();
        let signed = photos_signer()
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();

        assert_eq!(
            signed.base_string,
            "GET&http%3A%2F%2Fphotos.example.net%2Fphotos&file%3Dvacation.jpg%26\
             oauth_consumer_key%3Ddpf43f3p2l4k3l03%26oauth_nonce%3Dkllo9940pd9333jh%26\
             oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1191242096%26\
             oauth_token%3Dnnch734d00sl2jdk%26oauth_version%3D1.0%26size%3Doriginal"
        );
        assert!(signed
            .authorization
            .contains("oauth_signature=\"tR3%2BTy81lMeYAr%2FFid0kMTYa%2FWM%3D\""));
        assert_eq!(signed.query, "file=vacation.jpg&size=original");
        assert_eq!(
            signed.request_url(),
            "http://photos.example.net/photos?file=vacation.jpg&size=original"
        );
    }

    #[test]
    fn test_signing_is_deterministic_with_fixed_nonce() {
        let signer = photos_signer();
        let token = photos_token();
        let extra = vec![("status".to_string(), "hello there".to_string())];
        let a = signer
            .sign_with(HttpMethod::Post, PHOTOS_URL, &extra, Some(&token), &photos_nonce())
            .unwrap();
        let b = signer
            .sign_with(HttpMethod::Post, PHOTOS_URL, &extra, Some(&token), &photos_nonce())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_http_method_changes_signature() {
        let signer = photos_signer();
        let token = photos_token();
        let get = signer
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();
        let post = signer
            .sign_with(HttpMethod::Post, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();
        assert!(post.base_string.starts_with("POST&"));
        assert_ne!(get.authorization, post.authorization);
    }

    #[test]
    fn test_header_layout() {
        let token = photos_token();
        let signed = photos_signer()
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();

        assert!(signed.authorization.starts_with("OAuth oauth_consumer_key=\"dpf43f3p2l4k3l03\", "));
        assert!(signed.authorization.contains("oauth_token=\"nnch734d00sl2jdk\""));
        assert!(signed.authorization.contains("oauth_version=\"1.0\""));
        // Non-oauth params never leak into the header
        assert!(!signed.authorization.contains("file="));
        assert!(!signed.query.contains("oauth_"));
    }

    #[test]
    fn test_realm_in_header_not_in_base_string() {
        let token = photos_token();
        let signer = photos_signer().with_realm(Some("http://photos.example.net/".into()));
        let signed = signer
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();
        let unrealmed = photos_signer()
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();

        assert!(signed
            .authorization
            .starts_with("OAuth realm=\"http://photos.example.net/\", oauth_consumer_key="));
        assert!(!signed.base_string.contains("realm"));
        assert_eq!(signed.base_string, unrealmed.base_string);
    }

    #[test]
    fn test_realm_query_param_is_kept() {
        // Only the header realm is excluded; a query parameter named realm is ordinary
        let signed = photos_signer()
            .with_realm(Some("Photos".into()))
            .sign_with(
                HttpMethod::Get,
                "http://photos.example.net/photos?realm=x&size=original",
                &[],
                None,
                &photos_nonce(),
            )
            .unwrap();
        assert!(signed.base_string.contains("realm%3Dx"));
        assert!(!signed.base_string.contains("Photos"));
        assert_eq!(signed.query, "realm=x&size=original");
        assert_eq!(
            signed.request_url(),
            "http://photos.example.net/photos?realm=x&size=original"
        );
        assert!(signed.authorization.starts_with("OAuth realm=\"Photos\", "));
    }

    #[test]
    fn test_plaintext_signature() {
        let token = photos_token();
        let signed = photos_signer()
            .with_method(SignatureMethod::Plaintext)
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], Some(&token), &photos_nonce())
            .unwrap();
        assert!(signed
            .authorization
            .contains("oauth_signature=\"kd94hf93k423kf44%26pfkkdhi9sl3r4s00\""));
        assert!(signed
            .authorization
            .contains("oauth_signature_method=\"PLAINTEXT\""));
    }

    struct FixedRsa;

    impl RsaSha1Signer for FixedRsa {
        fn sign(&self, _base_string: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }
    }

    #[test]
    fn test_rsa_requires_collaborator() {
        let result = photos_signer()
            .with_method(SignatureMethod::RsaSha1)
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], None, &photos_nonce());
        assert!(matches!(result, Err(OAuthError::Signing(_))));

        let signed = photos_signer()
            .with_method(SignatureMethod::RsaSha1)
            .with_rsa_signer(Some(Arc::new(FixedRsa)))
            .sign_with(HttpMethod::Get, PHOTOS_URL, &[], None, &photos_nonce())
            .unwrap();
        // base64 of [1, 2, 3] is "AQID"
        assert!(signed.authorization.contains("oauth_signature=\"AQID\""));
    }

    #[test]
    fn test_request_token_call_has_no_token() {
        let extra = vec![
            ("oauth_callback".to_string(), "http://127.0.0.1:9000/".to_string()),
            ("xoauth_displayname".to_string(), "My App".to_string()),
        ];
        let signed = photos_signer()
            .sign_with(
                HttpMethod::Get,
                "https://api.example.com/oauth/request_token?",
                &extra,
                None,
                &photos_nonce(),
            )
            .unwrap();
        assert!(!signed.authorization.contains("oauth_token="));
        assert!(signed
            .authorization
            .contains("oauth_callback=\"http%3A%2F%2F127.0.0.1%3A9000%2F\""));
        assert_eq!(signed.query, "xoauth_displayname=My%20App");
        assert_eq!(
            signed.request_url(),
            "https://api.example.com/oauth/request_token?xoauth_displayname=My%20App"
        );
    }

    #[test]
    fn test_explicit_oauth_param_overrides_generated() {
        let extra = vec![("oauth_nonce".to_string(), "chosen".to_string())];
        let signed = photos_signer()
            .sign_with(HttpMethod::Get, PHOTOS_URL, &extra, None, &photos_nonce())
            .unwrap();
        assert!(signed.authorization.contains("oauth_nonce=\"chosen\""));
        assert!(!signed.authorization.contains("kllo9940pd9333jh"));
    }

    #[test]
    fn test_base_url_normalization() {
        let signed = photos_signer()
            .sign_with(HttpMethod::Get, "HTTPS://Example.COM:443/Path?x=1", &[], None, &photos_nonce())
            .unwrap();
        assert_eq!(signed.base_url, "https://example.com/Path");

        let signed = photos_signer()
            .sign_with(HttpMethod::Get, "http://example.com:8080/a", &[], None, &photos_nonce())
            .unwrap();
        assert_eq!(signed.base_url, "http://example.com:8080/a");
    }

    #[test]
    fn test_rejects_missing_consumer_and_bad_url() {
        let result = RequestSigner::new("", "secret").sign(HttpMethod::Get, PHOTOS_URL, &[], None);
        assert!(matches!(result, Err(OAuthError::Signing(_))));
        let result = RequestSigner::new("key", "").sign(HttpMethod::Get, PHOTOS_URL, &[], None);
        assert!(matches!(result, Err(OAuthError::Signing(_))));
        let result = photos_signer().sign(HttpMethod::Get, "not a url", &[], None);
        assert!(matches!(result, Err(OAuthError::Signing(_))));
    }

    #[test]
    fn test_generated_nonce() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.nonce.len(), 32);
        assert!(a.nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.timestamp > 0);
    }
}
