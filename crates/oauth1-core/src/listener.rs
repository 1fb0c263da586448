//! ============================================================================
//! Callback Listener - Local HTTP endpoint for the provider redirect
//! ============================================================================
//! After the user grants access the provider redirects the browser to
//! `http://host:port/?oauth_token=...&oauth_verifier=...`. The listener runs
//! on its own thread, forwards the pair to the session over a channel and
//! answers the browser with a static page.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Header, Request, Response, Server};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::types::VerifierSubmission;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization complete</title>
    <style>
        body { font-family: sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
        .container { text-align: center; padding: 40px; border: 1px solid #ccc; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#x2713; Access granted</h1>
        <p>The application received your verifier. You can close this window.</p>
    </div>
</body>
</html>
"#;

/// Observers for every request the listener receives. All methods default
/// to no-ops.
pub trait CallbackHooks: Send + Sync {
    fn on_request(&self, _method: &str, _url: &str) {}

    fn on_headers(&self, _headers: &[(String, String)]) {}

    fn on_cookies(&self, _cookies: &[(String, String)]) {}

    fn on_query_params(&self, _params: &[(String, String)]) {}

    fn on_post_params(&self, _params: &[(String, String)]) {}
}

/// Running callback server; stopped on `stop()` or drop
pub struct CallbackListener {
    url: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind the configured address and start serving
    pub fn start(
        config: &ListenerConfig,
        sender: UnboundedSender<VerifierSubmission>,
        hooks: Option<Arc<dyn CallbackHooks>>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let server = Server::http(&addr)
            .map_err(|e| anyhow!("Failed to start callback server on {}: {}", addr, e))?;
        let bound = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("Callback server is not bound to an IP address"))?;

        let host = match config.host.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            other => other,
        };
        let url = format!("http://{}:{}/", host, bound.port());

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let doc_root = config.doc_root.clone();
        let handle = std::thread::Builder::new()
            .name("oauth1-callback".to_string())
            .spawn(move || serve(server, flag, doc_root, sender, hooks))
            .map_err(|e| anyhow!("Failed to spawn callback server thread: {}", e))?;

        info!("Callback listener running at {}", url);
        Ok(Self {
            url,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Callback URL to send as `oauth_callback`
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop accepting requests and join the server thread
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                warn!("Callback server thread panicked");
            }
            info!("Callback listener at {} stopped", self.url);
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    server: Server,
    shutdown: Arc<AtomicBool>,
    doc_root: PathBuf,
    sender: UnboundedSender<VerifierSubmission>,
    hooks: Option<Arc<dyn CallbackHooks>>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(request, &doc_root, &sender, hooks.as_deref()),
            Ok(None) => continue,
            Err(e) => {
                warn!("Callback server error: {}", e);
                break;
            }
        }
    }
}

fn handle_request(
    mut request: Request,
    doc_root: &Path,
    sender: &UnboundedSender<VerifierSubmission>,
    hooks: Option<&dyn CallbackHooks>,
) {
    let method = request.method().to_string();
    let url = request.url().to_string();
    debug!("Received callback: {} {}", method, url);

    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|h| (h.field.to_string(), h.value.to_string()))
        .collect();
    let cookies = parse_cookies(&headers);
    let query = parse_query(&url);

    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        warn!("Failed to read callback body: {}", e);
    }
    let post_params: Vec<(String, String)> = url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Some(hooks) = hooks {
        hooks.on_request(&method, &url);
        hooks.on_headers(&headers);
        hooks.on_cookies(&cookies);
        hooks.on_query_params(&query);
        hooks.on_post_params(&post_params);
    }

    let find = |key: &str| {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    };
    // Both halves are required so the session can match the token
    match (find("oauth_token"), find("oauth_verifier")) {
        (Some(token), Some(verifier)) => {
            let submission = VerifierSubmission {
                token: Some(token),
                verifier,
            };
            if sender.send(submission).is_err() {
                warn!("Session is gone; dropping verifier");
            } else {
                info!("Received verifier from callback");
            }
        }
        _ => debug!("Callback without oauth_token and oauth_verifier: {}", url),
    }

    let html = load_page(doc_root);
    let response = match Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
        Ok(header) => Response::from_string(html).with_header(header),
        Err(_) => Response::from_string(html),
    };
    if let Err(e) = request.respond(response) {
        warn!("Failed to answer callback request: {}", e);
    }
}

fn load_page(doc_root: &Path) -> String {
    let index = doc_root.join("index.html");
    match std::fs::read_to_string(&index) {
        Ok(html) => html,
        Err(_) => {
            debug!("No page at {}, serving built-in page", index.display());
            DEFAULT_PAGE.to_string()
        }
    }
}

fn parse_query(url: &str) -> Vec<(String, String)> {
    // Request URLs are origin-form; give them a base so `Url` can parse
    match url::Url::parse(&format!("http://localhost{}", url)) {
        Ok(parsed) => parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(e) => {
            warn!("Failed to parse callback URL {}: {}", url, e);
            Vec::new()
        }
    }
}

fn parse_cookies(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn test_config(doc_root: PathBuf) -> ListenerConfig {
        ListenerConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root,
        }
    }

    fn send_raw(listener: &CallbackListener, raw: &str) -> String {
        let addr = listener
            .url()
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<String>>,
        cookies: Mutex<Vec<(String, String)>>,
        post: Mutex<Vec<(String, String)>>,
    }

    impl CallbackHooks for Recorder {
        fn on_request(&self, method: &str, url: &str) {
            self.requests.lock().unwrap().push(format!("{} {}", method, url));
        }

        fn on_cookies(&self, cookies: &[(String, String)]) {
            self.cookies.lock().unwrap().extend_from_slice(cookies);
        }

        fn on_post_params(&self, params: &[(String, String)]) {
            self.post.lock().unwrap().extend_from_slice(params);
        }
    }

    #[test]
    fn test_forwards_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = CallbackListener::start(&test_config(dir.path().to_path_buf()), tx, None).unwrap();
        assert!(listener.url().starts_with("http://127.0.0.1:"));

        let response = send_raw(
            &listener,
            "GET /?oauth_token=abc&oauth_verifier=111 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("Access granted"));

        let submission = rx.blocking_recv().unwrap();
        assert_eq!(
            submission,
            VerifierSubmission {
                token: Some("abc".to_string()),
                verifier: "111".to_string(),
            }
        );

        listener.stop();
        assert!(!listener.is_running());
    }

    #[test]
    fn test_ignores_requests_without_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = CallbackListener::start(&test_config(dir.path().to_path_buf()), tx, None).unwrap();

        send_raw(
            &listener,
            "GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        drop(listener);
        // Listener (and its sender) are gone, nothing was queued
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_tokenless_callback_queues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = CallbackListener::start(&test_config(dir.path().to_path_buf()), tx, None).unwrap();

        let response = send_raw(
            &listener,
            "GET /?oauth_verifier=forged HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        send_raw(
            &listener,
            "GET /?oauth_token=&oauth_verifier=forged HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        drop(listener);
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_serves_doc_root_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>custom page</p>").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = CallbackListener::start(&test_config(dir.path().to_path_buf()), tx, None).unwrap();

        let response = send_raw(
            &listener,
            "GET /?oauth_verifier=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.contains("<p>custom page</p>"));
    }

    #[test]
    fn test_hooks_see_request_details() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder::default());
        let listener = CallbackListener::start(
            &test_config(dir.path().to_path_buf()),
            tx,
            Some(recorder.clone() as Arc<dyn CallbackHooks>),
        )
        .unwrap();

        let body = "name=jane&mode=test";
        let raw = format!(
            "POST /cb?x=1 HTTP/1.1\r\nHost: localhost\r\nCookie: a=1; b=2\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
        );
        send_raw(&listener, &raw);

        assert_eq!(recorder.requests.lock().unwrap().as_slice(), ["POST /cb?x=1"]);
        assert_eq!(
            recorder.cookies.lock().unwrap().as_slice(),
            [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert_eq!(
            recorder.post.lock().unwrap().as_slice(),
            [("name".to_string(), "jane".to_string()), ("mode".to_string(), "test".to_string())]
        );
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("/?oauth_token=a%2Fb&oauth_verifier=111");
        assert_eq!(params[0], ("oauth_token".to_string(), "a/b".to_string()));
        assert_eq!(params[1], ("oauth_verifier".to_string(), "111".to_string()));
        assert!(parse_query("/").is_empty());
    }
}
