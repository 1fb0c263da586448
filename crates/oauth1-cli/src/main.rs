// ============================================================================
// oauth1 - authorize against an OAuth 1.0a provider and make signed calls
// ============================================================================
// Usage:
//   oauth1 authorize [--oob] [--no-browser]    Run the authorization flow
//   oauth1 get /1.1/account/settings.json      Signed GET, prints the body
//   oauth1 post /1.1/statuses/update.json --query 'status=hi'
//   oauth1 show [--json]                       Show stored credentials
//   oauth1 forget                              Delete stored credentials
//
// Settings come from OAUTH1_* environment variables (and .env); flags win.
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use oauth1_core::config::DEFAULT_API_NAME;
use oauth1_core::{
    AuthPhase, AuthSession, CredentialRecord, CredentialStore, HttpMethod, OAuthConfig,
    RedbCredentialStore,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// OAuth 1.0a command line client
#[derive(Parser)]
#[command(name = "oauth1", version, about = "Authorize and call OAuth 1.0a APIs")]
struct Cli {
    /// API base URL (overrides OAUTH1_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Consumer key (overrides OAUTH1_CONSUMER_KEY)
    #[arg(long, global = true)]
    consumer_key: Option<String>,

    /// Consumer secret (overrides OAUTH1_CONSUMER_SECRET)
    #[arg(long, global = true)]
    consumer_secret: Option<String>,

    /// Name the credentials are stored under (default: GENERIC)
    #[arg(long, global = true)]
    api_name: Option<String>,

    /// Path to the credentials database (default: ~/.oauth1/credentials.redb)
    #[arg(long, global = true)]
    credentials_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the authorization flow and store the access token
    Authorize {
        /// Out-of-band flow: type the PIN shown by the provider
        #[arg(long)]
        oob: bool,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Callback listener port (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,

        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Signed GET request, prints the response body
    Get {
        /// Path appended to the API base URL
        path: String,

        /// Encoded query string, e.g. 'count=5&since_id=10'
        #[arg(long, default_value = "")]
        query: String,
    },

    /// Signed POST request with a form body, prints the response body
    Post {
        path: String,

        /// Encoded form parameters, e.g. 'status=hello%20world'
        #[arg(long, default_value = "")]
        query: String,
    },

    /// Show stored credentials
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete stored credentials
    Forget,
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn mask(value: &str) -> String {
    if value.is_empty() {
        return "-".to_string();
    }
    let shown: String = value.chars().take(6).collect();
    format!("{}...", shown)
}

fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("oauth1=info".parse()?)
                .add_directive("oauth1_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Authorize {
            oob,
            no_browser,
            port,
            timeout,
        } => cmd_authorize(&cli, *oob, *no_browser, *port, *timeout),
        Commands::Get { path, query } => cmd_request(&cli, HttpMethod::Get, path, query),
        Commands::Post { path, query } => cmd_request(&cli, HttpMethod::Post, path, query),
        Commands::Show { json } => cmd_show(&cli, *json),
        Commands::Forget => cmd_forget(&cli),
    }
}

/// Environment config with command line flags layered on top
fn load_config(cli: &Cli) -> Result<OAuthConfig> {
    let mut config = OAuthConfig::from_lookup(|key| {
        let flag = match key {
            "OAUTH1_API_URL" => cli.api_url.clone(),
            "OAUTH1_CONSUMER_KEY" => cli.consumer_key.clone(),
            "OAUTH1_CONSUMER_SECRET" => cli.consumer_secret.clone(),
            "OAUTH1_API_NAME" => cli.api_name.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })?;
    if let Some(path) = &cli.credentials_path {
        config.credentials_path = Some(path.clone());
    }
    Ok(config)
}

fn api_name(cli: &Cli) -> String {
    cli.api_name
        .clone()
        .or_else(|| std::env::var("OAUTH1_API_NAME").ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_API_NAME.to_string())
}

fn open_store(cli: &Cli) -> Result<RedbCredentialStore> {
    RedbCredentialStore::open(cli.credentials_path.as_deref())
}

fn cmd_authorize(cli: &Cli, oob: bool, no_browser: bool, port: Option<u16>, timeout: u64) -> Result<()> {
    let mut config = load_config(cli)?;
    if oob {
        config.listener.enabled = false;
        config.callback_url = Some("oob".to_string());
    }
    if no_browser {
        config.launch_browser = false;
    }
    if let Some(port) = port {
        config.listener.port = port;
    }

    let mut session = AuthSession::from_config(config)?;
    if session.is_authorized() {
        println!(
            "Already authorized for {} as '{}'. Run `oauth1 forget` to start over.",
            session.config().api_name,
            session.screen_name()
        );
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let mut prompted = false;

    loop {
        session.tick();

        match session.phase() {
            AuthPhase::Authorized => break,
            AuthPhase::AccessFailed => {
                let reason = session
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(anyhow!("Authorization failed: {}", reason));
            }
            AuthPhase::AwaitingVerification if session.verification_requested() && !prompted => {
                prompted = true;
                if let Some(url) = session.authorization_url() {
                    println!("Open this URL to authorize the application:\n\n  {}\n", url);
                }
                if oob {
                    let pin = read_pin()?;
                    session.set_verifier_unchecked(&pin)?;
                } else {
                    println!("Waiting for the provider to redirect back...");
                }
            }
            _ => {}
        }

        if Instant::now() >= deadline {
            return Err(anyhow!("Timed out after {}s waiting for authorization", timeout));
        }
        std::thread::sleep(TICK_INTERVAL);
    }

    info!("Authorization complete");
    println!("Authorized for {}", session.config().api_name);
    if !session.screen_name().is_empty() {
        println!("  Screen name: {}", session.screen_name());
    }
    if !session.user_id().is_empty() {
        println!("  User id:     {}", session.user_id());
    }
    Ok(())
}

fn read_pin() -> Result<String> {
    print!("Enter the PIN: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| anyhow!("Failed to read PIN: {}", e))?;
    Ok(line.trim().to_string())
}

fn cmd_request(cli: &Cli, method: HttpMethod, path: &str, query: &str) -> Result<()> {
    let config = load_config(cli)?;
    let session = AuthSession::from_config(config)?;
    if !session.is_authorized() {
        anyhow::bail!(
            "No stored credentials for {}. Run `oauth1 authorize` first.",
            session.config().api_name
        );
    }

    let body = session.request(method, path, query)?;
    println!("{}", body);
    Ok(())
}

fn cmd_show(cli: &Cli, json: bool) -> Result<()> {
    let store = open_store(cli)?;
    let name = api_name(cli);

    let record: CredentialRecord = match store.load(&name)? {
        Some(record) => record,
        None => {
            println!("No stored credentials for {}.", name);
            return Ok(());
        }
    };

    if json {
        let output = serde_json::json!({
            "api_name": record.api_name,
            "consumer_key": record.consumer_key,
            "access_token": mask(&record.access_token),
            "access_secret": mask(&record.access_secret),
            "screen_name": record.screen_name,
            "user_id": record.user_id,
            "user_id_encoded": record.user_id_encoded,
            "saved_at": Utc.timestamp_opt(record.saved_at, 0).single().map(|dt| dt.to_rfc3339()),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("=== {} ===", record.api_name);
    println!("Database:     {}", store.path().display());
    println!("Consumer key: {}", record.consumer_key);
    println!("Access token: {}", mask(&record.access_token));
    println!("Screen name:  {}", if record.screen_name.is_empty() { "-" } else { record.screen_name.as_str() });
    println!("User id:      {}", if record.user_id.is_empty() { "-" } else { record.user_id.as_str() });
    println!("Saved at:     {}", format_timestamp(record.saved_at));
    Ok(())
}

fn cmd_forget(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let name = api_name(cli);

    if store.delete(&name)? {
        println!("Deleted stored credentials for {}.", name);
    } else {
        warn!("Nothing stored for {}", name);
        println!("No stored credentials for {}.", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_authorize() {
        let cli = Cli::parse_from(["oauth1", "--api-name", "TWITTER", "authorize", "--oob", "--timeout", "60"]);
        assert_eq!(cli.api_name.as_deref(), Some("TWITTER"));
        match cli.command {
            Commands::Authorize { oob, no_browser, timeout, port } => {
                assert!(oob);
                assert!(!no_browser);
                assert_eq!(timeout, 60);
                assert!(port.is_none());
            }
            _ => panic!("expected authorize"),
        }
    }

    #[test]
    fn test_cli_parses_post() {
        let cli = Cli::parse_from(["oauth1", "post", "/1.1/statuses/update.json", "--query", "status=hi"]);
        match cli.command {
            Commands::Post { path, query } => {
                assert_eq!(path, "/1.1/statuses/update.json");
                assert_eq!(query, "status=hi");
            }
            _ => panic!("expected post"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "oauth1",
            "--api-url",
            "https://api.example.com",
            "--consumer-key",
            "ck",
            "--consumer-secret",
            "cs",
            "show",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.consumer_key, "ck");
        assert_eq!(config.endpoints.api_base_url, "https://api.example.com");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(mask(""), "-");
        assert_eq!(mask("abcdefgh"), "abcdef...");
    }
}
