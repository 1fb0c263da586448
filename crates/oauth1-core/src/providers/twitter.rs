//! ============================================================================
//! Twitter - v1.1 REST calls over OAuth 1.0a user context
//! ============================================================================

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::OAuthConfig;
use crate::session::AuthSession;
use crate::signer::percent_encode;
use crate::types::HttpMethod;

/// Twitter API base; OAuth endpoints hang off `/oauth/...`
pub const TWITTER_API_URL: &str = "https://api.twitter.com";

/// Name Twitter credentials are stored under
pub const TWITTER_API_NAME: &str = "TWITTER";

const MAX_STATUS_CHARS: usize = 280;

pub fn twitter_config(consumer_key: &str, consumer_secret: &str) -> OAuthConfig {
    let mut config = OAuthConfig::new(TWITTER_API_URL, consumer_key, consumer_secret);
    config.api_name = TWITTER_API_NAME.to_string();
    config
}

/// The 20 most recent mentions of the authenticated user (JSON)
pub fn mentions(session: &AuthSession) -> String {
    session.get("/1.1/statuses/mentions_timeline.json", "")
}

/// The authenticated user's tweets that others retweeted (JSON)
pub fn retweets_of_me(session: &AuthSession) -> String {
    session.get("/1.1/statuses/retweets_of_me.json", "")
}

/// Post a status update, optionally as a reply
pub fn update_status(session: &AuthSession, text: &str, reply_to: Option<&str>) -> Result<String> {
    if text.chars().count() > MAX_STATUS_CHARS {
        return Err(anyhow!("Tweet exceeds {} characters", MAX_STATUS_CHARS));
    }

    let mut query = format!("status={}", percent_encode(text));
    if let Some(id) = reply_to {
        query.push_str(&format!("&in_reply_to_status_id={}", percent_encode(id)));
    }

    let preview: String = text.chars().take(50).collect();
    info!("Posting tweet: {}...", preview);
    let body = session.request(HttpMethod::Post, "/1.1/statuses/update.json", &query)?;
    Ok(body)
}
