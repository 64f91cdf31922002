//! Environment configuration
//!
//! Everything the server needs from the outside world: Catapult
//! credentials, the externally reachable base URL (used to build callback
//! and media URLs the provider must be able to fetch), and local paths.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Catapult account user id (path segment of every API request).
    pub catapult_user_id: String,
    pub catapult_api_token: String,
    pub catapult_api_secret: String,
    /// Domain resource that holds the per-user SIP endpoints.
    pub catapult_domain_id: String,
    /// Externally reachable base URL of this server, no trailing slash.
    pub base_url: String,
    /// Listening port (default 3000).
    pub port: u16,
    /// Snapshot file backing the session store.
    pub store_path: String,
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            catapult_user_id: require("CATAPULT_USER_ID")?,
            catapult_api_token: require("CATAPULT_API_TOKEN")?,
            catapult_api_secret: require("CATAPULT_API_SECRET")?,
            catapult_domain_id: require("CATAPULT_DOMAIN_ID")?,
            base_url: require("BASE_URL")?.trim_end_matches('/').to_string(),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            store_path: std::env::var("SESSION_STORE_PATH")
                .unwrap_or_else(|_| "sessions.json".to_string()),
        })
    }

    /// Callback URL the provider posts events for `username` to.
    pub fn callback_url(&self, username: &str) -> String {
        format!("{}/sessions/{}/events", self.base_url, username)
    }

    /// Looped ring audio played to the caller while the second leg connects.
    pub fn ring_media_url(&self) -> String {
        format!("{}/static/sounds/ring.mp3", self.base_url)
    }
}
