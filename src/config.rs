//! Configuration management for the Social Markets service

use anyhow::Result;
use std::env;
use std::net::SocketAddr;
use tracing::warn;

/// Used when `CREDENTIAL_SECRET` is not set; fine for local development only
const DEV_CREDENTIAL_SECRET: &str = "social-markets-dev-secret";

/// Service configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database
    pub database_path: String,

    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,

    /// Public origin used to build the OAuth callback URL
    /// (falls back to the request Host header when unset)
    pub public_base_url: Option<String>,

    /// X OAuth 2.0 client credentials (account linking is disabled without them)
    pub x_client_id: Option<String>,
    pub x_client_secret: Option<String>,

    /// Secret used to encrypt stored X tokens
    pub credential_secret: String,

    /// AI drafting provider settings
    pub ai: AiConfig,

    /// X monitoring worker settings
    pub monitor: MonitorConfig,

    /// Lifetime of short-lived auth state
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    /// API key for an OpenAI-compatible endpoint (fallback drafts without it)
    pub api_key: Option<String>,
    /// Base URL, e.g. https://api.openai.com/v1
    pub base_url: String,
    /// Chat model name
    pub model: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Whether the server spawns the worker (default: true)
    pub enabled: bool,
    /// Seconds between polling cycles (default: 300)
    pub poll_interval_seconds: u64,
    /// Seconds to stay idle after a rate limit (default: 900)
    pub rate_limit_backoff_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 5 * 60,
            rate_limit_backoff_seconds: 15 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth state lifetime (default: 600)
    pub oauth_state_ttl_seconds: i64,
    /// Wallet sign-in nonce lifetime (default: 300)
    pub nonce_ttl_seconds: i64,
    /// Session lifetime (default: 24)
    pub session_ttl_hours: i64,
    /// Sweep interval for the expiring stores (default: 300)
    pub sweep_interval_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            oauth_state_ttl_seconds: 10 * 60,
            nonce_ttl_seconds: 5 * 60,
            session_ttl_hours: 24,
            sweep_interval_seconds: 5 * 60,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "social_markets.db".to_string());

        let bind_addr: SocketAddr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid BIND_ADDR: {}", e))?;

        let public_base_url = env_opt("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string());

        let x_client_id = env_opt("X_CLIENT_ID");
        let x_client_secret = env_opt("X_CLIENT_SECRET");

        let credential_secret = match env_opt("CREDENTIAL_SECRET") {
            Some(secret) => secret,
            None => {
                warn!("CREDENTIAL_SECRET not set, using development secret");
                DEV_CREDENTIAL_SECRET.to_string()
            }
        };

        let ai_defaults = AiConfig::default();
        let ai = AiConfig {
            api_key: env_opt("AI_API_KEY").or_else(|| env_opt("OPENAI_API_KEY")),
            base_url: env_opt("AI_BASE_URL").unwrap_or(ai_defaults.base_url),
            model: env_opt("AI_MODEL").unwrap_or(ai_defaults.model),
        };

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            enabled: env::var("X_MONITOR_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            poll_interval_seconds: env_parse(
                "X_POLL_INTERVAL_SECONDS",
                monitor_defaults.poll_interval_seconds,
            ),
            rate_limit_backoff_seconds: env_parse(
                "X_RATE_LIMIT_BACKOFF_SECONDS",
                monitor_defaults.rate_limit_backoff_seconds,
            ),
        };

        let auth_defaults = AuthConfig::default();
        let auth = AuthConfig {
            oauth_state_ttl_seconds: env_parse("OAUTH_STATE_TTL_SECONDS", auth_defaults.oauth_state_ttl_seconds),
            nonce_ttl_seconds: env_parse("SIGN_IN_NONCE_TTL_SECONDS", auth_defaults.nonce_ttl_seconds),
            session_ttl_hours: env_parse("SESSION_TTL_HOURS", auth_defaults.session_ttl_hours),
            sweep_interval_seconds: auth_defaults.sweep_interval_seconds,
        };

        // Validate configuration
        if monitor.poll_interval_seconds == 0 {
            anyhow::bail!("X_POLL_INTERVAL_SECONDS must be greater than zero");
        }
        if x_client_id.is_some() != x_client_secret.is_some() {
            anyhow::bail!("X_CLIENT_ID and X_CLIENT_SECRET must be set together");
        }

        Ok(Self {
            database_path,
            bind_addr,
            public_base_url,
            x_client_id,
            x_client_secret,
            credential_secret,
            ai,
            monitor,
            auth,
        })
    }

    /// Check if X account linking is configured
    pub fn x_oauth_enabled(&self) -> bool {
        self.x_client_id.is_some() && self.x_client_secret.is_some()
    }
}

/// X API endpoints
pub struct XApi;

impl XApi {
    pub const BASE_URL: &'static str = "https://api.twitter.com";
    pub const AUTHORIZE_URL: &'static str = "https://twitter.com/i/oauth2/authorize";
    pub const SCOPES: &'static str = "tweet.read users.read";
}
