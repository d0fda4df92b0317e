//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Settings are read once at startup and never change afterwards.

use std::time::Duration;

use crate::application::ports::Credentials;
use crate::application::services::SessionConfig;
use crate::domain::command::ErrorKind;
use crate::domain::subscription::DEFAULT_SHARD_COUNT;

/// Default market data channels.
pub const DEFAULT_FEED_CHANNELS: &[&str] = &["book.BTC-PERPETUAL.100ms", "book.ETH-PERPETUAL.100ms"];

/// Exchange environment (testnet vs production).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Deribit testnet.
    #[default]
    Test,
    /// Deribit production.
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" | "PROD" | "PRODUCTION" => Self::Live,
            _ => Self::Test,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Live => "live",
        }
    }

    /// HTTP base URL for JSON-RPC calls.
    #[must_use]
    pub const fn rest_base_url(&self) -> &'static str {
        match self {
            Self::Test => "https://test.deribit.com",
            Self::Live => "https://www.deribit.com",
        }
    }

    /// WebSocket URL for the market data feed.
    #[must_use]
    pub const fn ws_url(&self) -> &'static str {
        match self {
            Self::Test => "wss://test.deribit.com/ws/api/v2",
            Self::Live => "wss://www.deribit.com/ws/api/v2",
        }
    }
}

/// Listener port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Subscriber WebSocket port.
    pub ws_port: u16,
    /// Admin HTTP port (health, metrics, commands).
    pub admin_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 9002,
            admin_port: 8082,
        }
    }
}

/// Session and command timing.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Timeout for one command call.
    pub request_timeout: Duration,
    /// Timeout for one token refresh.
    pub auth_timeout: Duration,
    /// Refresh tokens this close to expiry.
    pub token_refresh_margin: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            token_refresh_margin: Duration::from_secs(30),
        }
    }
}

impl SessionSettings {
    /// Session manager configuration derived from these settings.
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_timeout: self.auth_timeout,
            refresh_margin: self.token_refresh_margin,
        }
    }
}

/// Fan-out hub settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Per-connection outbound queue capacity.
    pub queue_capacity: usize,
    /// Time a closing connection gets to flush its queue.
    pub drain_timeout: Duration,
    /// Number of registry shards.
    pub registry_shards: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            drain_timeout: Duration::from_millis(2000),
            registry_shards: DEFAULT_SHARD_COUNT,
        }
    }
}

/// Upstream market data feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Channels to subscribe to upstream.
    pub channels: Vec<String>,
    /// Interval between keepalive pings.
    pub heartbeat_interval: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            channels: DEFAULT_FEED_CHANNELS.iter().map(ToString::to_string).collect(),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Exchange environment.
    pub environment: Environment,
    /// API credentials.
    pub credentials: Credentials,
    /// JSON-RPC base URL.
    pub rest_base_url: String,
    /// Market data WebSocket URL.
    pub ws_url: String,
    /// Listener ports.
    pub server: ServerSettings,
    /// Session and command timing.
    pub session: SessionSettings,
    /// Fan-out hub settings.
    pub hub: HubSettings,
    /// Market data feed settings.
    pub feed: FeedSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or empty, or a tunable
    /// has an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`GatewayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = required(&lookup, "DERIBIT_CLIENT_ID")?;
        let client_secret = required(&lookup, "DERIBIT_CLIENT_SECRET")?;

        let environment = lookup("DERIBIT_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let rest_base_url = lookup("DERIBIT_REST_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| environment.rest_base_url().to_string());
        let ws_url = lookup("DERIBIT_WS_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| environment.ws_url().to_string());

        let server = ServerSettings {
            ws_port: parse_or(&lookup, "GATEWAY_WS_PORT", ServerSettings::default().ws_port),
            admin_port: parse_or(
                &lookup,
                "GATEWAY_ADMIN_PORT",
                ServerSettings::default().admin_port,
            ),
        };

        let session_defaults = SessionSettings::default();
        let session = SessionSettings {
            request_timeout: parse_millis_or(
                &lookup,
                "GATEWAY_REQUEST_TIMEOUT_MS",
                session_defaults.request_timeout,
            ),
            auth_timeout: parse_millis_or(
                &lookup,
                "GATEWAY_AUTH_TIMEOUT_MS",
                session_defaults.auth_timeout,
            ),
            token_refresh_margin: parse_secs_or(
                &lookup,
                "GATEWAY_TOKEN_REFRESH_MARGIN_SECS",
                session_defaults.token_refresh_margin,
            ),
        };

        let hub_defaults = HubSettings::default();
        let hub = HubSettings {
            queue_capacity: parse_or(
                &lookup,
                "GATEWAY_QUEUE_CAPACITY",
                hub_defaults.queue_capacity,
            ),
            drain_timeout: parse_millis_or(
                &lookup,
                "GATEWAY_DRAIN_TIMEOUT_MS",
                hub_defaults.drain_timeout,
            ),
            registry_shards: parse_or(
                &lookup,
                "GATEWAY_REGISTRY_SHARDS",
                hub_defaults.registry_shards,
            ),
        };
        if hub.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_QUEUE_CAPACITY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let feed_defaults = FeedSettings::default();
        let channels = lookup("GATEWAY_FEED_CHANNELS").map_or(feed_defaults.channels, |raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string)
                .collect()
        });
        let feed = FeedSettings {
            channels,
            heartbeat_interval: parse_secs_or(
                &lookup,
                "GATEWAY_FEED_HEARTBEAT_SECS",
                feed_defaults.heartbeat_interval,
            ),
            reconnect_delay_initial: parse_millis_or(
                &lookup,
                "GATEWAY_FEED_RECONNECT_DELAY_INITIAL_MS",
                feed_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_secs_or(
                &lookup,
                "GATEWAY_FEED_RECONNECT_DELAY_MAX_SECS",
                feed_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "GATEWAY_FEED_RECONNECT_DELAY_MULTIPLIER",
                feed_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "GATEWAY_FEED_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            ),
        };

        Ok(Self {
            environment,
            credentials: Credentials::new(client_id, client_secret),
            rest_base_url,
            ws_url,
            server,
            session,
            hub,
            feed,
        })
    }
}

/// Configuration error.
///
/// Fatal at startup; no network call is made when loading fails.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Command error classification for this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_millis_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn with_credentials(extra: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let mut pairs = vec![
            ("DERIBIT_CLIENT_ID", "client"),
            ("DERIBIT_CLIENT_SECRET", "secret"),
        ];
        pairs.extend_from_slice(extra);
        lookup_from(&pairs)
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(
            Environment::from_str_case_insensitive("live"),
            Environment::Live
        );
        assert_eq!(
            Environment::from_str_case_insensitive("LIVE"),
            Environment::Live
        );
        assert_eq!(
            Environment::from_str_case_insensitive("test"),
            Environment::Test
        );
        assert_eq!(
            Environment::from_str_case_insensitive("unknown"),
            Environment::Test
        );
    }

    #[test]
    fn environment_urls() {
        assert_eq!(Environment::Test.rest_base_url(), "https://test.deribit.com");
        assert_eq!(Environment::Live.ws_url(), "wss://www.deribit.com/ws/api/v2");
        assert!(Environment::Live.is_live());
        assert!(!Environment::Test.is_live());
    }

    #[test]
    fn missing_client_id() {
        let result = GatewayConfig::from_lookup(lookup_from(&[("DERIBIT_CLIENT_SECRET", "s")]));
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "DERIBIT_CLIENT_ID"));
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn empty_client_secret() {
        let result = GatewayConfig::from_lookup(lookup_from(&[
            ("DERIBIT_CLIENT_ID", "c"),
            ("DERIBIT_CLIENT_SECRET", "  "),
        ]));
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::EmptyValue(ref k) if k == "DERIBIT_CLIENT_SECRET"
        ));
    }

    #[test]
    fn defaults_applied() {
        let config = GatewayConfig::from_lookup(with_credentials(&[])).unwrap();

        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.rest_base_url, "https://test.deribit.com");
        assert_eq!(config.ws_url, "wss://test.deribit.com/ws/api/v2");
        assert_eq!(config.server.ws_port, 9002);
        assert_eq!(config.server.admin_port, 8082);
        assert_eq!(config.session.request_timeout, Duration::from_secs(10));
        assert_eq!(config.session.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.session.token_refresh_margin, Duration::from_secs(30));
        assert_eq!(config.hub.queue_capacity, 1024);
        assert_eq!(config.hub.drain_timeout, Duration::from_millis(2000));
        assert_eq!(config.hub.registry_shards, 16);
        assert_eq!(
            config.feed.channels,
            vec!["book.BTC-PERPETUAL.100ms", "book.ETH-PERPETUAL.100ms"]
        );
        assert_eq!(config.feed.max_reconnect_attempts, 0);
        assert_eq!(config.credentials.client_id(), "client");
    }

    #[test]
    fn overrides_applied() {
        let config = GatewayConfig::from_lookup(with_credentials(&[
            ("DERIBIT_ENV", "live"),
            ("GATEWAY_WS_PORT", "9100"),
            ("GATEWAY_REQUEST_TIMEOUT_MS", "2500"),
            ("GATEWAY_QUEUE_CAPACITY", "8"),
            ("GATEWAY_FEED_CHANNELS", " ticker.BTC-PERPETUAL.raw, ,trades.ETH-PERPETUAL.100ms "),
            ("GATEWAY_FEED_RECONNECT_DELAY_MULTIPLIER", "1.5"),
        ]))
        .unwrap();

        assert_eq!(config.environment, Environment::Live);
        assert_eq!(config.rest_base_url, "https://www.deribit.com");
        assert_eq!(config.server.ws_port, 9100);
        assert_eq!(config.session.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.hub.queue_capacity, 8);
        assert_eq!(
            config.feed.channels,
            vec!["ticker.BTC-PERPETUAL.raw", "trades.ETH-PERPETUAL.100ms"]
        );
        assert!((config.feed.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = GatewayConfig::from_lookup(with_credentials(&[
            ("GATEWAY_ADMIN_PORT", "not-a-port"),
            ("GATEWAY_DRAIN_TIMEOUT_MS", "-5"),
        ]))
        .unwrap();

        assert_eq!(config.server.admin_port, 8082);
        assert_eq!(config.hub.drain_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let result =
            GatewayConfig::from_lookup(with_credentials(&[("GATEWAY_QUEUE_CAPACITY", "0")]));
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { ref key, .. } if key == "GATEWAY_QUEUE_CAPACITY"
        ));
    }

    #[test]
    fn url_overrides() {
        let config = GatewayConfig::from_lookup(with_credentials(&[
            ("DERIBIT_REST_URL", "http://127.0.0.1:8080"),
            ("DERIBIT_WS_URL", "ws://127.0.0.1:8081"),
        ]))
        .unwrap();

        assert_eq!(config.rest_base_url, "http://127.0.0.1:8080");
        assert_eq!(config.ws_url, "ws://127.0.0.1:8081");
    }

    #[test]
    fn session_config_from_settings() {
        let settings = SessionSettings {
            request_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(3),
            token_refresh_margin: Duration::from_secs(7),
        };
        let config = settings.session_config();
        assert_eq!(config.refresh_timeout, Duration::from_secs(3));
        assert_eq!(config.refresh_margin, Duration::from_secs(7));
    }
}
