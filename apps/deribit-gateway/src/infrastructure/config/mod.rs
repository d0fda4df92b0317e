//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_FEED_CHANNELS, Environment, FeedSettings, GatewayConfig, HubSettings,
    ServerSettings, SessionSettings,
};
