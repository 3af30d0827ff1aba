//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::{DealPolicy, IncompleteSelectionPolicy, MatchConfig};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma-separated; `*` allows any
    pub client_origin: String,
    /// Tunables handed to every new match
    pub game: MatchConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Render-style PORT wins over SERVER_ADDR
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let defaults = MatchConfig::default();
        let game = MatchConfig {
            hand_size: positive(&lookup, "HAND_SIZE", defaults.hand_size)?,
            starting_health: positive(&lookup, "STARTING_HEALTH", defaults.starting_health)?,
            selection_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SELECTION_TIMEOUT_SECS",
                defaults.selection_timeout.as_secs(),
            )?),
            deal_ack_timeout: millis(&lookup, "DEAL_ACK_TIMEOUT_MS", defaults.deal_ack_timeout)?,
            round_restart_delay: millis(
                &lookup,
                "ROUND_RESTART_DELAY_MS",
                defaults.round_restart_delay,
            )?,
            game_over_reset_delay: millis(
                &lookup,
                "GAME_OVER_RESET_DELAY_MS",
                defaults.game_over_reset_delay,
            )?,
            restart_notice_delay: millis(
                &lookup,
                "RESTART_NOTICE_DELAY_MS",
                defaults.restart_notice_delay,
            )?,
            player_poll_interval: Duration::from_millis(positive(
                &lookup,
                "PLAYER_POLL_INTERVAL_MS",
                defaults.player_poll_interval.as_millis() as u64,
            )?),
            deal_policy: parse_or(&lookup, "DEAL_POLICY", defaults.deal_policy)?,
            incomplete_selection_policy: parse_or(
                &lookup,
                "INCOMPLETE_SELECTION_POLICY",
                defaults.incomplete_selection_policy,
            )?,
            reset_after_game_over: parse_or(
                &lookup,
                "RESET_AFTER_GAME_OVER",
                defaults.reset_after_game_over,
            )?,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),
            game,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
