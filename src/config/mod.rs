//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Game listener address
    pub server_addr: SocketAddr,
    /// Optional status HTTP listener
    pub http_addr: Option<SocketAddr>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Directory holding one JSON record per player
    pub data_dir: PathBuf,
    pub troops_file: PathBuf,
    pub towers_file: PathBuf,

    pub tick_millis: u64,
    pub match_duration_secs: u64,
    /// 0 disables the waiting-match idle timeout
    pub waiting_timeout_secs: u64,
    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,
}

/// Timing knobs handed to the registry and tick drivers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchSettings {
    pub tick_interval: Duration,
    pub match_duration: Duration,
    pub waiting_timeout: Option<Duration>,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            match_duration: Duration::from_secs(180),
            waiting_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT wins over SERVER_ADDR for container platforms
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        };

        let http_addr = match env::var("HTTP_ADDR") {
            Ok(addr) if !addr.trim().is_empty() => {
                Some(addr.parse().map_err(|_| ConfigError::InvalidAddress)?)
            }
            _ => None,
        };

        let tick_millis: u64 = parse_or("TICK_MILLIS", 100)?;
        if tick_millis == 0 {
            return Err(ConfigError::Invalid {
                key: "TICK_MILLIS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            http_addr,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            data_dir: path_or("DATA_DIR", "./players"),
            troops_file: path_or("TROOPS_FILE", "./data/troops.json"),
            towers_file: path_or("TOWERS_FILE", "./data/towers.json"),

            tick_millis,
            match_duration_secs: parse_or("MATCH_DURATION_SECS", 180)?,
            waiting_timeout_secs: parse_or("WAITING_TIMEOUT_SECS", 300)?,
            outbound_queue: parse_or::<usize>("OUTBOUND_QUEUE", 64)?.max(1),
        })
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            tick_interval: Duration::from_millis(self.tick_millis),
            match_duration: Duration::from_secs(self.match_duration_secs),
            waiting_timeout: (self.waiting_timeout_secs > 0)
                .then(|| Duration::from_secs(self.waiting_timeout_secs)),
        }
    }
}

fn path_or(key: &'static str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
