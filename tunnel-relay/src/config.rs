//! Configuration loading for tunnel-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every field has a default, so an empty section is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for tunnel-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Claim code configuration.
    #[serde(default)]
    pub pairing: PairingConfig,
    /// Rate limiting and resource bounds.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket traffic (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum concurrently routed sessions (default: 10000).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Claim code configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingConfig {
    /// Lifetime of a freshly issued code in seconds (default: 300).
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    /// Minimum latency of a denied redemption in milliseconds (default: 150).
    ///
    /// Every denial is padded to this floor so a caller cannot tell an
    /// unknown code from an expired or consumed one by timing.
    #[serde(default = "default_denial_floor_ms")]
    pub denial_floor_ms: u64,
    /// Attempts at drawing a non-colliding code before giving up (default: 8).
    #[serde(default = "default_max_generate_attempts")]
    pub max_generate_attempts: u32,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Redemption attempts per client IP per minute (default: 5).
    #[serde(default = "default_redeem_per_minute")]
    pub redeem_per_minute: u32,
    /// Instance registrations per IP per minute (default: 10).
    #[serde(default = "default_register_per_minute")]
    pub register_per_minute: u32,
    /// Global request cap across all callers (default: 1000/s).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Seconds an instance socket may stay silent before `register` (default: 10).
    #[serde(default = "default_register_timeout_secs")]
    pub register_timeout_secs: u64,
    /// Seconds a client socket may stay open without pairing (default: 10).
    #[serde(default = "default_redeem_timeout_secs")]
    pub redeem_timeout_secs: u64,
    /// Outbound queue depth per socket (default: 64).
    ///
    /// A socket whose queue is full is considered stuck and its sessions
    /// are closed rather than blocking other sockets.
    #[serde(default = "default_session_queue_bound")]
    pub session_queue_bound: usize,
    /// Largest frame payload accepted, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_claim_ttl_secs() -> u64 {
    300
}

fn default_denial_floor_ms() -> u64 {
    150
}

fn default_max_generate_attempts() -> u32 {
    8
}

fn default_redeem_per_minute() -> u32 {
    5
}

fn default_register_per_minute() -> u32 {
    10
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_register_timeout_secs() -> u64 {
    10
}

fn default_redeem_timeout_secs() -> u64 {
    10
}

fn default_session_queue_bound() -> usize {
    64
}

fn default_max_frame_size() -> usize {
    // Largest Noise message plus base64 and envelope slack
    65_536 + 1024
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: default_claim_ttl_secs(),
            denial_floor_ms: default_denial_floor_ms(),
            max_generate_attempts: default_max_generate_attempts(),
        }
    }
}

impl PairingConfig {
    /// Denial floor as a Duration.
    pub fn denial_floor(&self) -> Duration {
        Duration::from_millis(self.denial_floor_ms)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            redeem_per_minute: default_redeem_per_minute(),
            register_per_minute: default_register_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            register_timeout_secs: default_register_timeout_secs(),
            redeem_timeout_secs: default_redeem_timeout_secs(),
            session_queue_bound: default_session_queue_bound(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
