// Runtime configuration.
//
// Layered lowest to highest: built-in defaults, an optional TOML file,
// environment variables (after loading `.env`), then whatever the CLI
// overrides on the returned value. Settings only some subcommands need are
// checked by `require_bus` / `require_recorder`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{parse_hmac_algorithm, SecretEncoding};
use crate::events::default_history_file;
use crate::fleet::{FleetConfig, MAX_PUBLISH_PERIOD, MIN_PUBLISH_PERIOD};
use crate::session::ReconnectPolicy;

pub const ENV_SECRET_KEY: &str = "CHATGEN_SECRET_KEY";
pub const ENV_SECRET_ENCODING: &str = "CHATGEN_SECRET_ENCODING";
pub const ENV_JWT_ALGORITHM: &str = "CHATGEN_JWT_ALGORITHM";
pub const ENV_WEBSOCKET_URL: &str = "CHATGEN_WEBSOCKET_URL";
pub const ENV_ROOM_ID: &str = "CHATGEN_ROOM_ID";
pub const ENV_NUM_CLIENTS: &str = "CHATGEN_NUM_CLIENTS";
pub const ENV_RAMP_UP_SECONDS: &str = "CHATGEN_RAMP_UP_SECONDS";
pub const ENV_MESSAGES_PER_SECOND: &str = "CHATGEN_MESSAGES_PER_SECOND";
pub const ENV_TEST_DURATION_SECONDS: &str = "CHATGEN_TEST_DURATION_SECONDS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "CHATGEN_SHUTDOWN_GRACE_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "CHATGEN_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_BASE_DELAY_MS: &str = "CHATGEN_RECONNECT_BASE_DELAY_MS";
pub const ENV_RECONNECT_MAX_DELAY_MS: &str = "CHATGEN_RECONNECT_MAX_DELAY_MS";
pub const ENV_HISTORY_FILE: &str = "CHATGEN_HISTORY_FILE";
pub const ENV_YOUTUBE_VIDEO_ID: &str = "CHATGEN_YOUTUBE_VIDEO_ID";
pub const ENV_YOUTUBE_API_KEY: &str = "CHATGEN_YOUTUBE_API_KEY";
pub const ENV_REISSUE_URL: &str = "CHATGEN_REISSUE_URL";
pub const ENV_LOG_FILTER: &str = "CHATGEN_LOG_FILTER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn invalid(key: &'static str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.to_string() }
}

/// Everything the subcommands can be configured with.
#[derive(Debug, Clone)]
pub struct ChatgenConfig {
    pub secret_key: Option<String>,
    pub secret_encoding: SecretEncoding,
    pub jwt_algorithm: Algorithm,
    pub websocket_url: Option<String>,
    pub room_id: String,
    pub num_clients: usize,
    pub ramp_up: Duration,
    pub messages_per_second: f64,
    pub test_duration: Duration,
    pub shutdown_grace: Duration,
    pub reconnect: ReconnectPolicy,
    pub history_file: Option<PathBuf>,
    pub youtube_video_id: Option<String>,
    pub youtube_api_key: Option<String>,
    /// Base URL of the chat server's token re-issue endpoint. When unset,
    /// credentials are refreshed locally with the signing secret.
    pub reissue_url: Option<String>,
    pub log_filter: String,
}

impl Default for ChatgenConfig {
    fn default() -> Self {
        let fleet = FleetConfig::default();
        Self {
            secret_key: None,
            secret_encoding: SecretEncoding::Raw,
            jwt_algorithm: Algorithm::HS512,
            websocket_url: None,
            room_id: fleet.room_id,
            num_clients: fleet.clients,
            ramp_up: fleet.ramp_up,
            messages_per_second: fleet.messages_per_second,
            test_duration: fleet.observation,
            shutdown_grace: fleet.shutdown_grace,
            reconnect: ReconnectPolicy::default(),
            history_file: None,
            youtube_video_id: None,
            youtube_api_key: None,
            reissue_url: None,
            log_filter: "info".to_string(),
        }
    }
}

/// What a bus-connected subcommand needs beyond the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub secret_key: String,
    pub websocket_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    pub video_id: String,
    pub api_key: String,
    pub history_file: PathBuf,
}

/// On-disk form. Keys mirror the environment variables without the prefix.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    secret_key: Option<String>,
    secret_encoding: Option<String>,
    jwt_algorithm: Option<String>,
    websocket_url: Option<String>,
    room_id: Option<String>,
    num_clients: Option<usize>,
    ramp_up_seconds: Option<u64>,
    messages_per_second: Option<f64>,
    test_duration_seconds: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    history_file: Option<PathBuf>,
    youtube_video_id: Option<String>,
    youtube_api_key: Option<String>,
    reissue_url: Option<String>,
    log_filter: Option<String>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

impl ChatgenConfig {
    /// Load `.env`, then build from `config_file` (if any) and the process
    /// environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(error) if error.not_found() => {}
            Err(error) => warn!(%error, "ignoring unreadable .env"),
        }
        Self::from_sources(config_file, |key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_sources<F>(config_file: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let mut config = Self::default();
        if let Some(path) = config_file {
            config.apply_file(FileConfig::read(path)?)?;
        }
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(value) = file.secret_encoding {
            self.secret_encoding = value.parse().map_err(|e| invalid("secret_encoding", e))?;
        }
        if let Some(value) = file.jwt_algorithm {
            self.jwt_algorithm = algorithm("jwt_algorithm", &value)?;
        }
        overwrite(&mut self.secret_key, file.secret_key);
        overwrite(&mut self.websocket_url, file.websocket_url);
        overwrite(&mut self.history_file, file.history_file);
        overwrite(&mut self.youtube_video_id, file.youtube_video_id);
        overwrite(&mut self.youtube_api_key, file.youtube_api_key);
        overwrite(&mut self.reissue_url, file.reissue_url);
        if let Some(value) = file.room_id {
            self.room_id = value;
        }
        if let Some(value) = file.log_filter {
            self.log_filter = value;
        }
        if let Some(value) = file.num_clients {
            self.num_clients = value;
        }
        if let Some(value) = file.messages_per_second {
            self.messages_per_second = value;
        }
        if let Some(value) = file.ramp_up_seconds {
            self.ramp_up = Duration::from_secs(value);
        }
        if let Some(value) = file.test_duration_seconds {
            self.test_duration = Duration::from_secs(value);
        }
        if let Some(value) = file.shutdown_grace_ms {
            self.shutdown_grace = Duration::from_millis(value);
        }
        if let Some(value) = file.max_reconnect_attempts {
            self.reconnect.max_attempts = value;
        }
        if let Some(value) = file.reconnect_base_delay_ms {
            self.reconnect.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = file.reconnect_max_delay_ms {
            self.reconnect.max_delay = Duration::from_millis(value);
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let text = |key: &str| env(key).ok().filter(|value| !value.trim().is_empty());

        overwrite(&mut self.secret_key, text(ENV_SECRET_KEY));
        overwrite(&mut self.websocket_url, text(ENV_WEBSOCKET_URL));
        overwrite(&mut self.history_file, text(ENV_HISTORY_FILE).map(PathBuf::from));
        overwrite(&mut self.youtube_video_id, text(ENV_YOUTUBE_VIDEO_ID));
        overwrite(&mut self.youtube_api_key, text(ENV_YOUTUBE_API_KEY));
        overwrite(&mut self.reissue_url, text(ENV_REISSUE_URL));
        if let Some(value) = text(ENV_ROOM_ID) {
            self.room_id = value;
        }
        if let Some(value) = text(ENV_LOG_FILTER) {
            self.log_filter = value;
        }
        if let Some(value) = text(ENV_SECRET_ENCODING) {
            self.secret_encoding = value.parse().map_err(|e| invalid(ENV_SECRET_ENCODING, e))?;
        }
        if let Some(value) = text(ENV_JWT_ALGORITHM) {
            self.jwt_algorithm = algorithm(ENV_JWT_ALGORITHM, &value)?;
        }
        if let Some(value) = parsed(&text, ENV_NUM_CLIENTS)? {
            self.num_clients = value;
        }
        if let Some(value) = parsed(&text, ENV_MESSAGES_PER_SECOND)? {
            self.messages_per_second = value;
        }
        if let Some(value) = parsed(&text, ENV_RAMP_UP_SECONDS)? {
            self.ramp_up = Duration::from_secs(value);
        }
        if let Some(value) = parsed(&text, ENV_TEST_DURATION_SECONDS)? {
            self.test_duration = Duration::from_secs(value);
        }
        if let Some(value) = parsed(&text, ENV_SHUTDOWN_GRACE_MS)? {
            self.shutdown_grace = Duration::from_millis(value);
        }
        if let Some(value) = parsed(&text, ENV_MAX_RECONNECT_ATTEMPTS)? {
            self.reconnect.max_attempts = value;
        }
        if let Some(value) = parsed(&text, ENV_RECONNECT_BASE_DELAY_MS)? {
            self.reconnect.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = parsed(&text, ENV_RECONNECT_MAX_DELAY_MS)? {
            self.reconnect.max_delay = Duration::from_millis(value);
        }
        Ok(())
    }

    /// Range checks. Call again after applying CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_id.trim().is_empty() {
            return Err(invalid(ENV_ROOM_ID, "room id must not be empty"));
        }
        if self.num_clients == 0 {
            return Err(invalid(ENV_NUM_CLIENTS, "at least one client is required"));
        }
        let max_rate = 1.0 / MIN_PUBLISH_PERIOD.as_secs_f64();
        let min_rate = 1.0 / MAX_PUBLISH_PERIOD.as_secs_f64();
        let rate = self.messages_per_second;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(invalid(
                ENV_MESSAGES_PER_SECOND,
                format!("rate must be a positive number, got {rate}"),
            ));
        }
        if rate < min_rate || rate > max_rate {
            return Err(invalid(
                ENV_MESSAGES_PER_SECOND,
                format!("rate must be between {min_rate} and {max_rate} per second, got {rate}"),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid(ENV_MAX_RECONNECT_ATTEMPTS, "must allow at least one attempt"));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(invalid(
                ENV_RECONNECT_BASE_DELAY_MS,
                "base delay must not exceed the maximum delay",
            ));
        }
        Ok(())
    }

    pub fn require_bus(&self) -> Result<BusSettings, ConfigError> {
        let secret_key = self.secret_key.clone().ok_or(ConfigError::Missing { key: ENV_SECRET_KEY })?;
        let websocket_url =
            self.websocket_url.clone().ok_or(ConfigError::Missing { key: ENV_WEBSOCKET_URL })?;
        Ok(BusSettings { secret_key, websocket_url })
    }

    pub fn require_recorder(&self) -> Result<RecorderSettings, ConfigError> {
        let video_id =
            self.youtube_video_id.clone().ok_or(ConfigError::Missing { key: ENV_YOUTUBE_VIDEO_ID })?;
        let api_key =
            self.youtube_api_key.clone().ok_or(ConfigError::Missing { key: ENV_YOUTUBE_API_KEY })?;
        let history_file =
            self.history_file.clone().unwrap_or_else(|| default_history_file(&video_id));
        Ok(RecorderSettings { video_id, api_key, history_file })
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            clients: self.num_clients,
            ramp_up: self.ramp_up,
            messages_per_second: self.messages_per_second,
            observation: self.test_duration,
            shutdown_grace: self.shutdown_grace,
            room_id: self.room_id.clone(),
        }
    }
}

fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn algorithm(key: &'static str, value: &str) -> Result<Algorithm, ConfigError> {
    parse_hmac_algorithm(value)
        .ok_or_else(|| invalid(key, format!("`{value}` is not one of HS256, HS384, HS512")))
}

fn parsed<T>(
    text: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    text(key)
        .map(|value| value.trim().parse::<T>().map_err(|e| invalid(key, format!("`{value}`: {e}"))))
        .transpose()
}
