//! Configuration module for the tail-relay agent.
//!
//! The configuration is a static snapshot built once at startup. It is
//! assembled from three layers, later layers winning:
//!
//! 1. built-in defaults ([`Config::default`]),
//! 2. an optional JSON config file,
//! 3. `TAIL_RELAY_*` environment variables.
//!
//! The resulting [`Config`] is validated before any component sees it and is
//! read-only afterwards.

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::format::{Facility, Severity};

/// Default remote collector host
const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";

/// Default remote collector port (syslog)
const DEFAULT_REMOTE_PORT: u16 = 514;

/// Default number of open attempts before a stream gives up
const DEFAULT_MAX_OPEN_ATTEMPTS: u32 = 10;

/// Default delay between open attempts in milliseconds
const DEFAULT_OPEN_RETRY_DELAY_MS: u64 = 3000;

/// Default number of connect attempts before the agent exits
const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Default delay between connect attempts in milliseconds
const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 3000;

/// Default number of messages a stream may emit per rate window
const DEFAULT_RATE_LIMIT: u32 = 100;

/// Default rate window in milliseconds
const DEFAULT_RATE_TIME_MS: u64 = 1000;

/// Default file size ceiling (1 GiB) above which a tailed file is truncated
const DEFAULT_TRUNCATE_LIMIT: u64 = 1 << 30;

/// Default number of repeats between "previous message repeated" notices
const DEFAULT_REPEAT_THRESHOLD: u32 = 500;

/// Default fallback poll interval in milliseconds
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Lower bound for the poll interval so a typo cannot spin the scheduler
const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Default agent-wide identifier placed in every forwarded message
const DEFAULT_IDENTIFIER: &str = "tail-relay";

/// Default diagnostic log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable naming a JSON config file
pub const CONFIG_FILE_ENV: &str = "TAIL_RELAY_CONFIG_FILE";

/// Network protocol used to reach the remote collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connection-oriented stream transport
    Tcp,
    /// Connectionless datagram transport
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!(
                "invalid protocol '{}', must be either udp or tcp",
                other
            )),
        }
    }
}

/// One tailed file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Identifier placed in front of every message from this file
    pub id: String,

    /// Absolute path of the file
    pub path: PathBuf,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Configuration snapshot for the agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Files to tail
    pub streams: Vec<StreamConfig>,

    /// Remote collector host name or address
    pub remote_host: String,

    /// Remote collector port
    pub remote_port: u16,

    /// Transport protocol
    pub protocol: Protocol,

    /// Open attempts before a stream gives up for good (0 = never give up)
    pub max_open_attempts: u32,

    /// Delay between open attempts
    pub open_retry_delay: Duration,

    /// Connect attempts before the agent exits
    pub max_connect_attempts: u32,

    /// Delay between connect attempts
    pub connect_retry_delay: Duration,

    /// Messages a single stream may emit inside one rate window
    pub rate_limit: u32,

    /// Time after which one emitted message's slot is released
    pub rate_window: Duration,

    /// File size ceiling that triggers a truncate after the next read (0 = off)
    pub truncate_limit: u64,

    /// Number of duplicate lines between two "repeated" notices
    pub repeat_threshold: u32,

    /// Fallback size check cadence
    pub poll_interval: Duration,

    /// Agent-wide identifier
    pub identifier: String,

    /// Syslog facility of forwarded messages
    pub facility: Facility,

    /// Syslog severity of forwarded messages
    pub severity: Severity,

    /// Diagnostic log level (an `EnvFilter` directive)
    pub log_level: String,

    /// Diagnostic log file, stdout when absent
    pub log_file: Option<PathBuf>,

    /// Pid file written at startup, when present
    pub pid_file: Option<PathBuf>,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub key: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    fn for_key(key: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Configuration error for {}: {}", key, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Shape of the optional JSON config file. Every field is optional; missing
/// fields keep their default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    streams: Option<Vec<StreamConfig>>,
    remote_host: Option<String>,
    remote_port: Option<u16>,
    remote_proto: Option<Protocol>,
    max_open_attempts: Option<u32>,
    open_retry_delay_ms: Option<u64>,
    max_connect_attempts: Option<u32>,
    connect_retry_delay_ms: Option<u64>,
    rate_limit: Option<u32>,
    rate_time_ms: Option<u64>,
    truncate_limit: Option<u64>,
    repeat_threshold: Option<u32>,
    poll_interval_ms: Option<u64>,
    identifier: Option<String>,
    facility: Option<Facility>,
    severity: Option<Severity>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from an optional JSON file and the process
    /// environment.
    ///
    /// When `config_file` is `None` the `TAIL_RELAY_CONFIG_FILE` variable is
    /// consulted. Environment variables override values from the file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// environment variable holds an invalid value, or if the merged
    /// configuration fails validation.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, |key| env::var(key).ok())
    }

    /// Same as [`Config::load`] with an explicit variable lookup.
    pub fn load_with<F>(config_file: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let file = config_file
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_FILE_ENV).map(PathBuf::from));
        if let Some(path) = file {
            config.merge_file(&path)?;
        }

        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document and merge it over the current values.
    pub fn merge_json(&mut self, json: &str) -> Result<(), ConfigError> {
        let file: FileConfig = serde_json::from_str(json)
            .map_err(|e| ConfigError::new(format!("invalid config file: {}", e)))?;

        if let Some(streams) = file.streams {
            self.streams = streams;
        }
        if let Some(host) = file.remote_host {
            self.remote_host = host;
        }
        if let Some(port) = file.remote_port {
            self.remote_port = port;
        }
        if let Some(protocol) = file.remote_proto {
            self.protocol = protocol;
        }
        if let Some(attempts) = file.max_open_attempts {
            self.max_open_attempts = attempts;
        }
        if let Some(ms) = file.open_retry_delay_ms {
            self.open_retry_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.max_connect_attempts {
            self.max_connect_attempts = attempts;
        }
        if let Some(ms) = file.connect_retry_delay_ms {
            self.connect_retry_delay = Duration::from_millis(ms);
        }
        if let Some(limit) = file.rate_limit {
            self.rate_limit = limit;
        }
        if let Some(ms) = file.rate_time_ms {
            self.rate_window = Duration::from_millis(ms);
        }
        if let Some(limit) = file.truncate_limit {
            self.truncate_limit = limit;
        }
        if let Some(threshold) = file.repeat_threshold {
            self.repeat_threshold = threshold;
        }
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(identifier) = file.identifier {
            self.identifier = identifier;
        }
        if let Some(facility) = file.facility {
            self.facility = facility;
        }
        if let Some(severity) = file.severity {
            self.severity = severity;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if file.log_file.is_some() {
            self.log_file = file.log_file;
        }
        if file.pid_file.is_some() {
            self.pid_file = file.pid_file;
        }

        Ok(())
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!(
                "can't open config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        self.merge_json(&json)
    }

    /// Apply `TAIL_RELAY_*` overrides.
    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TAIL_RELAY_STREAMS") {
            self.streams = parse_streams("TAIL_RELAY_STREAMS", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_REMOTE_HOST") {
            self.remote_host = value.trim().to_string();
        }
        if let Some(value) = lookup("TAIL_RELAY_REMOTE_PORT") {
            self.remote_port = parse_value("TAIL_RELAY_REMOTE_PORT", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_REMOTE_PROTO") {
            self.protocol = parse_value("TAIL_RELAY_REMOTE_PROTO", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_MAX_OPEN_ATTEMPTS") {
            self.max_open_attempts = parse_value("TAIL_RELAY_MAX_OPEN_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_OPEN_RETRY_DELAY_MS") {
            self.open_retry_delay =
                Duration::from_millis(parse_value("TAIL_RELAY_OPEN_RETRY_DELAY_MS", &value)?);
        }
        if let Some(value) = lookup("TAIL_RELAY_MAX_CONNECT_ATTEMPTS") {
            self.max_connect_attempts = parse_value("TAIL_RELAY_MAX_CONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_CONNECT_RETRY_DELAY_MS") {
            self.connect_retry_delay = Duration::from_millis(parse_value(
                "TAIL_RELAY_CONNECT_RETRY_DELAY_MS",
                &value,
            )?);
        }
        if let Some(value) = lookup("TAIL_RELAY_RATE_LIMIT") {
            self.rate_limit = parse_value("TAIL_RELAY_RATE_LIMIT", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_RATE_TIME_MS") {
            self.rate_window =
                Duration::from_millis(parse_value("TAIL_RELAY_RATE_TIME_MS", &value)?);
        }
        if let Some(value) = lookup("TAIL_RELAY_TRUNCATE_LIMIT") {
            self.truncate_limit = parse_value("TAIL_RELAY_TRUNCATE_LIMIT", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_REPEAT_THRESHOLD") {
            self.repeat_threshold = parse_value("TAIL_RELAY_REPEAT_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_POLL_INTERVAL_MS") {
            self.poll_interval =
                Duration::from_millis(parse_value("TAIL_RELAY_POLL_INTERVAL_MS", &value)?);
        }
        if let Some(value) = lookup("TAIL_RELAY_IDENTIFIER") {
            self.identifier = value;
        }
        if let Some(value) = lookup("TAIL_RELAY_FACILITY") {
            self.facility = parse_value("TAIL_RELAY_FACILITY", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_SEVERITY") {
            self.severity = parse_value("TAIL_RELAY_SEVERITY", &value)?;
        }
        if let Some(value) = lookup("TAIL_RELAY_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("TAIL_RELAY_LOG_FILE") {
            self.log_file = non_empty_path(&value);
        }
        if let Some(value) = lookup("TAIL_RELAY_PID_FILE") {
            self.pid_file = non_empty_path(&value);
        }

        Ok(())
    }

    /// Check the merged configuration for values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::for_key(
                "streams",
                "at least one stream must be configured",
            ));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.trim().is_empty() {
                return Err(ConfigError::for_key("streams", "stream id must not be empty"));
            }
            if !stream.path.is_absolute() {
                return Err(ConfigError::for_key(
                    "streams",
                    format!(
                        "path '{}' of stream '{}' is not absolute",
                        stream.path.display(),
                        stream.id
                    ),
                ));
            }
            if !seen.insert(stream.id.as_str()) {
                return Err(ConfigError::for_key(
                    "streams",
                    format!("duplicate stream id '{}'", stream.id),
                ));
            }
        }

        if self.remote_host.is_empty() {
            return Err(ConfigError::for_key("remote_host", "must not be empty"));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::for_key("remote_port", "invalid port 0"));
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::for_key(
                "max_connect_attempts",
                "must be greater than 0",
            ));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::for_key("rate_limit", "must be greater than 0"));
        }
        if self.rate_window.is_zero() {
            return Err(ConfigError::for_key("rate_time_ms", "must be greater than 0"));
        }
        if self.repeat_threshold == 0 {
            return Err(ConfigError::for_key(
                "repeat_threshold",
                "must be greater than 0",
            ));
        }
        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(ConfigError::for_key(
                "poll_interval_ms",
                format!(
                    "poll interval {}ms is below minimum ({}ms)",
                    self.poll_interval.as_millis(),
                    MIN_POLL_INTERVAL_MS
                ),
            ));
        }

        Ok(())
    }

    /// `host:port` of the remote collector, suitable for name resolution.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            remote_host: DEFAULT_REMOTE_HOST.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            protocol: Protocol::Tcp,
            max_open_attempts: DEFAULT_MAX_OPEN_ATTEMPTS,
            open_retry_delay: Duration::from_millis(DEFAULT_OPEN_RETRY_DELAY_MS),
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            connect_retry_delay: Duration::from_millis(DEFAULT_CONNECT_RETRY_DELAY_MS),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: Duration::from_millis(DEFAULT_RATE_TIME_MS),
            truncate_limit: DEFAULT_TRUNCATE_LIMIT,
            repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            identifier: DEFAULT_IDENTIFIER.to_string(),
            facility: Facility::Local0,
            severity: Severity::Info,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
            pid_file: None,
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::for_key(key, format!("'{}' is not valid: {}", value, e)))
}

/// Parse `id=/abs/path,id2=/abs/path2`.
fn parse_streams(key: &str, value: &str) -> Result<Vec<StreamConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, path) = entry.split_once('=').ok_or_else(|| {
                ConfigError::for_key(key, format!("'{}' is not of the form id=/path", entry))
            })?;
            Ok(StreamConfig::new(id.trim(), path.trim()))
        })
        .collect()
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}
