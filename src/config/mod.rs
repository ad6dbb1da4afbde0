use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bench: Bench,
    pub request: Request,
    #[serde(default)]
    pub output: Output,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bench {
    /// Target request rate across all connections, requests per second.
    #[serde(default = "default_request_rate")]
    pub request_rate: f64,
    /// Number of concurrent connections. 0 sizes the pool from the rate and
    /// the request timeout, with 20% headroom.
    #[serde(default)]
    pub connections: u64,
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Fixed latency floor subtracted from every recorded sample (e.g. a
    /// known network round-trip minimum).
    #[serde(default, with = "humantime_serde")]
    pub base_latency: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Keep connections alive between requests.
    #[serde(default)]
    pub reuse_connections: bool,
    /// Force the spin-polling ticker regardless of the measured OS timer
    /// resolution.
    #[serde(default)]
    pub tight_ticker: bool,
    /// Emit the summary as JSON in addition to the table.
    #[serde(default)]
    pub output_json: bool,
}

impl Default for Bench {
    fn default() -> Self {
        Self {
            request_rate: default_request_rate(),
            connections: 0,
            duration: default_duration(),
            base_latency: Duration::ZERO,
            request_timeout: default_request_timeout(),
            reuse_connections: false,
            tight_ticker: false,
            output_json: false,
        }
    }
}

fn default_request_rate() -> f64 {
    1000.0
}

fn default_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Bench {
    /// Effective connection count: the configured value, or an auto-sized
    /// pool large enough that every in-flight request can ride out a full
    /// timeout without starving the tick channel.
    pub fn effective_connections(&self) -> u64 {
        if self.connections > 0 {
            return self.connections;
        }
        let base = (self.request_rate * self.request_timeout.as_secs_f64().ceil()) as u64;
        (base + base / 5).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    #[serde(rename = "HTTP/1.1", alias = "http1")]
    Http1,
    #[serde(rename = "HTTP/2", alias = "http2")]
    Http2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub protocol: Protocol,
    /// Single target URL. Ignored when `urls` is set, except as the base for
    /// `hosts` substitution.
    #[serde(default)]
    pub url: Option<String>,
    /// Multiple target URLs, rotated round-robin across requests.
    #[serde(default)]
    pub urls: Vec<String>,
    /// Host[:port] values substituted into `url`, rotated round-robin.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// HTTP method. Defaults to GET, or POST when a body is configured.
    #[serde(default)]
    pub method: Option<String>,
    /// Request headers. Values may reference environment variables as
    /// `$NAME` or `${NAME}`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// File to read the request body from; takes precedence over `body`.
    #[serde(default)]
    pub body_file: Option<PathBuf>,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

fn default_expected_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    /// Path for the latency distribution file.
    #[serde(default = "default_out_file")]
    pub file: PathBuf,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            file: default_out_file(),
        }
    }
}

fn default_out_file() -> PathBuf {
    PathBuf::from("out/res.hgrm")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.bench.request_rate > 0.0) {
            return Err(ConfigError::Invalid(
                "bench.request_rate must be positive".to_string(),
            ));
        }
        if self.bench.duration.is_zero() {
            return Err(ConfigError::Invalid(
                "bench.duration must be positive".to_string(),
            ));
        }
        if self.request.url.is_none() && self.request.urls.is_empty() {
            return Err(ConfigError::Invalid(
                "request.url or request.urls is required".to_string(),
            ));
        }
        if !self.request.hosts.is_empty() && self.request.url.is_none() {
            return Err(ConfigError::Invalid(
                "request.hosts requires request.url as the base URL".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        // Simple parser for durations like "60s", "500ms", "10m"
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let (num, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));

        let value: u64 = num.parse().map_err(|e| format!("invalid number: {e}"))?;

        let multiplier = match suffix.trim() {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "ms" => return Ok(Duration::from_millis(value)),
            "us" => return Ok(Duration::from_micros(value)),
            "ns" => return Ok(Duration::from_nanos(value)),
            "" => 1, // default to seconds
            other => return Err(format!("unknown time unit: {other}")),
        };

        Ok(Duration::from_secs(value * multiplier))
    }
}
