use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address to bind the HTTP server to (default 0.0.0.0:3000)
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Accepted API keys for the `key` query parameter. An empty list
    /// disables the check.
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub gtfs: GtfsConfig,
    #[serde(default)]
    pub api: ApiDefaults,
}

/// GTFS static feed and GTFS-RT polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GtfsConfig {
    /// Local path to a GTFS zip. Takes precedence over `static_feed_url`.
    #[serde(default)]
    pub static_feed_path: Option<String>,
    /// URL of the static GTFS zip; downloaded to `cache_dir` with
    /// conditional requests.
    #[serde(default)]
    pub static_feed_url: Option<String>,
    /// Cache directory for downloaded feeds (default: ./gtfs-cache)
    #[serde(default = "GtfsConfig::default_cache_dir")]
    pub cache_dir: String,
    /// URL of the GTFS-RT protobuf feed. When absent, no polling happens
    /// and responses are schedule-only.
    #[serde(default)]
    pub realtime_feed_url: Option<String>,
    /// Seconds between GTFS-RT polls (default: 30)
    #[serde(default = "GtfsConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl GtfsConfig {
    fn default_cache_dir() -> String {
        "./gtfs-cache".to_string()
    }
    fn default_poll_interval_secs() -> u64 {
        30
    }
}

/// Request-facing defaults for the where endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDefaults {
    /// Default minutes before `time` for arrival windows (default: 5)
    #[serde(default = "ApiDefaults::default_minutes_before")]
    pub minutes_before: u32,
    /// Default minutes after `time` for arrival windows (default: 35)
    #[serde(default = "ApiDefaults::default_minutes_after")]
    pub minutes_after: u32,
    /// Wall-clock budget per request in seconds (default: 5)
    #[serde(default = "ApiDefaults::default_request_deadline_secs")]
    pub request_deadline_secs: u64,
}

impl Default for ApiDefaults {
    fn default() -> Self {
        Self {
            minutes_before: Self::default_minutes_before(),
            minutes_after: Self::default_minutes_after(),
            request_deadline_secs: Self::default_request_deadline_secs(),
        }
    }
}

impl ApiDefaults {
    fn default_minutes_before() -> u32 {
        5
    }
    fn default_minutes_after() -> u32 {
        35
    }
    fn default_request_deadline_secs() -> u64 {
        5
    }
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gtfs.static_feed_path.is_none() && self.gtfs.static_feed_url.is_none() {
            return Err(ConfigError::Invalid(
                "one of gtfs.static_feed_path or gtfs.static_feed_url is required".to_string(),
            ));
        }
        if self.api.minutes_before > 24 * 60 || self.api.minutes_after > 24 * 60 {
            return Err(ConfigError::Invalid(
                "api.minutes_before/minutes_after must not exceed one day".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `key` authorizes a request.
    pub fn key_allowed(&self, key: Option<&str>) -> bool {
        if self.api_keys.is_empty() {
            return true;
        }
        key.map_or(false, |k| self.api_keys.iter().any(|allowed| allowed == k))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    ReadError(String),
    #[error("config file is not valid YAML: {0}")]
    ParseError(String),
    #[error("config rejected: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("gtfs:\n  static_feed_path: ./feed.zip\n");
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.gtfs.poll_interval_secs, 30);
        assert_eq!(config.api.minutes_before, 5);
        assert_eq!(config.api.minutes_after, 35);
        assert_eq!(config.api.request_deadline_secs, 5);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_feed_source_required() {
        let config: Config = serde_yaml::from_str("gtfs: {}\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_window_defaults_bounded() {
        let config: Config = serde_yaml::from_str(
            "gtfs:\n  static_feed_path: ./feed.zip\napi:\n  minutes_after: 3000\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_key_allowed_open_when_no_keys() {
        let config = parse("gtfs:\n  static_feed_path: ./feed.zip\n");
        assert!(config.key_allowed(None));
        assert!(config.key_allowed(Some("anything")));
    }

    #[test]
    fn test_key_allowed_checks_list() {
        let config = parse("gtfs:\n  static_feed_path: ./feed.zip\napi_keys:\n  - secret\n");
        assert!(config.key_allowed(Some("secret")));
        assert!(!config.key_allowed(Some("wrong")));
        assert!(!config.key_allowed(None));
    }
}
