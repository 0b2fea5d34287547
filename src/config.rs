//! Configuration loading and validation.
//!
//! Configuration is read once at startup from a TOML file. A fixed set of
//! environment variables takes precedence over file values so deployments
//! can inject credentials and wiring without editing the file.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::geo::{BoundingBox, Position};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_cache_host() -> String {
    "localhost".to_string()
}

fn default_cache_port() -> u16 {
    6379
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_tick_interval() -> u64 {
    15
}

fn default_ingress_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ingress_port() -> u16 {
    8080
}

fn default_max_push_records() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    15
}

fn default_push_buffer_ttl() -> u64 {
    120
}

/// Cache (Redis) wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_cache_host(),
            port: default_cache_port(),
            db: 0,
            default_ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

/// Aircraft-registry load settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// Candidate CSV paths, first match wins.
    #[serde(default)]
    pub csv_paths: Vec<String>,
    /// Optional one-shot fetch URL used when no candidate path exists.
    #[serde(default)]
    pub fallback_url: Option<String>,
}

/// Region scheduler cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

/// Push-ingress HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_host")]
    pub host: String,
    #[serde(default = "default_ingress_port")]
    pub port: u16,
    /// Maximum records accepted in a single push.
    #[serde(default = "default_max_push_records")]
    pub max_push_records: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            host: default_ingress_host(),
            port: default_ingress_port(),
            max_push_records: default_max_push_records(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Region-scoped shared secrets for the push ingress, keyed by region id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub shared_secrets: HashMap<String, String>,
}

/// One data source attached to a region.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    LocalReceiver {
        url: String,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: u64,
    },
    WideArea {
        url: String,
        #[serde(default)]
        anonymous: bool,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: u64,
    },
    Push {
        #[serde(default = "default_push_buffer_ttl")]
        station_buffer_ttl_seconds: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CenterConfig {
    pub lat: f64,
    pub lon: f64,
}

/// One geographic collection region.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub name: String,
    pub timezone: String,
    pub center: CenterConfig,
    pub radius_miles: f64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl RegionConfig {
    pub fn center_position(&self) -> Position {
        Position::new(self.center.lat, self.center.lon)
    }

    /// The region's widened bounding box.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::around(self.center_position(), self.radius_miles)
    }

    pub fn local_receiver(&self) -> Option<(&str, Duration)> {
        self.sources.iter().find_map(|s| match s {
            SourceConfig::LocalReceiver {
                url,
                poll_interval_seconds,
            } => Some((url.as_str(), Duration::from_secs(*poll_interval_seconds))),
            _ => None,
        })
    }

    pub fn wide_area(&self) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| matches!(s, SourceConfig::WideArea { .. }))
    }

    pub fn push_source(&self) -> Option<Duration> {
        self.sources.iter().find_map(|s| match s {
            SourceConfig::Push {
                station_buffer_ttl_seconds,
            } => Some(Duration::from_secs(*station_buffer_ttl_seconds)),
            _ => None,
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string without touching the environment. Used by
    /// tests and embedded fixtures.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Enumerated environment overrides; set variables win over the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.cache.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.cache.port = port;
            }
        }
        if let Ok(db) = std::env::var("REDIS_DB") {
            if let Ok(db) = db.parse() {
                self.cache.db = db;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(secs) = std::env::var("TICK_INTERVAL_SECONDS") {
            if let Ok(secs) = secs.parse() {
                self.scheduler.tick_interval_seconds = secs;
            }
        }
        if let Ok(host) = std::env::var("INGRESS_HOST") {
            self.ingress.host = host;
        }
        if let Ok(port) = std::env::var("INGRESS_PORT") {
            if let Ok(port) = port.parse() {
                self.ingress.port = port;
            }
        }
        if let Ok(url) = std::env::var("REGISTRY_FALLBACK_URL") {
            self.registry.fallback_url = Some(url);
        }

        let username = std::env::var("OPENSKY_USERNAME").ok();
        let password = std::env::var("OPENSKY_PASSWORD").ok();
        if username.is_some() || password.is_some() {
            for region in &mut self.regions {
                for source in &mut region.sources {
                    if let SourceConfig::WideArea {
                        anonymous,
                        username: u,
                        password: p,
                        ..
                    } = source
                    {
                        if let Some(name) = &username {
                            *u = Some(name.clone());
                            *anonymous = false;
                        }
                        if let Some(pass) = &password {
                            *p = Some(pass.clone());
                        }
                    }
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::Invalid("no regions configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for region in &self.regions {
            if region.id.is_empty() {
                return Err(ConfigError::Invalid("region with empty id".into()));
            }
            if !seen.insert(region.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate region id '{}'",
                    region.id
                )));
            }
            if region.radius_miles <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "region '{}': radius_miles must be positive",
                    region.id
                )));
            }

            for source in &region.sources {
                match source {
                    SourceConfig::WideArea {
                        anonymous,
                        username,
                        password,
                        ..
                    } => {
                        if !anonymous && (username.is_none() || password.is_none()) {
                            return Err(ConfigError::Invalid(format!(
                                "region '{}': wide_area source needs username and password unless anonymous",
                                region.id
                            )));
                        }
                    }
                    SourceConfig::Push { .. } => {
                        let secret =
                            self.push.shared_secrets.get(&region.id).ok_or_else(|| {
                                ConfigError::Invalid(format!(
                                    "region '{}' has a push source but no shared secret",
                                    region.id
                                ))
                            })?;
                        let prefix = secret.split('.').next().unwrap_or("");
                        if prefix != region.id {
                            return Err(ConfigError::Invalid(format!(
                                "region '{}': shared secret prefix '{}' does not match the region id",
                                region.id, prefix
                            )));
                        }
                    }
                    SourceConfig::LocalReceiver { url, .. } => {
                        if url.is_empty() {
                            return Err(ConfigError::Invalid(format!(
                                "region '{}': local_receiver url is empty",
                                region.id
                            )));
                        }
                    }
                }
            }
        }

        if self.scheduler.tick_interval_seconds < 5 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_seconds must be at least 5".into(),
            ));
        }

        Ok(())
    }

    /// Region lookup by id.
    pub fn region(&self, id: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [cache]
        host = "cache.internal"
        port = 6380

        [scheduler]
        tick_interval_seconds = 15

        [push.shared_secrets]
        etex = "etex.super-secret"

        [[regions]]
        id = "etex"
        name = "East Texas"
        timezone = "America/Chicago"
        center = { lat = 32.3513, lon = -95.3011 }
        radius_miles = 150.0

        [[regions.sources]]
        type = "local_receiver"
        url = "http://receiver.local"
        poll_interval_seconds = 15

        [[regions.sources]]
        type = "wide_area"
        url = "https://opensky-network.org/api/states/all"
        anonymous = true
        poll_interval_seconds = 60

        [[regions.sources]]
        type = "push"
        station_buffer_ttl_seconds = 120
    "#;

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.cache.host, "cache.internal");
        assert_eq!(config.cache.url(), "redis://cache.internal:6380/0");
        assert_eq!(config.regions.len(), 1);

        let region = config.region("etex").unwrap();
        assert_eq!(region.sources.len(), 3);
        assert!(region.local_receiver().is_some());
        assert!(region.wide_area().is_some());
        assert_eq!(
            region.push_source(),
            Some(std::time::Duration::from_secs(120))
        );
    }

    #[test]
    fn test_region_bounding_box_derivation() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let bbox = config.regions[0].bounding_box();
        assert!(bbox.south < 32.3513 && bbox.north > 32.3513);
        assert!(bbox.west < -95.3011 && bbox.east > -95.3011);
    }

    #[test]
    fn test_rejects_empty_regions() {
        let err = Config::from_toml("[cache]\nhost = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_duplicate_region_ids() {
        let toml = r#"
            [[regions]]
            id = "r1"
            name = "One"
            timezone = "UTC"
            center = { lat = 0.0, lon = 0.0 }
            radius_miles = 10.0

            [[regions]]
            id = "r1"
            name = "Two"
            timezone = "UTC"
            center = { lat = 1.0, lon = 1.0 }
            radius_miles = 10.0
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_rejects_secret_prefix_mismatch() {
        let toml = r#"
            [push.shared_secrets]
            etex = "other.super-secret"

            [[regions]]
            id = "etex"
            name = "East Texas"
            timezone = "America/Chicago"
            center = { lat = 32.3513, lon = -95.3011 }
            radius_miles = 150.0

            [[regions.sources]]
            type = "push"
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn test_rejects_push_without_secret() {
        let toml = r#"
            [[regions]]
            id = "etex"
            name = "East Texas"
            timezone = "America/Chicago"
            center = { lat = 32.3513, lon = -95.3011 }
            radius_miles = 150.0

            [[regions.sources]]
            type = "push"
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_rejects_authenticated_wide_area_without_credentials() {
        let toml = r#"
            [[regions]]
            id = "r1"
            name = "One"
            timezone = "UTC"
            center = { lat = 0.0, lon = 0.0 }
            radius_miles = 10.0

            [[regions.sources]]
            type = "wide_area"
            url = "https://example.org/states"
            anonymous = false
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_rejects_short_tick_interval() {
        let toml = r#"
            [scheduler]
            tick_interval_seconds = 2

            [[regions]]
            id = "r1"
            name = "One"
            timezone = "UTC"
            center = { lat = 0.0, lon = 0.0 }
            radius_miles = 10.0
        "#;
        assert!(Config::from_toml(toml).is_err());
    }
}
