//! Resolver configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use displaydoc::Display;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while loading a [`ResolverConfig`].
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not parse resolver configuration: {0}
    InvalidYaml(#[from] serde_yaml::Error),

    /// invalid value for '{field}': {reason}
    InvalidValue { field: &'static str, reason: String },
}

/// Configuration of a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct ResolverConfig {
    /// Maximum number of resolve calls running at the same time. Further calls wait for
    /// a slot.
    /// (default: 32)
    pub max_concurrency: usize,

    /// Capacity of the queue between the subscription event loop and its callers.
    /// (default: 1024)
    pub subscription_update_buffer: usize,

    /// Interval between keepalive frames on idle subscriptions, in human-readable
    /// format. Set to `null` to disable heartbeats.
    /// (default: 5s)
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub heartbeat_interval: Option<Duration>,

    /// Time allowed for resolving one subscription update, in human-readable format.
    /// (default: 30s)
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub subscription_fetch_timeout: Duration,

    /// Number of shards of the single-flight map.
    /// (default: 4)
    pub single_flight_shards: usize,

    /// Framing of incremental responses.
    pub multipart: MultipartConfig,

    /// In-memory cross-request cache. Disabled when absent.
    pub l2_cache: Option<L2CacheConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            subscription_update_buffer: 1024,
            heartbeat_interval: Some(Duration::from_secs(5)),
            subscription_fetch_timeout: Duration::from_secs(30),
            single_flight_shards: 4,
            multipart: MultipartConfig::default(),
            l2_cache: None,
        }
    }
}

impl ResolverConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.subscription_update_buffer == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "subscription_update_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.multipart.boundary.is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "multipart.boundary",
                reason: "must not be empty".to_string(),
            });
        }
        if let Err(err) = self.multipart.content_type.parse::<mime::Mime>() {
            return Err(ConfigurationError::InvalidValue {
                field: "multipart.content_type",
                reason: err.to_string(),
            });
        }
        Ok(())
    }
}

/// Framing of the parts of an incremental response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct MultipartConfig {
    /// Delimiter token written between parts.
    /// (default: graphql)
    pub boundary: String,
    /// MIME type written in the header of each part.
    /// (default: application/json; charset=utf-8)
    pub content_type: String,
}

pub(crate) const DEFAULT_BOUNDARY: &str = "graphql";
pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

/// In-memory L2 cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct L2CacheConfig {
    /// Name fetches use to refer to this cache.
    #[serde(default = "default_cache_name")]
    pub name: String,
    /// Maximum number of entries.
    #[schemars(with = "usize")]
    pub capacity: NonZeroUsize,
    /// TTL of entries written without an explicit one.
    #[serde(with = "humantime_serde", default)]
    #[schemars(with = "Option<String>", default)]
    pub default_ttl: Option<Duration>,
}

fn default_cache_name() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = ResolverConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ResolverConfig::default());
        assert_eq!(config.multipart.content_type, "application/json; charset=utf-8");
    }

    #[test]
    fn parses_durations_and_cache() {
        let config = ResolverConfig::from_yaml(
            r#"
max_concurrency: 8
heartbeat_interval: 10s
subscription_fetch_timeout: 1m 30s
l2_cache:
  capacity: 100
  default_ttl: 5m
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.subscription_fetch_timeout, Duration::from_secs(90));
        let l2 = config.l2_cache.unwrap();
        assert_eq!(l2.name, "default");
        assert_eq!(l2.capacity.get(), 100);
        assert_eq!(l2.default_ttl, Some(Duration::from_secs(300)));
    }

    #[test]
    fn heartbeats_can_be_disabled() {
        let config = ResolverConfig::from_yaml("heartbeat_interval: null").unwrap();
        assert_eq!(config.heartbeat_interval, None);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = ResolverConfig::from_yaml("max_concurency: 8").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidYaml(_)));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = ResolverConfig::from_yaml("max_concurrency: 0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for 'max_concurrency': must be at least 1"
        );
        let err = ResolverConfig::from_yaml("multipart:\n  content_type: json").unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidValue { field: "multipart.content_type", .. }
        ));
    }

    #[test]
    fn schema_is_generated() {
        let schema = schemars::schema_for!(ResolverConfig);
        let schema = serde_json::to_value(schema).unwrap();
        assert!(schema.to_string().contains("subscription_fetch_timeout"));
    }
}
