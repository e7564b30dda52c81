use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "memocache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the moka-backed [`MemoryCache`](crate::caching::MemoryCache).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum weight of all entries, in bytes of key and value.
    pub capacity: u64,

    /// Expiration applied to writes that do not carry their own ttl.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Option<Duration>,

    /// A prefix prepended to every key.
    pub namespace: Option<String>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100 * 1024 * 1024,
            default_ttl: None,
            namespace: None,
        }
    }
}

/// Tunables of the stampede lease lock.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a lease is held before it expires on its own.
    ///
    /// This should safely exceed the duration of the protected computation.
    #[serde(with = "humantime_serde")]
    pub lease: Duration,

    /// How often a waiting caller checks for the value.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a waiting caller polls before trying to take the lease itself.
    ///
    /// Defaults to the lease duration.
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,
}

impl LeaseConfig {
    /// Creates a config with the given lease and default polling.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            ..Default::default()
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait.unwrap_or(self.lease)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            max_wait: None,
        }
    }
}

/// Defaults applied to cache wrappers via `with_config`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheDefaults {
    /// Time-to-live of written values. `None` defers to the backend.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Upper bound for every single backend operation.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Lease settings of stampede protected wrappers.
    pub lease: LeaseConfig,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            ttl: None,
            timeout: Some(Duration::from_secs(5)),
            lease: LeaseConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,

    pub metrics: Metrics,

    pub sentry_dsn: Option<Dsn>,

    /// Settings of the in-memory backend.
    pub memory: MemoryCacheConfig,

    /// Defaults for all cache wrappers.
    pub defaults: CacheDefaults,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
