use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
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
    /// The log level for the proxy.
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
            prefix: "mediaproxy".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Expiry and maintenance of the on-disk content cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum duration since the last access of a cached item.
    ///
    /// Items that have not been served for longer than this are removed by the next sweep.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Source address filtering.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AccessConfig {
    /// File with one IP address per line that is never allowed to connect.
    ///
    /// Setting this to `null` disables the blacklist.
    pub blacklist: Option<PathBuf>,

    /// File with one IP address per line that is allowed to connect.
    ///
    /// An empty or missing whitelist allows every address that is not blacklisted.
    pub whitelist: Option<PathBuf>,

    /// Maximum age of a loaded address list before it is read again.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            blacklist: Some(PathBuf::from("blacklist.txt")),
            whitelist: Some(PathBuf::from("whitelist.txt")),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// The external program used to acquire content.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Program and arguments. Every occurrence of `{id}` is replaced with the media identifier.
    pub command: Vec<String>,

    /// Maximum number of bytes accepted from a single download.
    ///
    /// A value of `0` disables the limit.
    pub max_download_size: u64,

    /// Upper bound for the wall-clock duration of a single download.
    ///
    /// A value of `None` indicates no limit.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            command: [
                "youtube-dl",
                "-f",
                "251",
                "--quiet",
                "https://www.youtube.com/watch?v={id}",
                "-o",
                "-",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_download_size: 10 * 1024 * 1024,
            timeout: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory of the content cache.
    pub cache_dir: PathBuf,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfig,

    /// Source address allow and deny lists.
    pub access: AccessConfig,

    /// How content is acquired on a cache miss.
    pub downloader: DownloaderConfig,
}

impl Config {
    /// Return a cache directory `dir`, joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("cache"),
            bind: "0.0.0.0:81".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            access: AccessConfig::default(),
            downloader: DownloaderConfig::default(),
        }
    }
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
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        if config.downloader.command.is_empty() {
            anyhow::bail!("downloader command must not be empty");
        }
        if config.caches.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be positive");
        }
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.ttl, Duration::from_secs(1200));
        assert_eq!(cfg.caches.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.access.refresh_interval, Duration::from_secs(60));
        assert_eq!(cfg.downloader.max_download_size, 10 * 1024 * 1024);
        assert_eq!(cfg.cache_dir("media"), PathBuf::from("cache/media"));
    }

    #[test]
    fn test_partial_cache_config() {
        // It should be possible to set individual values in reasonable units without
        // affecting the other defaults.
        let yaml = r#"
            caches:
              ttl: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.ttl, Duration::from_secs(3600));
        assert_eq!(cfg.caches.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.access, AccessConfig::default());
        assert_eq!(cfg.downloader, DownloaderConfig::default());
    }

    #[test]
    fn test_downloader_config() {
        let yaml = r#"
            downloader:
              command: ["yt-dlp", "-o", "-", "{id}"]
              max_download_size: 0
              timeout: 30s
            access:
              whitelist: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.downloader.command, ["yt-dlp", "-o", "-", "{id}"]);
        assert_eq!(cfg.downloader.max_download_size, 0);
        assert_eq!(cfg.downloader.timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.access.whitelist, None);
        assert_eq!(cfg.access.blacklist, Some(PathBuf::from("blacklist.txt")));
    }

    #[test]
    fn test_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: verbose
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_negative_download_size_rejected() {
        let yaml = r#"
            downloader:
              max_download_size: -1
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = Config::from_reader("   \n".as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"config file empty");

        let yaml = r#"
            downloader:
              command: []
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"downloader command must not be empty");

        let yaml = r#"
            caches:
              sweep_interval: 0s
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"sweep interval must be positive");
    }
}
