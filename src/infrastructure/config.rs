//! Configuration infrastructure
//!
//! Layered loading with the `config` crate:
//! 1. Built-in defaults (`defaults` module)
//! 2. Optional TOML/YAML/JSON file
//! 3. `CATALOG_CRAWLER_*` environment variables (`__` separates nested keys,
//!    e.g. `CATALOG_CRAWLER_HTTP__TIMEOUT_SECS=10`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },

    #[error("Environment variable error: {message}")]
    Environment { message: String },
}

/// Complete crawler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Site profile id (`adidas`, `lacoste`, ...)
    pub site: String,
    /// JSON-lines output path; stdout when absent
    pub output: Option<PathBuf>,
    pub max_in_flight: usize,
    pub completion_timeout_secs: u64,
    pub max_item_attempts: u32,
    pub sweep_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub stats_interval_secs: u64,
    pub emit_incomplete: bool,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// HTTP transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_requests_per_second: u32,
    /// Resubmissions allowed after a retryable failure
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub follow_redirects: bool,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to `logs/` next to the executable
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// Per-target level overrides, e.g. `reqwest = "warn"`
    pub module_filters: HashMap<String, String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            output: None,
            max_in_flight: defaults::MAX_IN_FLIGHT,
            completion_timeout_secs: defaults::COMPLETION_TIMEOUT_SECS,
            max_item_attempts: defaults::MAX_ITEM_ATTEMPTS,
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
            shutdown_timeout_secs: defaults::SHUTDOWN_TIMEOUT_SECS,
            stats_interval_secs: defaults::STATS_INTERVAL_SECS,
            emit_incomplete: defaults::EMIT_INCOMPLETE,
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::USER_AGENT.to_string(),
            timeout_secs: defaults::FETCH_TIMEOUT_SECS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            max_retries: defaults::MAX_RETRIES,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            follow_redirects: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            module_filters: HashMap::from([
                ("reqwest".to_string(), "info".to_string()),
                ("hyper".to_string(), "warn".to_string()),
                ("h2".to_string(), "warn".to_string()),
            ]),
        }
    }
}

impl CrawlerConfig {
    /// Defaults, then `path` (if any), then the environment
    ///
    /// # Errors
    /// [`ConfigError::FileLoad`] for unreadable sources, [`ConfigError::Validation`]
    /// for out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Self::environment())
    }

    /// 설정 파일에서 로드 (파일 필수)
    ///
    /// # Errors
    /// See [`CrawlerConfig::load`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Validation {
                message: format!("config file {} does not exist", path.display()),
            });
        }
        Self::load(Some(path))
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(defaults::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder.add_source(env).build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// 설정값 유효성 검증
    ///
    /// # Errors
    /// [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_in_flight", self.max_in_flight as u64),
            ("max_item_attempts", u64::from(self.max_item_attempts)),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("stats_interval_secs", self.stats_interval_secs),
            ("completion_timeout_secs", self.completion_timeout_secs),
            ("http.timeout_secs", self.http.timeout_secs),
            (
                "http.max_requests_per_second",
                u64::from(self.http.max_requests_per_second),
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation {
                message: format!("{name} must be greater than 0"),
            });
        }

        if self.http.retry_base_delay_ms > self.http.retry_max_delay_ms {
            return Err(ConfigError::Validation {
                message: "http.retry_base_delay_ms cannot be greater than http.retry_max_delay_ms"
                    .to_string(),
            });
        }
        if self.http.retry_max_delay_ms >= self.http.timeout_secs.saturating_mul(1000) {
            return Err(ConfigError::Validation {
                message: "http.retry_max_delay_ms must be shorter than http.timeout_secs".to_string(),
            });
        }

        let level = self.logging.level.to_lowercase();
        if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
            return Err(ConfigError::Validation {
                message: format!("unknown log level '{}'", self.logging.level),
            });
        }

        Ok(())
    }
}

/// Default configuration values
pub mod defaults {
    /// Environment variable prefix
    pub const ENV_PREFIX: &str = "CATALOG_CRAWLER";

    pub const MAX_IN_FLIGHT: usize = 8;
    pub const FETCH_TIMEOUT_SECS: u64 = 30;
    /// Incomplete items older than this are evicted (5분)
    pub const COMPLETION_TIMEOUT_SECS: u64 = 300;
    pub const MAX_ITEM_ATTEMPTS: u32 = 3;
    pub const SWEEP_INTERVAL_MS: u64 = 1000;
    pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
    pub const STATS_INTERVAL_SECS: u64 = 10;
    pub const EMIT_INCOMPLETE: bool = true;

    pub const USER_AGENT: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) catalog-crawler/0.1";
    pub const MAX_REQUESTS_PER_SECOND: u32 = 5;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 500;
    pub const RETRY_MAX_DELAY_MS: u64 = 10_000;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
    pub const LOG_FILE_NAME: &str = "catalog-crawler.log";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> config::Environment {
        config::Environment::with_prefix(defaults::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(HashMap::<String, String>::new().into_iter().collect()))
    }

    #[test]
    fn defaults_are_valid() {
        assert!(CrawlerConfig::default().validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
site = "lacoste"
max_in_flight = 4

[http]
timeout_secs = 12
"#
        )
        .unwrap();

        let config = CrawlerConfig::load_with_env(Some(file.path()), no_env()).unwrap();
        assert_eq!(config.site, "lacoste");
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.http.timeout_secs, 12);
        assert_eq!(config.http.max_retries, defaults::MAX_RETRIES);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn environment_overrides_nested_keys() {
        let vars: HashMap<String, String> = HashMap::from([
            ("CATALOG_CRAWLER_MAX_IN_FLIGHT".to_string(), "7".to_string()),
            ("CATALOG_CRAWLER_HTTP__MAX_RETRIES".to_string(), "1".to_string()),
        ]);
        let env = config::Environment::with_prefix(defaults::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars.into_iter().collect()));

        let config = CrawlerConfig::load_with_env(None, env).unwrap();
        assert_eq!(config.max_in_flight, 7);
        assert_eq!(config.http.max_retries, 1);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = CrawlerConfig::default().with_max_in_flight(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_in_flight"));
    }

    #[test]
    fn retry_delay_must_fit_inside_request_timeout() {
        let mut config = CrawlerConfig::default();
        config.http.timeout_secs = 1;
        config.http.retry_base_delay_ms = 500;
        config.http.retry_max_delay_ms = 1500;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_max_delay_ms"));

        config.http.retry_max_delay_ms = 900;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut config = CrawlerConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn bundled_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = CrawlerConfig::load_with_env(Some(&path), no_env()).unwrap();
        assert_eq!(config.site, "adidas");
        assert_eq!(config.logging.module_filters["reqwest"], "warn");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = CrawlerConfig::from_file(Path::new("/nonexistent/crawler.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }
}
