use std::path::PathBuf;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::executor::RetryPolicy;
use crate::fetcher::DEFAULT_BASE_URL;

/// About one hundred years.
const MAX_RETENTION_SECS: u64 = 100 * 365 * 86_400;

/// Runtime settings: defaults, then `verb_scraper.toml` if present, then
/// `VERBS_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub retention_secs: u64,
    pub janitor_interval_secs: u64,
    pub batch_timeout_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Settings, ConfigError> {
        let builder = defaults()?
            .add_source(File::with_name("verb_scraper").required(false))
            .add_source(Environment::with_prefix("VERBS").try_parsing(true));
        Settings::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Settings, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Message("concurrency must be at least 1".into()));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(ConfigError::Message(format!(
                "jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.retention_secs > MAX_RETENTION_SECS {
            return Err(ConfigError::Message(format!(
                "retention_secs ({}) exceeds the {} maximum",
                self.retention_secs, MAX_RETENTION_SECS
            )));
        }
        if self.janitor_interval_secs == 0 {
            return Err(ConfigError::Message("janitor_interval_secs must be positive".into()));
        }
        if self.batch_timeout_secs == 0 {
            return Err(ConfigError::Message("batch_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// How long the CLI waits on a batch before giving up.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            jitter_ms: (self.jitter_min_ms, self.jitter_max_ms),
        }
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("db_path", "data/verbs.sqlite")?
        .set_default("base_url", DEFAULT_BASE_URL)?
        .set_default("request_timeout_secs", 10_i64)?
        .set_default("concurrency", 3_i64)?
        .set_default("queue_capacity", 64_i64)?
        .set_default("retry_attempts", 1_i64)?
        .set_default("retry_delay_ms", 500_i64)?
        .set_default("jitter_min_ms", 300_i64)?
        .set_default("jitter_max_ms", 1000_i64)?
        .set_default("retention_secs", 86_400_i64)?
        .set_default("janitor_interval_secs", 3_600_i64)?
        .set_default("batch_timeout_secs", 3_600_i64)
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn with_toml(toml: &str) -> Result<Settings, ConfigError> {
        Settings::from_builder(defaults().unwrap().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_builder(defaults().unwrap()).unwrap();
        assert_eq!(s.db_path, PathBuf::from("data/verbs.sqlite"));
        assert_eq!(s.base_url, DEFAULT_BASE_URL);
        assert_eq!(s.request_timeout(), Duration::from_secs(10));
        assert_eq!(s.engine_config().concurrency, 3);
        assert_eq!(s.engine_config().jitter_ms, (300, 1000));
        assert_eq!(s.retry_policy().attempts, 1);
        assert_eq!(s.retention(), Duration::from_secs(86_400));
        assert_eq!(s.janitor_interval(), Duration::from_secs(3_600));
        assert_eq!(s.batch_timeout(), Duration::from_secs(3_600));
    }

    #[test]
    fn file_overrides_defaults() {
        let s = with_toml("concurrency = 8\nretention_secs = 60\ndb_path = \"/tmp/v.sqlite\"").unwrap();
        assert_eq!(s.concurrency, 8);
        assert_eq!(s.retention_secs, 60);
        assert_eq!(s.db_path, PathBuf::from("/tmp/v.sqlite"));
        assert_eq!(s.queue_capacity, 64);
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert!(with_toml("concurrency = 0").is_err());
        assert!(with_toml("batch_timeout_secs = 0").is_err());
        assert!(with_toml("jitter_min_ms = 2000\njitter_max_ms = 100").is_err());
        assert!(with_toml("jitter_min_ms = 0\njitter_max_ms = 0").is_ok());
        assert!(with_toml("retention_secs = 10000000000000").is_err());
        assert!(with_toml("retention_secs = 3153600000").is_ok());
    }
}
