// ⚙️ Configuration - every knob is a flag with an environment fallback

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::fetch::{BreakerConfig, FetchConfig};
use crate::model::FormType;
use crate::orchestrator::{PipelineConfig, MAX_CATCH_UP};
use crate::persistence::{AmendmentPolicy, BatchConfig};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Poll EDGAR for 13F holdings reports from watched CIKs and store them in SQLite
#[derive(Debug, Clone, Parser)]
#[command(name = "filing-ingest", version, about)]
pub struct Config {
    /// File with one CIK per line (`#` comments allowed)
    #[arg(long = "cik-file", alias = "cik", env = "CIK_FILE", default_value = "ciks.txt")]
    pub cik_file: PathBuf,

    /// SQLite database path
    #[arg(long, env = "DB_PATH", default_value = "sec_filings.db")]
    pub database: PathBuf,

    /// Contact identity sent as User-Agent, e.g. "Acme Research ops@acme.com"
    #[arg(long, env = "SEC_IDENTITY")]
    pub sec_identity: String,

    /// URL pinged after every completed tick
    #[arg(long, env = "HEALTHCHECK_URL")]
    pub healthcheck_url: Option<String>,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 30)]
    pub poll_interval_secs: u64,

    /// How far back a cold start (no stored high-water mark) looks
    #[arg(long, env = "CATCH_UP_HOURS", default_value_t = 24)]
    pub catch_up_hours: u64,

    /// Requests per second across all workers
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: usize,

    /// Longest a request waits for a rate-limit slot
    #[arg(long, env = "RATE_LIMIT_WAIT_MS", default_value_t = 5000)]
    pub rate_limit_wait_ms: u64,

    /// Pause after 429/503 when no Retry-After is given
    #[arg(long, env = "BACKOFF_SECS", default_value_t = 10)]
    pub backoff_secs: u64,

    #[arg(long, env = "BREAKER_FAILURE_RATIO", default_value_t = 0.5)]
    pub breaker_failure_ratio: f64,

    #[arg(long, env = "BREAKER_MIN_CALLS", default_value_t = 5)]
    pub breaker_min_calls: usize,

    #[arg(long, env = "BREAKER_WINDOW_SECS", default_value_t = 60)]
    pub breaker_window_secs: u64,

    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value_t = 5)]
    pub breaker_cooldown_secs: u64,

    #[arg(long, env = "BREAKER_MAX_COOLDOWN_SECS", default_value_t = 300)]
    pub breaker_max_cooldown_secs: u64,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Extra attempts after a network failure
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Concurrent fetch + parse workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 50)]
    pub batch_size: usize,

    #[arg(long, env = "BATCH_MAX_AGE_SECS", default_value_t = 30)]
    pub batch_max_age_secs: u64,

    /// Attempts for a batch that finds the database busy
    #[arg(long, env = "STORE_RETRIES", default_value_t = 5)]
    pub store_retries: u32,

    /// Feed pages read per form per tick
    #[arg(long, env = "MAX_PAGES", default_value_t = 10)]
    pub max_pages: usize,

    #[arg(long, env = "PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    /// What a 13F-HR/A does to the filing it amends
    #[arg(long, env = "AMENDMENT_POLICY", value_enum, default_value_t = AmendmentPolicy::Coexist)]
    pub amendment_policy: AmendmentPolicy,

    /// Fallback poll interval for watchlist changes
    #[arg(long, env = "WATCH_POLL_SECS", default_value_t = 5)]
    pub watch_poll_secs: u64,

    #[arg(long, env = "FEED_URL", default_value = "https://www.sec.gov/cgi-bin/browse-edgar")]
    pub feed_url: String,

    #[arg(long, env = "ARCHIVES_URL", default_value = "https://www.sec.gov/Archives/edgar/data")]
    pub archives_url: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// One JSON object per log line
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Run a single tick and exit
    #[arg(long)]
    pub once: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = self.sec_identity.trim();
        if identity.is_empty() {
            return Err(invalid("sec_identity", "must not be empty"));
        }
        if !identity.contains('@') {
            return Err(invalid(
                "sec_identity",
                "must include a contact e-mail address (SEC fair access policy)",
            ));
        }
        if self.rate_limit == 0 {
            return Err(invalid("rate_limit", "must be at least 1 request per second"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.page_size == 0 || self.max_pages == 0 {
            return Err(invalid("page_size", "page size and max pages must be at least 1"));
        }
        if !(self.breaker_failure_ratio > 0.0 && self.breaker_failure_ratio <= 1.0) {
            return Err(invalid("breaker_failure_ratio", "must be in (0, 1]"));
        }
        if self.breaker_min_calls == 0 {
            return Err(invalid("breaker_min_calls", "must be at least 1"));
        }
        if self.breaker_max_cooldown_secs < self.breaker_cooldown_secs {
            return Err(invalid(
                "breaker_max_cooldown_secs",
                "must not be below breaker_cooldown_secs",
            ));
        }
        if self.catch_up_hours.saturating_mul(3600) > MAX_CATCH_UP.as_secs() {
            return Err(invalid(
                "catch_up_hours",
                format!("must not exceed {} hours", MAX_CATCH_UP.as_secs() / 3600),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be at least 1"));
        }
        for (field, url) in [("feed_url", &self.feed_url), ("archives_url", &self.archives_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid(field, format!("{:?} is not an http(s) URL", url)));
            }
        }
        if let Some(url) = &self.healthcheck_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid("healthcheck_url", format!("{:?} is not an http(s) URL", url)));
            }
        }
        Ok(())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.sec_identity.trim().to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_wait: Duration::from_millis(self.rate_limit_wait_ms),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(500),
            default_backoff: Duration::from_secs(self.backoff_secs),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_ratio: self.breaker_failure_ratio,
            min_calls: self.breaker_min_calls,
            window: Duration::from_secs(self.breaker_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            max_cooldown: Duration::from_secs(self.breaker_max_cooldown_secs),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            max_batch_age: Duration::from_secs(self.batch_max_age_secs),
            store_retries: self.store_retries,
            retry_base_delay: Duration::from_millis(200),
            amendment_policy: self.amendment_policy,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            catch_up: Duration::from_secs(self.catch_up_hours.saturating_mul(3600)),
            workers: self.workers,
            archives_url: self.archives_url.clone(),
            discovery: DiscoveryConfig {
                feed_url: self.feed_url.clone(),
                page_size: self.page_size,
                max_pages: self.max_pages,
                forms: FormType::ALL.to_vec(),
            },
        }
    }
}
