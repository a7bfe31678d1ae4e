use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    profiled_env_opt(profile, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub queue: QueueConfig,
    pub fetch: FetchConfig,
    pub catalog: CatalogConfig,
    pub lease: LeaseConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VAULT_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("VAULT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            fetch: FetchConfig::from_env_profiled(p),
            catalog: CatalogConfig::from_env_profiled(p),
            lease: LeaseConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings that can only be programmer or operator mistakes.
    pub fn validate(&self) -> Result<(), VaultError> {
        self.fetch.validate()?;
        if self.lease.ttl_secs <= u64::from(self.queue.visibility_timeout_secs) {
            return Err(VaultError::Config(format!(
                "LEASE_TTL_SECS ({}) must exceed QUEUE_VISIBILITY_TIMEOUT_SECS ({})",
                self.lease.ttl_secs, self.queue.visibility_timeout_secs
            )));
        }
        if self.queue.max_batch_size == 0 {
            return Err(VaultError::Config("QUEUE_MAX_BATCH_SIZE must be positive".into()));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  storage:  scratch_dir={}, data_dir={}", self.storage.scratch_dir.display(), self.storage.data_dir.display());
        tracing::info!("  aws:      region={}, bucket={}", self.aws.region, self.aws.s3_bucket.as_deref().unwrap_or("(none, local backend)"));
        let queue = self
            .queue
            .queue_url
            .clone()
            .unwrap_or_else(|| self.queue.full_queue_name());
        tracing::info!("  queue:    {}", queue);
        tracing::info!("  fetch:    base_url={}, max_retry_depth={}", self.fetch.base_url, self.fetch.max_retry_depth);
        tracing::info!("  catalog:  path={}", self.catalog.path.display());
        tracing::info!("  lease:    ttl={}s", self.lease.ttl_secs);
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local scratch space for per-entity mirrors and staged downloads.
    pub scratch_dir: PathBuf,
    /// Root of the local object store used when no S3 bucket is configured.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        let scratch_default = env::temp_dir().join("sec");
        Self {
            scratch_dir: PathBuf::from(profiled_env_or(
                p,
                "SCRATCH_DIR",
                scratch_default.to_str().unwrap_or("/tmp/sec"),
            )),
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            s3_bucket: profiled_env_opt(p, "S3_BUCKET"),
            s3_prefix: profiled_env_opt(p, "S3_PREFIX"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    /// Whether archives live in S3 (otherwise the local data dir is used).
    pub fn is_configured(&self) -> bool {
        self.s3_bucket.is_some()
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Explicit queue URL. When absent the URL is resolved from the name.
    pub queue_url: Option<String>,
    pub project_prefix: String,
    pub queue_name: String,
    pub dlq_url: Option<String>,
    /// SQS endpoint override, kept separate from `AWS_ENDPOINT_URL` which may
    /// point at an S3-compatible store.
    pub endpoint_url: Option<String>,
    pub visibility_timeout_secs: u32,
    pub max_batch_size: u32,
    /// Sleep after an empty receive.
    pub idle_backoff_secs: u64,
    /// Sleep after a failed receive.
    pub poll_error_backoff_secs: u64,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            queue_url: profiled_env_opt(p, "QUEUE_URL"),
            project_prefix: profiled_env_or(p, "QUEUE_PROJECT_PREFIX", "sec_filings_"),
            queue_name: profiled_env_or(p, "QUEUE_NAME", "ciks_to_collect"),
            dlq_url: profiled_env_opt(p, "QUEUE_DLQ_URL"),
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
            visibility_timeout_secs: profiled_env_u32(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 600),
            max_batch_size: profiled_env_u32(p, "QUEUE_MAX_BATCH_SIZE", 1),
            idle_backoff_secs: profiled_env_u64(p, "QUEUE_IDLE_BACKOFF_SECS", 60),
            poll_error_backoff_secs: profiled_env_u64(p, "QUEUE_POLL_ERROR_BACKOFF_SECS", 10),
        }
    }

    /// `{project_prefix}{queue_name}`, e.g. `sec_filings_ciks_to_collect`.
    pub fn full_queue_name(&self) -> String {
        format!("{}{}", self.project_prefix, self.queue_name)
    }

    /// Name of the dead-letter queue paired with the main queue.
    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}_DeadLetter", self.full_queue_name())
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_secs(self.idle_backoff_secs)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_error_backoff_secs)
    }
}

// ── Remote document fetch ─────────────────────────────────────

/// Upper bound on the courtesy pause multiplier.
pub const MAX_PAUSE_FACTOR: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub base_url: String,
    /// EDGAR rejects requests without a descriptive User-Agent.
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Retries after the first attempt; at most `max_retry_depth + 1` requests.
    pub max_retry_depth: u32,
    pub retry_backoff_min_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Courtesy pause after a download is `U(min, max) * download time`...
    pub pause_factor_min: f64,
    pub pause_factor_max: f64,
    /// ...but never shorter than this.
    pub pause_floor_ms: u64,
    /// Re-download filings that are already archived.
    pub force_refetch: bool,
}

impl FetchConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_or(p, "FETCH_BASE_URL", "https://www.sec.gov/Archives"),
            user_agent: profiled_env_or(p, "FETCH_USER_AGENT", "filing-vault admin@example.com"),
            request_timeout_secs: profiled_env_u64(p, "FETCH_REQUEST_TIMEOUT_SECS", 120),
            max_retry_depth: profiled_env_u32(p, "FETCH_MAX_RETRY_DEPTH", 3),
            retry_backoff_min_ms: profiled_env_u64(p, "FETCH_RETRY_BACKOFF_MIN_MS", 5_000),
            retry_backoff_max_ms: profiled_env_u64(p, "FETCH_RETRY_BACKOFF_MAX_MS", 10_000),
            pause_factor_min: profiled_env_f64(p, "FETCH_PAUSE_FACTOR_MIN", 2.0),
            pause_factor_max: profiled_env_f64(p, "FETCH_PAUSE_FACTOR_MAX", 5.0),
            pause_floor_ms: profiled_env_u64(p, "FETCH_PAUSE_FLOOR_MS", 750),
            force_refetch: profiled_env_bool(p, "FETCH_FORCE_REFETCH", false),
        }
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.retry_backoff_min_ms > self.retry_backoff_max_ms {
            return Err(VaultError::Config(format!(
                "retry backoff range is empty: {}ms > {}ms",
                self.retry_backoff_min_ms, self.retry_backoff_max_ms
            )));
        }
        let factors_ok = self.pause_factor_min.is_finite()
            && self.pause_factor_max.is_finite()
            && self.pause_factor_min >= 0.0
            && self.pause_factor_min <= self.pause_factor_max
            && self.pause_factor_max <= MAX_PAUSE_FACTOR;
        if !factors_ok {
            return Err(VaultError::Config(format!(
                "invalid pause factor range: {}..={}",
                self.pause_factor_min, self.pause_factor_max
            )));
        }
        if self.base_url.is_empty() {
            return Err(VaultError::Config("FETCH_BASE_URL must not be empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Filings catalog ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Parquet or JSON-lines dataset of (entity id, remote path) rows.
    pub path: PathBuf,
    pub entity_column: String,
    pub path_column: String,
}

impl CatalogConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            path: PathBuf::from(profiled_env_or(p, "CATALOG_PATH", "all_10K_10Q.parquet")),
            entity_column: profiled_env_or(p, "CATALOG_ENTITY_COLUMN", "cik"),
            path_column: profiled_env_or(p, "CATALOG_PATH_COLUMN", "SECFNAME"),
        }
    }
}

// ── Entity lease ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Should exceed the queue visibility timeout.
    pub ttl_secs: u64,
}

impl LeaseConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            ttl_secs: profiled_env_u64(p, "LEASE_TTL_SECS", 900),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::for_profile("VAULT_CONFIG_TEST_UNSET");
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.full_queue_name(), "sec_filings_ciks_to_collect");
        assert_eq!(
            config.queue.dead_letter_queue_name(),
            "sec_filings_ciks_to_collect_DeadLetter"
        );
    }

    #[test]
    fn inverted_backoff_range_is_rejected() {
        let mut config = Config::for_profile("VAULT_CONFIG_TEST_UNSET");
        config.fetch.retry_backoff_min_ms = 10;
        config.fetch.retry_backoff_max_ms = 5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn negative_pause_factor_is_rejected() {
        let mut config = Config::for_profile("VAULT_CONFIG_TEST_UNSET");
        config.fetch.pause_factor_min = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_pause_factor_is_rejected() {
        let mut config = Config::for_profile("VAULT_CONFIG_TEST_UNSET");
        config.fetch.pause_factor_max = 1e300;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn lease_must_outlive_visibility_timeout() {
        let mut config = Config::for_profile("VAULT_CONFIG_TEST_UNSET");
        config.queue.visibility_timeout_secs = 600;
        config.lease.ttl_secs = 600;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));

        config.lease.ttl_secs = 601;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn profile_label_defaults() {
        let config = Config::for_profile("");
        assert_eq!(config.profile_label(), "default");
    }
}
