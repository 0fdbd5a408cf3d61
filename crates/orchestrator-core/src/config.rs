//! Environment-driven configuration (§6, §1c). `Config::from_env` is the single
//! entry point binaries call; tests construct `Config` directly via `Default`
//! without touching the environment.

/// The §6 configuration table, plus the store connection string.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_concurrency: usize,
    pub worker_poll_interval_ms: u64,
    pub retry_default_max_attempts: u32,
    pub retry_default_base_delay_ms: u64,
    pub retry_default_max_delay_ms: u64,
    pub step_default_timeout_ms: u64,
    pub claim_stale_lock_threshold_min: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            worker_concurrency: 3,
            worker_poll_interval_ms: 1000,
            retry_default_max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            retry_default_base_delay_ms: crate::retry::DEFAULT_BASE_DELAY_MS,
            retry_default_max_delay_ms: crate::retry::DEFAULT_MAX_DELAY_MS,
            step_default_timeout_ms: crate::interpreter::DEFAULT_STEP_TIMEOUT_MS,
            claim_stale_lock_threshold_min: 30,
        }
    }
}

impl Config {
    /// Reads the §6 table from the environment, falling back to the documented
    /// defaults for everything except `DATABASE_URL`, which is required —
    /// mirroring the teacher worker binary's `.expect()` on that variable.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required"),
            worker_concurrency: env_or("WORKER_CONCURRENCY", defaults.worker_concurrency),
            worker_poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", defaults.worker_poll_interval_ms),
            retry_default_max_attempts: env_or("RETRY_DEFAULT_MAX_ATTEMPTS", defaults.retry_default_max_attempts),
            retry_default_base_delay_ms: env_or("RETRY_DEFAULT_BASE_DELAY_MS", defaults.retry_default_base_delay_ms),
            retry_default_max_delay_ms: env_or("RETRY_DEFAULT_MAX_DELAY_MS", defaults.retry_default_max_delay_ms),
            step_default_timeout_ms: env_or("STEP_DEFAULT_TIMEOUT_MS", defaults.step_default_timeout_ms),
            claim_stale_lock_threshold_min: env_or(
                "CLAIM_STALE_LOCK_THRESHOLD_MIN",
                defaults.claim_stale_lock_threshold_min,
            ),
        }
    }

    pub fn default_retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.retry_default_max_attempts,
            base_delay_ms: self.retry_default_base_delay_ms,
            backoff_multiplier: crate::retry::DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: self.retry_default_max_delay_ms,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
