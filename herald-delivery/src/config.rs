//! Dispatcher configuration
//!
//! Loaded from a RON file; every field has a default so an empty `()` is a
//! valid configuration:
//!
//! ```ron
//! (
//!     max_concurrent_deliveries: 8,
//!     backoff: (base_delay_ms: 1000, max_delay_ms: 60000),
//!     retry: (max_attempts: 5),
//!     rate_limit: (messages_per_second: 10.0, burst_size: 20),
//!     shutdown_timeout_secs: 30,
//! )
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::{
    backoff::{BackoffConfig, ExponentialBackoff},
    dispatcher::Dispatcher,
    error::SystemError,
    handlers::Handlers,
    rate_limiter::{RateLimitConfig, RateLimiter},
    retry::{RetryBudget, RetryPolicy},
    throttle::GlobalBackoffThrottle,
    transport::Transport,
};

const CONFIG_ENV: &str = "HERALD_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Transport calls allowed to run at once.
    ///
    /// Default: number of CPUs
    #[serde(default = "defaults::max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Per-message backoff used by the global throttle
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Retry budget for failures and retried responses
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-collapse-key rate limiting, disabled when absent
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// How long [`Dispatcher::drain`] waits on shutdown.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: defaults::max_concurrent_deliveries(),
            backoff: BackoffConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: None,
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
        }
    }
}

mod defaults {
    pub fn max_concurrent_deliveries() -> usize {
        num_cpus::get()
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

impl DispatcherConfig {
    /// Parse a configuration from RON.
    ///
    /// `rate_limit` may be written without `Some(..)`.
    ///
    /// # Errors
    ///
    /// If `content` is not valid RON for this structure, or the values fail
    /// [`validate`](Self::validate).
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        let config: Self = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// If the file can not be read, or [`from_ron`](Self::from_ron) fails.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Self::from_ron(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }

    /// Check values serde can not check on its own.
    ///
    /// # Errors
    ///
    /// [`SystemError::Configuration`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), SystemError> {
        let invalid = |reason: String| Err(SystemError::Configuration(reason));

        if self.max_concurrent_deliveries == 0 {
            return invalid("max_concurrent_deliveries must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return invalid(format!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            ));
        }
        if self.retry.base_retry_delay_ms > self.retry.max_retry_delay_ms {
            return invalid(format!(
                "retry.base_retry_delay_ms ({}) exceeds retry.max_retry_delay_ms ({})",
                self.retry.base_retry_delay_ms, self.retry.max_retry_delay_ms
            ));
        }
        for (name, factor) in [
            ("backoff.jitter_factor", self.backoff.jitter_factor),
            ("retry.retry_jitter_factor", self.retry.retry_jitter_factor),
        ] {
            if !(0.0..=1.0).contains(&factor) {
                return invalid(format!("{name} must be between 0 and 1, got {factor}"));
            }
        }
        if let Some(rate_limit) = &self.rate_limit
            && (rate_limit.messages_per_second <= 0.0 || rate_limit.burst_size == 0)
        {
            return invalid(
                "rate_limit needs a positive messages_per_second and burst_size".to_string(),
            );
        }

        Ok(())
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Assemble a dispatcher with the standard chain: the global backoff
    /// throttle, then the rate limiter (if configured), then the retry budget.
    pub fn build(&self, transport: Arc<dyn Transport>, runtime: Handle) -> Dispatcher {
        let handlers = Arc::new(Handlers::new());

        let backoff = Arc::new(ExponentialBackoff::new(self.backoff.clone()));
        Arc::new(GlobalBackoffThrottle::new(backoff)).register(&handlers);

        if let Some(rate_limit) = &self.rate_limit {
            handlers.append_dequeue_filter(Arc::new(RateLimiter::new(rate_limit.clone())));
        }

        Arc::new(RetryBudget::new(self.retry.clone())).register(&handlers);

        Dispatcher::new(transport, handlers, runtime, self.max_concurrent_deliveries)
    }
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
///
/// If `HERALD_CONFIG` names a missing file, or none of the defaults exist.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    resolve_config_file(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &[
            PathBuf::from("./herald.config.ron"),
            PathBuf::from("/etc/herald/herald.config.ron"),
        ],
    )
}

fn resolve_config_file(
    explicit: Option<PathBuf>,
    default_paths: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
