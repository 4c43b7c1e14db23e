use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
}

/// Tuning knobs for the job-coordination layer.
///
/// All intervals come from `*_MINUTES` environment variables; the defaults
/// match production behavior and tests override them with millisecond
/// values directly.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long an acquired lease stays valid without renewal.
    pub lease_ttl: Duration,
    /// How often the background sweep deletes expired leases.
    pub lock_cleanup_interval: Duration,
    /// How long a crawl may go without a heartbeat before it is stalled.
    pub stall_timeout: Duration,
    /// How often the stall sweep checks for silent crawls.
    pub stall_sweep_interval: Duration,
    /// Hard cap on a single task execution.
    pub execution_timeout: Duration,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Failures before a task is disabled and requires a manual restart.
    pub max_retries: u32,
    /// Upper bound on waiting for in-flight executions during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30 * 60),
            lock_cleanup_interval: Duration::from_secs(5 * 60),
            stall_timeout: Duration::from_secs(15 * 60),
            stall_sweep_interval: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(30 * 60),
            retry_base_delay: Duration::from_secs(5 * 60),
            max_retries: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            scheduler: SchedulerConfig::from_env()?,
        })
    }
}

impl SchedulerConfig {
    /// Load scheduler knobs from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            lease_ttl: env_minutes("CRON_LEASE_TTL_MINUTES", defaults.lease_ttl)?,
            lock_cleanup_interval: env_minutes(
                "CRON_LOCK_CLEANUP_MINUTES",
                defaults.lock_cleanup_interval,
            )?,
            stall_timeout: env_minutes("CRAWL_STALL_TIMEOUT_MINUTES", defaults.stall_timeout)?,
            stall_sweep_interval: defaults.stall_sweep_interval,
            execution_timeout: env_minutes(
                "CRON_EXECUTION_TIMEOUT_MINUTES",
                defaults.execution_timeout,
            )?,
            retry_base_delay: env_minutes(
                "CRON_RETRY_BASE_DELAY_MINUTES",
                defaults.retry_base_delay,
            )?,
            max_retries: match env::var("CRON_MAX_RETRIES") {
                Ok(value) => value.parse().context("CRON_MAX_RETRIES must be a number")?,
                Err(_) => defaults.max_retries,
            },
            shutdown_timeout: defaults.shutdown_timeout,
        })
    }
}

fn env_minutes(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(value) => {
            let minutes: u64 = value
                .parse()
                .with_context(|| format!("{} must be a number of minutes", name))?;
            Ok(Duration::from_secs(minutes * 60))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(1800));
        assert_eq!(config.lock_cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.stall_timeout, Duration::from_secs(900));
        assert_eq!(config.execution_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry_base_delay, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
    }
}
