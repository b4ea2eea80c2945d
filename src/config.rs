//! Runtime configuration, read from the environment after dotenv loading.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::shadow_ledger::ExposureLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,
    /// Policy decision service endpoint. Unset means every decision fails closed.
    pub policy_url: Option<String>,
    pub policy_timeout: Duration,
    /// Per-delivery bound for the emit sink.
    pub emit_timeout: Duration,
    pub emit_queue_capacity: usize,
    pub pending_lease: Duration,
    pub duplicate_wait: Duration,
    pub db_busy_timeout: Duration,
    pub default_limits: ExposureLimits,
    pub redelivery_poll: Duration,
    pub redelivery_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./brokerops_ledger.db".to_string(),
            bind_addr: "0.0.0.0:7005".to_string(),
            policy_url: None,
            policy_timeout: Duration::from_millis(2_000),
            emit_timeout: Duration::from_secs(10),
            emit_queue_capacity: 1_024,
            pending_lease: Duration::from_secs(30),
            duplicate_wait: Duration::from_millis(2_000),
            db_busy_timeout: Duration::from_millis(5_000),
            default_limits: ExposureLimits {
                max_gross_exposure: Decimal::from(1_000_000),
                max_net_exposure: Decimal::from(500_000),
            },
            redelivery_poll: Duration::from_secs(60),
            redelivery_max_attempts: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = env::var("LEDGER_DB_PATH")
            .or_else(|_| env::var("DATABASE_PATH"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.database_path);

        let bind_addr = env::var("BIND_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.bind_addr);

        let policy_url = env::var("POLICY_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            database_path,
            bind_addr,
            policy_url,
            policy_timeout: env_millis("POLICY_TIMEOUT_MS").unwrap_or(defaults.policy_timeout),
            emit_timeout: env_secs("EMIT_TIMEOUT_SECS").unwrap_or(defaults.emit_timeout),
            emit_queue_capacity: env_parse::<usize>("EMIT_QUEUE_CAPACITY")
                .filter(|&v| v > 0)
                .unwrap_or(defaults.emit_queue_capacity),
            pending_lease: env_secs("PENDING_LEASE_SECS").unwrap_or(defaults.pending_lease),
            duplicate_wait: env_millis("DUPLICATE_WAIT_MS").unwrap_or(defaults.duplicate_wait),
            db_busy_timeout: env_millis("DB_BUSY_TIMEOUT_MS").unwrap_or(defaults.db_busy_timeout),
            default_limits: ExposureLimits {
                max_gross_exposure: env_parse::<Decimal>("DEFAULT_MAX_GROSS_EXPOSURE")
                    .filter(|v| v.is_sign_positive())
                    .unwrap_or(defaults.default_limits.max_gross_exposure),
                max_net_exposure: env_parse::<Decimal>("DEFAULT_MAX_NET_EXPOSURE")
                    .filter(|v| v.is_sign_positive())
                    .unwrap_or(defaults.default_limits.max_net_exposure),
            },
            redelivery_poll: env_secs("REDELIVERY_POLL_SECS").unwrap_or(defaults.redelivery_poll),
            redelivery_max_attempts: env_parse::<u32>("REDELIVERY_MAX_ATTEMPTS")
                .filter(|&v| v > 0)
                .unwrap_or(defaults.redelivery_max_attempts),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|&v| v > 0)
        .map(Duration::from_millis)
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|&v| v > 0)
        .map(Duration::from_secs)
}
