use std::env;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::BoxError;

pub const DEFAULT_SCAN_CRON: &str = "0 0 9 * * *";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret guarding the cron trigger endpoint.
    pub cron_secret: String,
    pub crm_db_path: PathBuf,
    pub queue_db_path: PathBuf,
    pub follow_up_threshold_days: i64,
    /// 6-field cron expression for the scan-and-enqueue cycle.
    pub scan_cron: String,
    pub scheduler_poll_interval: Duration,
    pub drain_poll_interval: Duration,
    /// Cadence for reply-detection polling over open threads.
    pub reply_poll_interval: Duration,
    /// Jobs executed per drain pass; bounds backlog work per cycle.
    pub drain_batch_limit: usize,
    /// Emails examined per scan pass.
    pub scan_batch_limit: usize,
    pub queue_lease_secs: i64,
    pub queue_max_attempts: i64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("FOLLOWUP_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("FOLLOWUP_SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9010);

        let cron_secret = env::var("CRON_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or("CRON_SECRET must be set")?;

        let crm_db_path = resolve_path(
            env::var("CRM_DB_PATH").unwrap_or_else(|_| "state/crm.db".to_string()),
        )?;
        let queue_db_path = resolve_path(
            env::var("QUEUE_DB_PATH").unwrap_or_else(|_| "state/queue.db".to_string()),
        )?;

        let follow_up_threshold_days = env::var("FOLLOW_UP_THRESHOLD_DAYS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(crate::engine::rules::DEFAULT_THRESHOLD_DAYS);

        let scan_cron = env::var("FOLLOW_UP_SCAN_CRON")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SCAN_CRON.to_string());
        validate_cron_expression(&scan_cron)?;

        let scheduler_poll_interval = duration_env("SCHEDULER_POLL_INTERVAL_SECS", 30);
        let drain_poll_interval = duration_env("DRAIN_POLL_INTERVAL_SECS", 60);
        let reply_poll_interval = duration_env("REPLY_POLL_INTERVAL_SECS", 3600);

        let drain_batch_limit = env::var("DRAIN_BATCH_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(20);
        let scan_batch_limit = env::var("SCAN_BATCH_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(200);

        let queue_lease_secs = env::var("QUEUE_LEASE_SECS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(60);
        let queue_max_attempts = env::var("QUEUE_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(5);

        Ok(Self {
            host,
            port,
            cron_secret,
            crm_db_path,
            queue_db_path,
            follow_up_threshold_days,
            scan_cron,
            scheduler_poll_interval,
            drain_poll_interval,
            reply_poll_interval,
            drain_batch_limit,
            scan_batch_limit,
            queue_lease_secs,
            queue_max_attempts,
        })
    }
}

pub(super) fn validate_cron_expression(expression: &str) -> Result<(), BoxError> {
    let fields = expression.split_whitespace().count();
    if fields != 6 {
        return Err(format!("invalid cron expression (expected 6 fields, got {fields})").into());
    }
    cron::Schedule::from_str(expression)?;
    Ok(())
}

fn duration_env(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}
