//! Daemon configuration loaded from environment variables.
//!
//! Every setting has a default so the daemon starts with zero configuration
//! for local development.

use std::path::PathBuf;
use std::time::Duration;

use hearth_core::dispatcher::DispatcherConfig;
use hearth_core::keys::KeyManagerConfig;
use hearth_core::pipeline::MessageServiceConfig;
use hearth_shared::constants::{
    DEFAULT_CLAIM_TIMEOUT_SECS, DEFAULT_DISPATCH_BATCH_SIZE, DEFAULT_EXPIRY_GRACE_SECS,
    DEFAULT_FANOUT_BUFFER, DEFAULT_KEY_HISTORY_DEPTH, DEFAULT_MAX_RETRIES,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RETENTION_DAYS, DEFAULT_RETRY_DELAY_SECS,
    DEFAULT_SWEEP_INTERVAL_SECS, MAX_CONTENT_CHARS,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite database file.
    /// Env: `HEARTH_DB_PATH`
    /// Default: `hearth.db` in the platform data directory.
    pub db_path: Option<PathBuf>,

    /// How often the dispatcher polls for due messages.
    /// Env: `POLL_INTERVAL_SECS`
    /// Default: `30`
    pub poll_interval: Duration,

    /// How often expiry, stale-claim and retention sweeps run.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `300`
    pub sweep_interval: Duration,

    /// Env: `DISPATCH_BATCH_SIZE`
    pub batch_size: u32,

    /// Env: `RETRY_DELAY_SECS`
    pub retry_delay_secs: i64,

    /// Env: `EXPIRY_GRACE_SECS`
    pub expiry_grace_secs: i64,

    /// Env: `CLAIM_TIMEOUT_SECS`
    pub claim_timeout_secs: i64,

    /// Retry budget for scheduled messages that do not set one.
    /// Env: `DEFAULT_MAX_RETRIES`
    pub default_max_retries: u32,

    /// Room key versions kept decryptable, current included.
    /// Env: `KEY_HISTORY_DEPTH`
    pub key_history_depth: usize,

    /// Per-subscriber queue length in the room fan-out.
    /// Env: `FANOUT_BUFFER`
    pub fanout_buffer: usize,

    /// Days a destroyed message or terminal scheduled record is kept.
    /// Env: `RETENTION_DAYS`
    pub retention_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            expiry_grace_secs: DEFAULT_EXPIRY_GRACE_SECS,
            claim_timeout_secs: DEFAULT_CLAIM_TIMEOUT_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            key_history_depth: DEFAULT_KEY_HISTORY_DEPTH,
            fanout_buffer: DEFAULT_FANOUT_BUFFER,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("HEARTH_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(secs) = parse_positive::<u64>(&lookup, "POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive::<u64>(&lookup, "SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive(&lookup, "DISPATCH_BATCH_SIZE") {
            config.batch_size = n;
        }
        if let Some(secs) = parse_window(&lookup, "RETRY_DELAY_SECS", 1) {
            config.retry_delay_secs = secs;
        }
        if let Some(secs) = parse_window(&lookup, "EXPIRY_GRACE_SECS", 1) {
            config.expiry_grace_secs = secs;
        }
        if let Some(secs) = parse_window(&lookup, "CLAIM_TIMEOUT_SECS", 1) {
            config.claim_timeout_secs = secs;
        }
        if let Some(n) = parse_positive(&lookup, "DEFAULT_MAX_RETRIES") {
            config.default_max_retries = n;
        }
        if let Some(n) = parse_positive(&lookup, "KEY_HISTORY_DEPTH") {
            config.key_history_depth = n;
        }
        if let Some(n) = parse_positive(&lookup, "FANOUT_BUFFER") {
            config.fanout_buffer = n;
        }
        if let Some(days) = parse_window(&lookup, "RETENTION_DAYS", SECS_PER_DAY) {
            config.retention_days = days;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.batch_size,
            retry_delay: seconds_or(self.retry_delay_secs, DEFAULT_RETRY_DELAY_SECS),
            expiry_grace: seconds_or(self.expiry_grace_secs, DEFAULT_EXPIRY_GRACE_SECS),
            claim_timeout: seconds_or(self.claim_timeout_secs, DEFAULT_CLAIM_TIMEOUT_SECS),
            retention: self.retention(),
        }
    }

    pub fn message_service(&self) -> MessageServiceConfig {
        MessageServiceConfig {
            default_max_retries: self.default_max_retries,
            max_content_chars: MAX_CONTENT_CHARS,
        }
    }

    pub fn key_manager(&self) -> KeyManagerConfig {
        KeyManagerConfig {
            history_depth: self.key_history_depth,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.retention_days)
            .unwrap_or_else(|| chrono::Duration::days(DEFAULT_RETENTION_DAYS))
    }
}

const SECS_PER_DAY: i64 = 24 * 60 * 60;

fn seconds_or(secs: i64, default: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::seconds(default))
}

/// Parse a positive look-back window counted in `unit_secs` steps. The
/// window must be representable and must fit behind the current time.
fn parse_window(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    unit_secs: i64,
) -> Option<i64> {
    let n: i64 = parse_positive(lookup, name)?;
    let fits = n
        .checked_mul(unit_secs)
        .and_then(chrono::Duration::try_seconds)
        .is_some_and(|window| {
            let now = chrono::Utc::now();
            now.checked_sub_signed(window).is_some() && now.checked_add_signed(window).is_some()
        });
    if !fits {
        warn_invalid(name, &n.to_string());
        return None;
    }
    Some(n)
}

/// Parse a strictly positive number, warning about (and ignoring) anything else.
fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let val = lookup(name)?;
    match val.trim().parse::<T>() {
        Ok(n) if n > T::default() => Some(n),
        _ => {
            warn_invalid(name, &val);
            None
        }
    }
}

fn warn_invalid(name: &str, value: &str) {
    tracing::warn!(value = %value, "Invalid {name}, using default");
}
