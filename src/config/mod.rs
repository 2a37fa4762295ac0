use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};

use crate::domain::MAX_POLL_INTERVAL_SECS;
use crate::errors::{FeederError, FeederResult};

const HOUR_SECS: u64 = 3600;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// Daily UTC window during which sources are not polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub duration: Duration,
}

impl QuietWindow {
    /// Parse `HH:MM+H`, e.g. `22:00+3` for 22:00 to 01:00 UTC
    pub fn parse(value: &str) -> FeederResult<Self> {
        let invalid = || FeederError::Config(format!("Invalid quiet window: {}", value));

        let (start, hours) = value.trim().split_once('+').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let hours: u64 = hours.trim().parse().map_err(|_| invalid())?;
        if hours == 0 || hours >= 24 {
            return Err(invalid());
        }

        Ok(Self {
            start,
            duration: Duration::from_secs(hours * 3600),
        })
    }

    /// Whether `time` falls inside the window, including windows crossing midnight
    pub fn contains(&self, time: NaiveTime) -> bool {
        let day = 24 * 3600;
        let start = self.start.num_seconds_from_midnight() as u64;
        let end = (start + self.duration.as_secs()) % day;
        let now = time.num_seconds_from_midnight() as u64;

        if start < end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub channels_url: Option<String>,
    pub channels_token: Option<String>,
    pub sinks: Vec<String>,
    pub poll_interval: Duration,
    pub max_jitter: Duration,
    pub poll_workers: usize,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub failure_threshold: u32,
    pub dedup_ttl: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub delivery_max_attempts: u32,
    pub max_entries_per_poll: usize,
    pub queue_capacity: usize,
    pub store_timeout: Duration,
    pub shutdown_grace: Duration,
    pub quiet_window: Option<QuietWindow>,
}

impl Config {
    /// Get the directory where the executable is located
    fn exe_dir() -> Option<std::path::PathBuf> {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    pub fn from_env() -> FeederResult<Self> {
        let exe_dir = Self::exe_dir();

        // Try to load .env from executable's directory first
        if let Some(ref dir) = exe_dir {
            let env_path = dir.join(".env");
            if env_path.exists() {
                dotenvy::from_path(&env_path).ok();
            }
        }
        // Fall back to current directory
        dotenvy::dotenv().ok();

        // Default db_path is relative to executable directory
        let default_db = exe_dir
            .map(|d| d.join("feeder.db").to_string_lossy().into_owned())
            .unwrap_or_else(|| "./feeder.db".to_string());

        Self::from_lookup(|key| std::env::var(key).ok(), default_db)
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F, default_db: String) -> FeederResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let sinks: Vec<String> = get("FEEDER_SINKS")
            .unwrap_or_else(|| "feeds".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if sinks.is_empty() {
            return Err(FeederError::Config("FEEDER_SINKS names no sinks".to_string()));
        }

        let quiet_window = get("FEEDER_QUIET_WINDOW")
            .map(|v| QuietWindow::parse(&v))
            .transpose()?;

        let config = Self {
            db_path: get("FEEDER_DB_PATH").unwrap_or(default_db),
            channels_url: get("CHANNELS_URL"),
            channels_token: get("CHANNELS_TOKEN"),
            sinks,
            poll_interval: secs(&get, "FEEDER_POLL_INTERVAL_SECS", 300)?,
            max_jitter: secs(&get, "FEEDER_MAX_JITTER_SECS", 30)?,
            poll_workers: number(&get, "FEEDER_POLL_WORKERS", 4)?,
            fetch_timeout: secs(&get, "FEEDER_FETCH_TIMEOUT_SECS", 10)?,
            fetch_retries: number(&get, "FEEDER_FETCH_RETRIES", 3)?,
            failure_threshold: number(&get, "FEEDER_FAILURE_THRESHOLD", 5)?,
            dedup_ttl: secs(&get, "FEEDER_DEDUP_TTL_SECS", 7 * 24 * 3600)?,
            rate_limit_requests: number(&get, "FEEDER_RATE_LIMIT_REQUESTS", 5)?,
            rate_limit_window: secs(&get, "FEEDER_RATE_LIMIT_WINDOW_SECS", 5)?,
            delivery_max_attempts: number(&get, "FEEDER_DELIVERY_MAX_ATTEMPTS", 5)?,
            max_entries_per_poll: number(&get, "FEEDER_MAX_ENTRIES_PER_POLL", 100)?,
            queue_capacity: number(&get, "FEEDER_QUEUE_CAPACITY", 256)?,
            store_timeout: secs(&get, "FEEDER_STORE_TIMEOUT_SECS", 5)?,
            shutdown_grace: secs(&get, "FEEDER_SHUTDOWN_GRACE_SECS", 10)?,
            quiet_window,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> FeederResult<()> {
        let positive = [
            ("FEEDER_POLL_WORKERS", self.poll_workers as u64),
            ("FEEDER_FAILURE_THRESHOLD", self.failure_threshold as u64),
            ("FEEDER_RATE_LIMIT_REQUESTS", self.rate_limit_requests as u64),
            ("FEEDER_DELIVERY_MAX_ATTEMPTS", self.delivery_max_attempts as u64),
            ("FEEDER_QUEUE_CAPACITY", self.queue_capacity as u64),
            ("FEEDER_POLL_INTERVAL_SECS", self.poll_interval.as_secs()),
            ("FEEDER_FETCH_TIMEOUT_SECS", self.fetch_timeout.as_secs()),
            ("FEEDER_RATE_LIMIT_WINDOW_SECS", self.rate_limit_window.as_secs()),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(FeederError::Config(format!("{} must be greater than zero", key)));
            }
        }

        // Durations end up added to instants; keep them far from overflow
        let bounded = [
            ("FEEDER_POLL_INTERVAL_SECS", self.poll_interval, MAX_POLL_INTERVAL_SECS),
            ("FEEDER_MAX_JITTER_SECS", self.max_jitter, DAY_SECS),
            ("FEEDER_FETCH_TIMEOUT_SECS", self.fetch_timeout, HOUR_SECS),
            ("FEEDER_DEDUP_TTL_SECS", self.dedup_ttl, 365 * DAY_SECS),
            ("FEEDER_RATE_LIMIT_WINDOW_SECS", self.rate_limit_window, DAY_SECS),
            ("FEEDER_STORE_TIMEOUT_SECS", self.store_timeout, HOUR_SECS),
            ("FEEDER_SHUTDOWN_GRACE_SECS", self.shutdown_grace, HOUR_SECS),
        ];
        for (key, value, max) in bounded {
            if value.as_secs() > max {
                return Err(FeederError::Config(format!(
                    "{} must be at most {}, got {}",
                    key,
                    max,
                    value.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Credentials for the channel service, required only when delivering
    pub fn channel_credentials(&self) -> FeederResult<(&str, &str)> {
        let url = self
            .channels_url
            .as_deref()
            .ok_or_else(|| FeederError::MissingEnvVar("CHANNELS_URL".to_string()))?;
        let token = self
            .channels_token
            .as_deref()
            .ok_or_else(|| FeederError::MissingEnvVar("CHANNELS_TOKEN".to_string()))?;
        Ok((url, token))
    }
}

fn number<T, G>(get: &G, key: &str, default: T) -> FeederResult<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| FeederError::Config(format!("{} must be a number, got {:?}", key, value))),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: u64) -> FeederResult<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    number(get, key, default).map(Duration::from_secs)
}
