use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{EngineConfig, RetryPolicy};
use crate::model::BookingPolicy;

/// Process settings read from `EVECS_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
    pub transactions: bool,
    pub repair_interval: Duration,
    pub stale_pending: Duration,
    pub compact_threshold: u64,
    pub retry_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            policy: BookingPolicy::Exclusive,
            transactions: true,
            repair_interval: Duration::from_secs(30),
            stale_pending: Duration::from_secs(60),
            compact_threshold: 1000,
            retry_max_attempts: 8,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_policy(s: &str) -> Option<BookingPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "exclusive" => Some(BookingPolicy::Exclusive),
        "shared" | "shared_by_headcount" => Some(BookingPolicy::SharedByHeadcount),
        _ => None,
    }
}

fn parse_switch(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: lookup("EVECS_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parsed(&lookup, "EVECS_METRICS_PORT"),
            policy: lookup("EVECS_POLICY")
                .and_then(|s| parse_policy(&s))
                .unwrap_or(d.policy),
            transactions: lookup("EVECS_TRANSACTIONS")
                .and_then(|s| parse_switch(&s))
                .unwrap_or(d.transactions),
            repair_interval: parsed(&lookup, "EVECS_REPAIR_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.repair_interval),
            stale_pending: parsed(&lookup, "EVECS_STALE_PENDING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.stale_pending),
            compact_threshold: parsed(&lookup, "EVECS_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            retry_max_attempts: parsed::<u32>(&lookup, "EVECS_RETRY_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(d.retry_max_attempts),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("evecs.wal")
    }

    /// Markers younger than the stale threshold are left to their writer.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: self.policy,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                ..RetryPolicy::default()
            },
            pending_grace: self.stale_pending,
        }
    }
}
