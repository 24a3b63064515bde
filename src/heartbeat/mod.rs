use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::config;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 2_500;
pub const MIN_LIVENESS_MULTIPLIER: u32 = 2;
pub const MAX_LIVENESS_MULTIPLIER: u32 = 10;
pub const DEFAULT_LIVENESS_MULTIPLIER: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub liveness_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            liveness_multiplier: DEFAULT_LIVENESS_MULTIPLIER,
        }
    }
}

impl From<config::HeartbeatConfig> for HeartbeatConfig {
    fn from(value: config::HeartbeatConfig) -> Self {
        Self {
            interval_ms: value.interval_ms,
            liveness_multiplier: value.liveness_multiplier,
        }
    }
}

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    InvalidLivenessMultiplier { provided: u32 },
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::InvalidLivenessMultiplier { provided } => write!(
                f,
                "liveness multiplier must be between {MIN_LIVENESS_MULTIPLIER} and {MAX_LIVENESS_MULTIPLIER}, got {provided}"
            ),
        }
    }
}

impl std::error::Error for HeartbeatError {}

// Deadline bookkeeping for the broker's periodic heartbeat sweep. The
// liveness window is always a whole multiple of the interval, so a worker
// survives multiplier-1 missed beats before it expires.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatSchedule {
    interval: Duration,
    liveness: Duration,
    next_at: DateTime<Utc>,
}

impl HeartbeatSchedule {
    pub fn new(config: HeartbeatConfig, now: DateTime<Utc>) -> Result<Self, HeartbeatError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&config.interval_ms) {
            return Err(HeartbeatError::InvalidInterval {
                provided_ms: config.interval_ms,
            });
        }
        if !(MIN_LIVENESS_MULTIPLIER..=MAX_LIVENESS_MULTIPLIER)
            .contains(&config.liveness_multiplier)
        {
            return Err(HeartbeatError::InvalidLivenessMultiplier {
                provided: config.liveness_multiplier,
            });
        }

        let interval = Duration::milliseconds(config.interval_ms as i64);
        let liveness =
            Duration::milliseconds((config.interval_ms * u64::from(config.liveness_multiplier)) as i64);

        Ok(Self {
            interval,
            liveness,
            next_at: now + interval,
        })
    }

    pub fn from_app_config(
        app_config: &config::AppConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, HeartbeatError> {
        Self::new(HeartbeatConfig::from(app_config.heartbeat), now)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness
    }

    pub fn next_at(&self) -> DateTime<Utc> {
        self.next_at
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_at
    }

    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.next_at = now + self.interval;
    }

    pub fn expiry_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.liveness
    }
}
