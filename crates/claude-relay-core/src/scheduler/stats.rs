//! Aggregate request telemetry.
//!
//! Global counters, per-error-kind totals, a rolling call log, and per-hour
//! buckets. Everything is deep-copied out through [`StatsAggregator::snapshot`]
//! so readers never share backing storage with the live state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::classifier::ErrorKind;
use super::credential::duration_ms;

/// Rolling call-log capacity; the oldest records are trimmed beyond it.
pub const CALL_LOG_CAPACITY: usize = 1000;

/// Hour-bucket key format, UTC.
const HOUR_KEY_FORMAT: &str = "%Y-%m-%d %H:00";

/// One completed upstream call.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub session_key: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

/// Snapshot of the aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponentially decayed mean over successful requests (α = 0.5).
    #[serde(with = "duration_ms")]
    pub average_latency: Duration,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub sessions_active: usize,
    pub sessions_cooling: usize,
    pub sessions_failed: usize,
    pub last_reset: DateTime<Utc>,
    pub call_records: VecDeque<CallRecord>,
    /// Keys `YYYY-MM-DD HH:00` in UTC. Grows for the process lifetime.
    pub call_count_by_hour: HashMap<String, u64>,
}

impl AggregateStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_latency: Duration::ZERO,
            errors_by_kind: HashMap::new(),
            sessions_active: 0,
            sessions_cooling: 0,
            sessions_failed: 0,
            last_reset: now,
            call_records: VecDeque::with_capacity(CALL_LOG_CAPACITY),
            call_count_by_hour: HashMap::new(),
        }
    }
}

/// Mutex-guarded aggregate counters; critical sections stay short.
pub(crate) struct StatsAggregator {
    inner: Mutex<AggregateStats>,
}

impl StatsAggregator {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { inner: Mutex::new(AggregateStats::new(now)) }
    }

    pub fn record(
        &self,
        session_key: &str,
        success: bool,
        latency: Duration,
        kind: Option<ErrorKind>,
        now: DateTime<Utc>,
    ) {
        let mut stats = self.inner.lock();
        stats.total_requests += 1;

        if success {
            stats.successful_requests += 1;
            stats.average_latency = if stats.average_latency.is_zero() {
                latency
            } else {
                (stats.average_latency + latency) / 2
            };
        } else {
            stats.failed_requests += 1;
            let kind = kind.unwrap_or(ErrorKind::Other);
            *stats.errors_by_kind.entry(kind).or_insert(0) += 1;
        }

        stats.call_records.push_back(CallRecord {
            session_key: session_key.to_string(),
            timestamp: now,
            success,
            latency,
        });
        while stats.call_records.len() > CALL_LOG_CAPACITY {
            stats.call_records.pop_front();
        }

        let hour_key = now.format(HOUR_KEY_FORMAT).to_string();
        *stats.call_count_by_hour.entry(hour_key).or_insert(0) += 1;
    }

    /// Per-status credential tallies, recomputed by the scheduler on every
    /// recorded result.
    pub fn set_session_tallies(&self, active: usize, cooling: usize, failed: usize) {
        let mut stats = self.inner.lock();
        stats.sessions_active = active;
        stats.sessions_cooling = cooling;
        stats.sessions_failed = failed;
    }

    pub fn snapshot(&self) -> AggregateStats {
        self.inner.lock().clone()
    }
}
