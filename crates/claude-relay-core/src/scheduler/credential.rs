//! Per-credential health tracking.
//!
//! Every pooled session key gets one [`SessionHealth`] row holding its
//! counters, recent-error ring, cooldown deadline, optional circuit breaker,
//! and the derived health score used by the selection strategies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::breaker::CircuitBreaker;
use super::classifier::ErrorKind;

/// Capacity of the recent-error ring; the oldest entry is evicted beyond it.
pub const RECENT_ERRORS_CAP: usize = 10;

/// A pooled credential: opaque session key plus an optional organization id
/// that may be backfilled on first successful use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "orgID", default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl SessionInfo {
    pub fn new(session_key: impl Into<String>, org_id: Option<String>) -> Self {
        Self { session_key: session_key.into(), org_id: org_id.filter(|o| !o.is_empty()) }
    }
}

/// Lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Eligible for selection.
    Active,
    /// Sidelined until `cooldown_until` passes.
    Cooling,
    /// Administratively dead.
    Failed,
    /// Circuit breaker is open; dominates a concurrent cooldown.
    CircuitOpen,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Cooling => write!(f, "cooling"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// One entry of the recent-error ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Health state of one pooled credential.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub session_key: String,
    pub org_id: Option<String>,
    pub status: SessionStatus,
    /// Derived score in `[0, 1]`; recomputed on every recorded result.
    pub health_score: f64,
    /// Operator-assigned weight for the weighted strategy.
    pub weight: f64,
    pub last_used: DateTime<Utc>,
    pub last_error: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub total_requests: u64,
    /// Exponentially decayed mean (`avg = (avg + sample) / 2`), not a true
    /// running mean: recent samples carry half the weight.
    #[serde(with = "duration_ms")]
    pub avg_response_time: Duration,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub recent_errors: VecDeque<ErrorRecord>,
    #[serde(rename = "circuit_breaker", skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreaker>,
}

impl SessionHealth {
    pub(crate) fn new(info: SessionInfo, breaker_enabled: bool) -> Self {
        Self {
            session_key: info.session_key,
            org_id: info.org_id,
            status: SessionStatus::Active,
            health_score: 1.0,
            weight: 1.0,
            last_used: Utc::now(),
            last_error: None,
            cooldown_until: None,
            success_count: 0,
            error_count: 0,
            total_requests: 0,
            avg_response_time: Duration::ZERO,
            errors_by_kind: HashMap::new(),
            recent_errors: VecDeque::with_capacity(RECENT_ERRORS_CAP),
            breaker: breaker_enabled.then(CircuitBreaker::default),
        }
    }

    /// Restores the row to its initial state, keeping identity and weight.
    pub(crate) fn reset(&mut self, breaker_enabled: bool) {
        let info = SessionInfo::new(self.session_key.clone(), self.org_id.clone());
        let weight = self.weight;
        *self = SessionHealth::new(info, breaker_enabled);
        self.weight = weight;
    }

    pub(crate) fn record_success(&mut self, latency: Duration, now: DateTime<Utc>) {
        self.success_count += 1;
        self.total_requests += 1;

        self.avg_response_time = if self.avg_response_time.is_zero() {
            latency
        } else {
            (self.avg_response_time + latency) / 2
        };

        if let Some(breaker) = self.breaker.as_mut() {
            if breaker.record_success() && self.status == SessionStatus::CircuitOpen {
                self.status = SessionStatus::Active;
            }
        }

        self.recompute_score(now);
    }

    pub(crate) fn record_error(
        &mut self,
        kind: ErrorKind,
        message: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) {
        self.error_count += 1;
        self.total_requests += 1;
        self.last_error = Some(now);
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;

        self.recent_errors.push_back(ErrorRecord {
            timestamp: now,
            kind,
            message: message.to_string(),
        });
        if self.recent_errors.len() > RECENT_ERRORS_CAP {
            self.recent_errors.pop_front();
        }

        self.cooldown_until =
            Some(now + ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::seconds(60)));
        self.status = SessionStatus::Cooling;

        if let Some(breaker) = self.breaker.as_mut() {
            if breaker.record_failure(now) {
                self.status = SessionStatus::CircuitOpen;
            }
        }

        self.recompute_score(now);
    }

    /// Recomputes the health score:
    ///
    /// ```text
    /// (success_rate − error_penalty − latency_penalty) × time_decay × status_mult
    /// ```
    ///
    /// clamped to `[0, 1]`. Untouched credentials score 1.0.
    pub(crate) fn recompute_score(&mut self, now: DateTime<Utc>) {
        if self.total_requests == 0 {
            self.health_score = 1.0;
            return;
        }

        let total = self.total_requests as f64;
        let success_rate = self.success_count as f64 / total;
        let error_penalty = (self.error_count as f64 / total) * 0.5;

        let secs = self.avg_response_time.as_secs_f64();
        let latency_penalty = if secs <= 1.0 {
            0.0
        } else if secs <= 2.0 {
            0.1
        } else if secs <= 5.0 {
            0.2
        } else {
            0.3
        };

        let time_decay = match self.last_error {
            None => 1.0,
            Some(last) => {
                let hours = (now - last).num_seconds().max(0) as f64 / 3600.0;
                (hours / 24.0).min(1.0)
            },
        };

        let status_mult = match self.status {
            SessionStatus::Active => 1.0,
            SessionStatus::Cooling => 0.1,
            SessionStatus::Failed | SessionStatus::CircuitOpen => 0.0,
        };

        let base = success_rate - error_penalty - latency_penalty;
        self.health_score = (base * time_decay * status_mult).clamp(0.0, 1.0);
    }

    pub(crate) fn cooldown_expired(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_none_or(|t| now >= t)
    }

    /// Selection pre-filter: active, above the strategy's score floor, and
    /// out of cooldown.
    pub(crate) fn is_eligible(&self, floor: f64, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active
            && self.health_score > floor
            && self.cooldown_expired(now)
    }
}

/// Log-safe rendering of a session key.
pub(crate) fn mask_key(key: &str) -> String {
    crate::modules::logger::mask_secret(key)
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serialize a `Duration` as integer seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
