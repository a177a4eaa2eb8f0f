//! Intelligent session scheduling.
//!
//! The scheduler owns the credential pool and wires together the selection
//! strategies, per-credential circuit breakers, cooldown handling, and the
//! aggregate stats feeding the admin and WebSocket surfaces. Requests are
//! driven through it by [`RequestDriver`], which retries across credentials
//! until the budget is exhausted.

mod breaker;
mod classifier;
mod credential;
mod driver;
mod stats;
mod strategy;

#[cfg(test)]
mod tests;

pub use breaker::{CircuitBreaker, CircuitState, DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT};
pub use classifier::{
    backoff_delay, base_backoff, classify, is_recoverable, should_stop_retry, ErrorKind,
    MAX_BACKOFF,
};
pub use credential::{ErrorRecord, SessionHealth, SessionInfo, SessionStatus, RECENT_ERRORS_CAP};
pub use driver::{DriveError, DriveReport, ExecutionOutcome, RequestDriver, UpstreamExecutor};
pub use stats::{AggregateStats, CallRecord, CALL_LOG_CAPACITY};
pub use strategy::StrategyKind;

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use credential::mask_key;
use strategy::{Candidate, Strategy};

/// Scheduler construction parameters. Unset fields fall back to defaults in
/// [`SchedulerConfig::default`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub strategy: StrategyKind,
    pub health_check_interval: Duration,
    pub min_health_score: f64,
    pub circuit_breaker_enabled: bool,
    pub max_retry_attempts: u32,
    pub cooldown_periods: HashMap<ErrorKind, Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: StrategyKind::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            min_health_score: 0.5,
            circuit_breaker_enabled: true,
            max_retry_attempts: 3,
            cooldown_periods: default_cooldown_periods(),
        }
    }
}

/// Cooldown applied to a credential after each error kind.
pub fn default_cooldown_periods() -> HashMap<ErrorKind, Duration> {
    HashMap::from([
        (ErrorKind::RateLimit, Duration::from_secs(300)),
        (ErrorKind::Auth, Duration::from_secs(1800)),
        (ErrorKind::Server, Duration::from_secs(60)),
        (ErrorKind::Network, Duration::from_secs(30)),
        (ErrorKind::Timeout, Duration::from_secs(10)),
    ])
}

/// Fallback cooldown for kinds without a configured period.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Owns the credential pool and all health bookkeeping.
///
/// The pool is a sharded map: entries are mutated in place under their shard
/// guard, and every snapshot handed out (`select_best`, `list_health`,
/// `stats`) is a deep copy.
pub struct SessionScheduler {
    sessions: DashMap<String, SessionHealth>,
    config: SchedulerConfig,
    strategy: Strategy,
    stats: stats::StatsAggregator,
    /// Retry budget read by the driver on every request; adjustable at
    /// runtime through the admin surface.
    max_retry_attempts: AtomicU32,
    /// Unix seconds of the last sweep; CAS-guarded so at most one caller
    /// observing staleness spawns the next one.
    last_sweep: AtomicI64,
    start_time: DateTime<Utc>,
}

impl SessionScheduler {
    pub fn new(sessions: Vec<SessionInfo>, config: SchedulerConfig) -> Self {
        let now = Utc::now();
        let pool = DashMap::new();
        for info in sessions {
            let key = info.session_key.clone();
            pool.insert(key, SessionHealth::new(info, config.circuit_breaker_enabled));
        }

        let strategy = Strategy::from_kind(config.strategy);
        tracing::info!(
            sessions = pool.len(),
            strategy = %config.strategy,
            circuit_breaker = config.circuit_breaker_enabled,
            "session scheduler initialized"
        );

        Self {
            sessions: pool,
            max_retry_attempts: AtomicU32::new(config.max_retry_attempts),
            config,
            strategy,
            stats: stats::StatsAggregator::new(now),
            last_sweep: AtomicI64::new(now.timestamp()),
            start_time: now,
        }
    }

    /// Picks the best eligible credential outside `excluded`, stamping its
    /// `last_used`. Kicks off an asynchronous health sweep when the last one
    /// is stale.
    pub fn select_best(
        self: &Arc<Self>,
        excluded: &HashSet<String>,
    ) -> AppResult<SessionHealth> {
        let now = Utc::now();
        self.maybe_schedule_sweep(now);

        let floor = self.strategy.floor();
        let candidates: Vec<Candidate> = self
            .sessions
            .iter()
            .filter(|entry| !excluded.contains(entry.key()))
            .filter(|entry| entry.value().is_eligible(floor, now))
            .map(|entry| Candidate {
                key: entry.key().clone(),
                score: entry.value().health_score,
                weight: entry.value().weight,
            })
            .collect();

        let key = self
            .strategy
            .select(candidates)
            .ok_or(AppError::NoAvailableSession)?;

        let mut entry = self.sessions.get_mut(&key).ok_or(AppError::NoAvailableSession)?;
        entry.last_used = now;
        Ok(entry.clone())
    }

    /// Applies a successful result. Unknown keys are silently dropped.
    pub fn record_success(&self, session_key: &str, latency: Duration) {
        let now = Utc::now();
        {
            let Some(mut entry) = self.sessions.get_mut(session_key) else {
                return;
            };
            entry.record_success(latency, now);
        }
        self.stats.record(session_key, true, latency, None, now);
        self.refresh_session_tallies();
        self.strategy.record_result(true, latency);
    }

    /// Applies a failed result: cooldown, breaker feed, score and stats
    /// update. Unknown keys are silently dropped.
    pub fn record_error(&self, session_key: &str, kind: ErrorKind, message: &str) {
        let now = Utc::now();
        let cooldown = self.cooldown_for(kind);
        {
            let Some(mut entry) = self.sessions.get_mut(session_key) else {
                return;
            };
            entry.record_error(kind, message, cooldown, now);
            tracing::warn!(
                session = %mask_key(session_key),
                kind = %kind,
                status = %entry.status,
                score = entry.health_score,
                "recorded session error"
            );
        }
        self.stats.record(session_key, false, Duration::ZERO, Some(kind), now);
        self.refresh_session_tallies();
        self.strategy.record_result(false, Duration::ZERO);
    }

    /// Adds a credential at initial health. Idempotent: existing keys are
    /// left untouched.
    pub fn add_session(&self, info: SessionInfo) -> bool {
        if self.sessions.contains_key(&info.session_key) {
            return false;
        }
        let key = info.session_key.clone();
        self.sessions
            .insert(key.clone(), SessionHealth::new(info, self.config.circuit_breaker_enabled));
        tracing::info!(session = %mask_key(&key), "session added to pool");
        true
    }

    /// Removes a credential. Readers never observe a partially-removed entry.
    pub fn remove_session(&self, session_key: &str) -> bool {
        let removed = self.sessions.remove(session_key).is_some();
        if removed {
            tracing::info!(session = %mask_key(session_key), "session removed from pool");
        }
        removed
    }

    /// Backfills the organization id discovered on first successful use.
    pub fn set_org_id(&self, session_key: &str, org_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_key) {
            if entry.org_id.is_none() {
                tracing::info!(session = %mask_key(session_key), org_id, "backfilled org id");
                entry.org_id = Some(org_id.to_string());
            }
        }
    }

    /// Updates the organization id unconditionally (admin surface).
    pub fn update_org_id(&self, session_key: &str, org_id: Option<String>) -> bool {
        match self.sessions.get_mut(session_key) {
            Some(mut entry) => {
                entry.org_id = org_id.filter(|o| !o.is_empty());
                true
            },
            None => false,
        }
    }

    /// Restores a credential to its initial health. Returns `false` for
    /// unknown keys.
    pub fn reset_session(&self, session_key: &str) -> bool {
        match self.sessions.get_mut(session_key) {
            Some(mut entry) => {
                entry.reset(self.config.circuit_breaker_enabled);
                tracing::info!(session = %mask_key(session_key), "session health reset");
                true
            },
            None => false,
        }
    }

    /// Deep-copied health rows, best score first.
    pub fn list_health(&self) -> Vec<SessionHealth> {
        let mut rows: Vec<SessionHealth> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        rows.sort_by(|a, b| {
            b.health_score
                .partial_cmp(&a.health_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows
    }

    /// Deep-copied health row for one credential.
    pub fn session_health(&self, session_key: &str) -> Option<SessionHealth> {
        self.sessions.get(session_key).map(|entry| entry.value().clone())
    }

    /// Deep-copied aggregate stats snapshot.
    pub fn stats(&self) -> AggregateStats {
        self.stats.snapshot()
    }

    /// Whether the credential would pass the configured availability bar.
    pub fn is_available(&self, session_key: &str) -> bool {
        let now = Utc::now();
        self.sessions.get(session_key).is_some_and(|entry| {
            entry.status == SessionStatus::Active
                && entry.health_score >= self.config.min_health_score
                && entry.cooldown_expired(now)
        })
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.sessions.contains_key(session_key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts.load(Ordering::Relaxed)
    }

    /// Adjusts the retry budget; the next drive picks it up.
    pub fn set_max_retry_attempts(&self, attempts: u32) {
        self.max_retry_attempts.store(attempts, Ordering::Relaxed);
        tracing::info!(attempts, "max retry attempts updated");
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> String {
        self.strategy.name()
    }

    /// Walks every credential and advances expired cooldowns and open-window
    /// breakers. Transitions only move forward (Cooling→Active,
    /// Open→HalfOpen→Active), so concurrent sweeps are harmless.
    pub fn run_health_sweep(&self) {
        let now = Utc::now();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();

            if session.status == SessionStatus::Cooling && session.cooldown_expired(now) {
                session.status = SessionStatus::Active;
                tracing::debug!(session = %mask_key(&session.session_key), "cooldown cleared");
            }

            if session.status == SessionStatus::CircuitOpen {
                if let Some(breaker) = session.breaker.as_mut() {
                    if breaker.try_half_open(now) {
                        session.status = SessionStatus::Active;
                        tracing::info!(
                            session = %mask_key(&session.session_key),
                            "circuit half-open, session active again"
                        );
                    }
                }
            }
        }
    }

    fn cooldown_for(&self, kind: ErrorKind) -> Duration {
        self.config.cooldown_periods.get(&kind).copied().unwrap_or(DEFAULT_COOLDOWN)
    }

    fn maybe_schedule_sweep(self: &Arc<Self>, now: DateTime<Utc>) {
        let now_ts = now.timestamp();
        let last = self.last_sweep.load(Ordering::Acquire);
        let stale = now_ts.saturating_sub(last) > self.config.health_check_interval.as_secs() as i64;
        if !stale {
            return;
        }
        // The CAS winner is the only caller that spawns.
        if self
            .last_sweep
            .compare_exchange(last, now_ts, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let scheduler = Arc::clone(self);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { scheduler.run_health_sweep() });
        } else {
            scheduler.run_health_sweep();
        }
    }

    fn refresh_session_tallies(&self) {
        let mut active = 0;
        let mut cooling = 0;
        let mut failed = 0;
        for entry in self.sessions.iter() {
            match entry.value().status {
                SessionStatus::Active => active += 1,
                SessionStatus::Cooling => cooling += 1,
                SessionStatus::Failed | SessionStatus::CircuitOpen => failed += 1,
            }
        }
        self.stats.set_session_tallies(active, cooling, failed);
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &DashMap<String, SessionHealth> {
        &self.sessions
    }
}
