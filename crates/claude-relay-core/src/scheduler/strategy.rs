//! Credential selection strategies.
//!
//! Four variants: round-robin, health-priority, weighted, and an adaptive
//! wrapper that delegates to whichever of the first three has been performing
//! best. Strategies pick from an eligibility-filtered candidate snapshot; the
//! score floor applied during filtering is strategy-specific.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Configured strategy variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    HealthPriority,
    Weighted,
    Adaptive,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::RoundRobin
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round_robin"),
            StrategyKind::HealthPriority => write!(f, "health_priority"),
            StrategyKind::Weighted => write!(f, "weighted"),
            StrategyKind::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "health_priority" => Ok(StrategyKind::HealthPriority),
            "weighted" => Ok(StrategyKind::Weighted),
            "adaptive" => Ok(StrategyKind::Adaptive),
            other => Err(format!("unknown schedule strategy: {other}")),
        }
    }
}

/// Eligible-credential snapshot row handed to a strategy.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub key: String,
    pub score: f64,
    pub weight: f64,
}

/// How often the adaptive strategy re-evaluates its delegate.
const ADAPTIVE_EVALUATION_INTERVAL: Duration = Duration::from_secs(300);

/// Delegates whose own average latency exceeds this get their success rate
/// discounted by 0.8 during evaluation.
const ADAPTIVE_LATENCY_THRESHOLD: Duration = Duration::from_secs(1);

pub(crate) enum Strategy {
    Base(BaseStrategy),
    Adaptive(AdaptiveStrategy),
}

impl Strategy {
    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Strategy::Base(BaseStrategy::round_robin()),
            StrategyKind::HealthPriority => Strategy::Base(BaseStrategy::HealthPriority),
            StrategyKind::Weighted => Strategy::Base(BaseStrategy::Weighted),
            StrategyKind::Adaptive => Strategy::Adaptive(AdaptiveStrategy::new()),
        }
    }

    /// Score floor candidates must clear to be eligible for this strategy.
    pub fn floor(&self) -> f64 {
        match self {
            Strategy::Base(base) => base.floor(),
            Strategy::Adaptive(adaptive) => adaptive.floor(),
        }
    }

    pub fn select(&self, candidates: Vec<Candidate>) -> Option<String> {
        match self {
            Strategy::Base(base) => base.select(candidates),
            Strategy::Adaptive(adaptive) => adaptive.select(candidates),
        }
    }

    /// Feeds one driver result into the strategy's own performance stats.
    /// Only the adaptive variant keeps any.
    pub fn record_result(&self, success: bool, latency: Duration) {
        if let Strategy::Adaptive(adaptive) = self {
            adaptive.record_result(success, latency);
        }
    }

    pub fn name(&self) -> String {
        match self {
            Strategy::Base(base) => base.name().to_string(),
            Strategy::Adaptive(adaptive) => adaptive.name(),
        }
    }
}

pub(crate) enum BaseStrategy {
    RoundRobin { cursor: Mutex<usize> },
    HealthPriority,
    Weighted,
}

impl BaseStrategy {
    fn round_robin() -> Self {
        BaseStrategy::RoundRobin { cursor: Mutex::new(0) }
    }

    fn name(&self) -> &'static str {
        match self {
            BaseStrategy::RoundRobin { .. } => "round_robin",
            BaseStrategy::HealthPriority => "health_priority",
            BaseStrategy::Weighted => "weighted",
        }
    }

    fn floor(&self) -> f64 {
        match self {
            BaseStrategy::HealthPriority => 0.3,
            _ => 0.1,
        }
    }

    fn select(&self, mut candidates: Vec<Candidate>) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            BaseStrategy::RoundRobin { cursor } => {
                // Key-sorted so the cycle order is stable across calls.
                candidates.sort_by(|a, b| a.key.cmp(&b.key));
                let mut cursor = cursor.lock();
                let index = *cursor % candidates.len();
                *cursor += 1;
                Some(candidates[index].key.clone())
            },
            BaseStrategy::HealthPriority => {
                candidates.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.key.cmp(&b.key))
                });
                Some(candidates[0].key.clone())
            },
            BaseStrategy::Weighted => Some(weighted_pick(&candidates)),
        }
    }
}

/// Weighted random draw over `score × weight`; degenerates to a uniform pick
/// when every effective weight is zero.
fn weighted_pick(candidates: &[Candidate]) -> String {
    let mut rng = rand::thread_rng();
    let total: f64 = candidates.iter().map(|c| c.score * c.weight).sum();

    if total <= 0.0 {
        let index = rng.gen_range(0..candidates.len());
        return candidates[index].key.clone();
    }

    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for candidate in candidates {
        cumulative += candidate.score * candidate.weight;
        if cumulative >= target {
            return candidate.key.clone();
        }
    }

    candidates[candidates.len() - 1].key.clone()
}

#[derive(Debug, Default, Clone, Copy)]
struct StrategyStats {
    success_count: u64,
    error_count: u64,
    avg_latency: Duration,
}

impl StrategyStats {
    fn performance(&self) -> Option<f64> {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return None;
        }
        let success_rate = self.success_count as f64 / total as f64;
        let latency_factor =
            if self.avg_latency > ADAPTIVE_LATENCY_THRESHOLD { 0.8 } else { 1.0 };
        Some(success_rate * latency_factor)
    }
}

struct AdaptiveInner {
    strategies: Vec<BaseStrategy>,
    active: usize,
    last_evaluation: Instant,
    stats: HashMap<&'static str, StrategyStats>,
}

/// Delegating strategy that periodically switches to the best-performing
/// base strategy, judged by success rate discounted for slow averages.
pub(crate) struct AdaptiveStrategy {
    inner: Mutex<AdaptiveInner>,
}

impl AdaptiveStrategy {
    fn new() -> Self {
        Self {
            inner: Mutex::new(AdaptiveInner {
                strategies: vec![
                    BaseStrategy::round_robin(),
                    BaseStrategy::HealthPriority,
                    BaseStrategy::Weighted,
                ],
                active: 0,
                last_evaluation: Instant::now(),
                stats: HashMap::new(),
            }),
        }
    }

    fn floor(&self) -> f64 {
        let inner = self.inner.lock();
        inner.strategies[inner.active].floor()
    }

    fn select(&self, candidates: Vec<Candidate>) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.last_evaluation.elapsed() > ADAPTIVE_EVALUATION_INTERVAL {
            Self::evaluate(&mut inner);
        }
        inner.strategies[inner.active].select(candidates)
    }

    fn record_result(&self, success: bool, latency: Duration) {
        let mut inner = self.inner.lock();
        let name = inner.strategies[inner.active].name();
        let stats = inner.stats.entry(name).or_default();
        if success {
            stats.success_count += 1;
            stats.avg_latency = if stats.avg_latency.is_zero() {
                latency
            } else {
                (stats.avg_latency + latency) / 2
            };
        } else {
            stats.error_count += 1;
        }
    }

    fn name(&self) -> String {
        let inner = self.inner.lock();
        format!("adaptive_{}", inner.strategies[inner.active].name())
    }

    fn evaluate(inner: &mut AdaptiveInner) {
        inner.last_evaluation = Instant::now();

        let mut best = inner.active;
        let mut best_performance = 0.0;
        for (index, strategy) in inner.strategies.iter().enumerate() {
            let Some(performance) =
                inner.stats.get(strategy.name()).and_then(StrategyStats::performance)
            else {
                continue;
            };
            if performance > best_performance {
                best_performance = performance;
                best = index;
            }
        }

        if best != inner.active {
            tracing::info!(
                from = inner.strategies[inner.active].name(),
                to = inner.strategies[best].name(),
                performance = best_performance,
                "adaptive strategy switching delegate"
            );
            inner.active = best;
        }
    }
}
