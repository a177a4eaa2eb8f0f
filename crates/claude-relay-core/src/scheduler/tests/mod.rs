use std::sync::Arc;

use super::{SchedulerConfig, SessionInfo, SessionScheduler, StrategyKind};

mod driver_tests;

pub(crate) fn test_config(strategy: StrategyKind) -> SchedulerConfig {
    SchedulerConfig { enabled: true, strategy, ..SchedulerConfig::default() }
}

pub(crate) fn make_scheduler(keys: &[&str], strategy: StrategyKind) -> Arc<SessionScheduler> {
    let sessions = keys.iter().map(|k| SessionInfo::new(*k, None)).collect();
    Arc::new(SessionScheduler::new(sessions, test_config(strategy)))
}
