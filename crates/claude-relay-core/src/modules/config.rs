//! Configuration loading and validation.
//!
//! A `config.json` next to the executable (or in the working directory) wins;
//! otherwise every setting comes from environment variables. Validation runs
//! once at startup and any violation aborts the process.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::scheduler::{
    default_cooldown_periods, ErrorKind, SchedulerConfig, SessionInfo, StrategyKind,
};

const CONFIG_FILE: &str = "config.json";

const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CHAT_HISTORY: usize = 10_000;

/// Scheduler block of the config file. Durations are seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub schedule_strategy: StrategyKind,
    pub health_check_interval: u64,
    pub min_health_score: f64,
    pub circuit_breaker_enabled: bool,
    /// Signed so a negative value survives parsing and fails validation
    /// instead of being silently replaced by the default.
    pub max_retry_attempts: i64,
    /// Error-kind name → cooldown seconds; unset kinds keep their defaults.
    pub cooldown_periods: HashMap<ErrorKind, u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_strategy: StrategyKind::RoundRobin,
            health_check_interval: 30,
            min_health_score: 0.5,
            circuit_breaker_enabled: true,
            max_retry_attempts: 3,
            cooldown_periods: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub sessions: Vec<SessionInfo>,
    pub scheduler: SchedulerSettings,
    pub address: String,
    pub api_key: String,
    /// Admin surface key; falls back to `api_key` when empty.
    pub admin_key: String,
    pub proxy: Option<String>,
    pub cors_allowed_origins: Vec<String>,
    pub chat_delete: bool,
    pub max_chat_history_length: usize,
    pub no_role_prefix: bool,
    pub enable_mirror_api: bool,
    pub mirror_api_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            scheduler: SchedulerSettings::default(),
            address: DEFAULT_ADDRESS.to_string(),
            api_key: String::new(),
            admin_key: String::new(),
            proxy: None,
            cors_allowed_origins: vec!["*".to_string()],
            chat_delete: true,
            max_chat_history_length: DEFAULT_MAX_CHAT_HISTORY,
            no_role_prefix: false,
            enable_mirror_api: false,
            mirror_api_prefix: String::new(),
        }
    }
}

impl Config {
    pub fn admin_key(&self) -> &str {
        if self.admin_key.is_empty() {
            &self.api_key
        } else {
            &self.admin_key
        }
    }

    pub fn is_scheduler_enabled(&self) -> bool {
        self.scheduler.enabled && !self.sessions.is_empty()
    }

    /// Converts the raw settings block into scheduler construction
    /// parameters, overlaying configured cooldowns on the defaults.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut cooldown_periods = default_cooldown_periods();
        for (kind, secs) in &self.scheduler.cooldown_periods {
            cooldown_periods.insert(*kind, Duration::from_secs(*secs));
        }

        SchedulerConfig {
            enabled: self.scheduler.enabled,
            strategy: self.scheduler.schedule_strategy,
            health_check_interval: Duration::from_secs(self.scheduler.health_check_interval.max(1)),
            min_health_score: self.scheduler.min_health_score,
            circuit_breaker_enabled: self.scheduler.circuit_breaker_enabled,
            max_retry_attempts: self.scheduler.max_retry_attempts.max(0) as u32,
            cooldown_periods,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.sessions.is_empty() {
            return Err(AppError::Config("no sessions configured".to_string()));
        }
        for (index, session) in self.sessions.iter().enumerate() {
            if session.session_key.is_empty() {
                return Err(AppError::Config(format!("session {} has an empty key", index + 1)));
            }
        }
        if self.api_key.is_empty() {
            return Err(AppError::Config("api key is required".to_string()));
        }
        if self.scheduler.enabled {
            if !(0.0..=1.0).contains(&self.scheduler.min_health_score) {
                return Err(AppError::Config(
                    "min health score must be between 0 and 1".to_string(),
                ));
            }
            if self.scheduler.max_retry_attempts < 0 {
                return Err(AppError::Config(
                    "max retry attempts must be non-negative".to_string(),
                ));
            }
        }
        if self.enable_mirror_api && self.mirror_api_prefix.is_empty() {
            return Err(AppError::Config(
                "mirror api enabled but mirrorApiPrefix is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the configuration: file first, environment as fallback.
pub fn load_config() -> AppResult<Config> {
    if let Some(path) = find_config_file() {
        tracing::info!(path = %path.display(), "loading configuration from file");
        match load_from_file(&path) {
            Ok(config) => return Ok(config),
            Err(e) => {
                tracing::error!(
                    "failed to load config file, falling back to environment: {e}"
                );
            },
        }
    }

    tracing::info!("loading configuration from environment variables");
    load_from_env()
}

fn find_config_file() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(CONFIG_FILE));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(CONFIG_FILE));
    }
    candidates.into_iter().find(|p| p.exists())
}

fn load_from_file(path: &Path) -> AppResult<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

fn load_from_env() -> AppResult<Config> {
    let strategy = match env_var("SESSION_SCHEDULER_STRATEGY") {
        Some(raw) => raw
            .parse::<StrategyKind>()
            .map_err(AppError::Config)?,
        None => StrategyKind::RoundRobin,
    };

    let scheduler = SchedulerSettings {
        enabled: env_var("SESSION_SCHEDULER_ENABLED").as_deref() == Some("true"),
        schedule_strategy: strategy,
        health_check_interval: env_parse("HEALTH_CHECK_INTERVAL", 30),
        min_health_score: env_parse("MIN_HEALTH_SCORE", 0.5),
        circuit_breaker_enabled: env_var("CIRCUIT_BREAKER_ENABLED").as_deref() != Some("false"),
        max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", 3),
        cooldown_periods: HashMap::new(),
    };

    Ok(Config {
        sessions: parse_sessions_env(&env_var("SESSIONS").unwrap_or_default()),
        scheduler,
        address: env_var("ADDRESS").unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
        api_key: env_var("APIKEY").unwrap_or_default(),
        admin_key: env_var("ADMIN_KEY").unwrap_or_default(),
        proxy: env_var("PROXY"),
        cors_allowed_origins: parse_origins_env(&env_var("CORS_ORIGINS").unwrap_or_default()),
        chat_delete: env_var("CHAT_DELETE").as_deref() != Some("false"),
        max_chat_history_length: env_parse("MAX_CHAT_HISTORY_LENGTH", DEFAULT_MAX_CHAT_HISTORY),
        no_role_prefix: env_var("NO_ROLE_PREFIX").as_deref() == Some("true"),
        enable_mirror_api: env_var("ENABLE_MIRROR_API").as_deref() == Some("true"),
        mirror_api_prefix: env_var("MIRROR_API_PREFIX").unwrap_or_default(),
    })
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parses `SESSIONS`: comma-separated `sessionKey` or `sessionKey:orgID`.
fn parse_sessions_env(value: &str) -> Vec<SessionInfo> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((key, org)) => SessionInfo::new(key, Some(org.to_string())),
            None => SessionInfo::new(pair, None),
        })
        .collect()
}

fn parse_origins_env(value: &str) -> Vec<String> {
    let origins: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() {
        vec!["*".to_string()]
    } else {
        origins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sessions_env() {
        let sessions = parse_sessions_env("sk-ant-aaa:org-1,sk-ant-bbb,,sk-ant-ccc:");
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].session_key, "sk-ant-aaa");
        assert_eq!(sessions[0].org_id.as_deref(), Some("org-1"));
        assert_eq!(sessions[1].org_id, None);
        assert_eq!(sessions[2].org_id, None);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config {
            sessions: vec![SessionInfo::new("sk-ant-aaa", None)],
            api_key: "secret".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.scheduler.enabled = true;
        config.scheduler.min_health_score = 1.5;
        assert!(config.validate().is_err());

        config.scheduler.min_health_score = 0.5;
        config.scheduler.max_retry_attempts = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_shape_parses() {
        let raw = r#"{
            "sessions": [{"sessionKey": "sk-ant-aaa", "orgID": "org-1"}],
            "apiKey": "secret",
            "scheduler": {
                "enabled": true,
                "scheduleStrategy": "health_priority",
                "minHealthScore": 0.4,
                "cooldownPeriods": {"rate_limit": 600}
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.schedule_strategy, StrategyKind::HealthPriority);

        let scheduler_config = config.scheduler_config();
        assert_eq!(
            scheduler_config.cooldown_periods.get(&ErrorKind::RateLimit),
            Some(&Duration::from_secs(600))
        );
        // Unset kinds keep their defaults.
        assert_eq!(
            scheduler_config.cooldown_periods.get(&ErrorKind::Auth),
            Some(&Duration::from_secs(1800))
        );
    }

    #[test]
    fn test_admin_key_falls_back_to_api_key() {
        let config = Config { api_key: "secret".to_string(), ..Config::default() };
        assert_eq!(config.admin_key(), "secret");
    }
}
