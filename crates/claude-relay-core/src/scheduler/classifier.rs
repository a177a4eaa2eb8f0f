//! Error classification and retry/backoff policy.
//!
//! Maps an upstream outcome `(status, message)` to a semantic [`ErrorKind`]
//! and derives whether the driver should keep retrying and how long to back
//! off between attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Semantic classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Server,
    Network,
    Timeout,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Server => write!(f, "server"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Message substrings indicating a transport-level failure.
const NETWORK_PATTERNS: &[&str] = &["network", "connection", "dns", "socket"];

/// Message substrings indicating a timed-out or aborted request.
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "deadline", "context canceled"];

/// Message substrings indicating a credential problem.
const AUTH_PATTERNS: &[&str] = &["unauthorized", "forbidden", "invalid", "expired"];

/// Message substrings indicating throttling.
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests"];

/// Cap applied to every backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Classifies an upstream outcome. Status codes win over message inspection.
pub fn classify(status: u16, message: &str) -> ErrorKind {
    match status {
        429 => return ErrorKind::RateLimit,
        401 | 403 => return ErrorKind::Auth,
        500 | 502 | 503 | 504 => return ErrorKind::Server,
        _ => {},
    }

    let msg = message.to_lowercase();
    if NETWORK_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::Network;
    }
    if TIMEOUT_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::Timeout;
    }
    if AUTH_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::Auth;
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::RateLimit;
    }

    ErrorKind::Other
}

/// Auth failures never resolve by switching credentials.
pub fn should_stop_retry(kind: ErrorKind) -> bool {
    kind == ErrorKind::Auth
}

/// Whether the credential itself is expected to recover from this failure.
pub fn is_recoverable(kind: ErrorKind) -> bool {
    kind != ErrorKind::Auth
}

/// Base delay before retrying after a failure of the given kind.
pub fn base_backoff(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::RateLimit => Duration::from_secs(5),
        ErrorKind::Server => Duration::from_secs(2),
        ErrorKind::Network | ErrorKind::Timeout => Duration::from_secs(1),
        _ => Duration::from_secs(1),
    }
}

/// Backoff for the given attempt (1-based): `base × attempt × 1.5`, capped.
pub fn backoff_delay(attempt: u32, kind: ErrorKind) -> Duration {
    let delay = base_backoff(kind).mul_f64(f64::from(attempt.max(1)) * 1.5);
    delay.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status_code() {
        assert_eq!(classify(429, ""), ErrorKind::RateLimit);
        assert_eq!(classify(401, ""), ErrorKind::Auth);
        assert_eq!(classify(403, ""), ErrorKind::Auth);
        assert_eq!(classify(500, ""), ErrorKind::Server);
        assert_eq!(classify(502, ""), ErrorKind::Server);
        assert_eq!(classify(503, ""), ErrorKind::Server);
        assert_eq!(classify(504, ""), ErrorKind::Server);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(classify(0, "connection refused"), ErrorKind::Network);
        assert_eq!(classify(0, "DNS lookup failed"), ErrorKind::Network);
        assert_eq!(classify(0, "request timeout"), ErrorKind::Timeout);
        assert_eq!(classify(0, "context canceled"), ErrorKind::Timeout);
        assert_eq!(classify(400, "invalid session key"), ErrorKind::Auth);
        assert_eq!(classify(0, "rate limit reached"), ErrorKind::RateLimit);
        assert_eq!(classify(418, "teapot"), ErrorKind::Other);
    }

    #[test]
    fn test_status_wins_over_message() {
        assert_eq!(classify(429, "connection reset"), ErrorKind::RateLimit);
    }

    #[test]
    fn test_retry_policy() {
        assert!(should_stop_retry(ErrorKind::Auth));
        assert!(!should_stop_retry(ErrorKind::RateLimit));
        assert!(!is_recoverable(ErrorKind::Auth));
        assert!(is_recoverable(ErrorKind::Server));
        assert!(is_recoverable(ErrorKind::Other));
    }

    #[test]
    fn test_server_backoff_schedule() {
        assert_eq!(backoff_delay(1, ErrorKind::Server), Duration::from_secs(3));
        assert_eq!(backoff_delay(2, ErrorKind::Server), Duration::from_secs(6));
        assert_eq!(backoff_delay(3, ErrorKind::Server), Duration::from_secs(9));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(100, ErrorKind::RateLimit), MAX_BACKOFF);
    }
}
