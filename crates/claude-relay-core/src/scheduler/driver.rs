//! Retry loop coordinating selection, execution, and result recording.
//!
//! The driver is handler-agnostic: the actual upstream conversation is an
//! opaque [`UpstreamExecutor`] returning an [`ExecutionOutcome`]. Failures
//! are classified, recorded against the credential that served the attempt,
//! and retried on a different credential until the budget runs out or a
//! non-recoverable kind shows up.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::classifier::{backoff_delay, classify, should_stop_retry, ErrorKind};
use super::credential::mask_key;
use super::SessionScheduler;

/// Result of one upstream attempt.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub status: u16,
    pub error: Option<String>,
    /// Organization id discovered during the attempt, stored by the
    /// scheduler when the credential had none.
    pub org_id: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(status: u16) -> Self {
        Self { ok: true, status, error: None, org_id: None }
    }

    pub fn success_with_org(status: u16, org_id: String) -> Self {
        Self { ok: true, status, error: None, org_id: Some(org_id) }
    }

    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self { ok: false, status, error: Some(error.into()), org_id: None }
    }
}

/// Opaque upstream conversation runner provided by the front-end.
#[async_trait]
pub trait UpstreamExecutor: Send + Sync {
    async fn run(&self, session_key: &str, org_id: Option<&str>) -> ExecutionOutcome;
}

/// Terminal outcome of a drive.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("no available sessions")]
    NoAvailableSession,

    #[error("request failed after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, kind: ErrorKind, message: String },

    #[error("request cancelled")]
    Cancelled,
}

/// Successful drive summary.
#[derive(Debug, Clone)]
pub struct DriveReport {
    pub session_key: String,
    pub latency: Duration,
    pub attempts: u32,
}

/// Drives one inbound request across the credential pool.
pub struct RequestDriver {
    scheduler: Arc<SessionScheduler>,
}

impl RequestDriver {
    pub fn new(scheduler: Arc<SessionScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn drive<E>(
        &self,
        executor: &E,
        cancel: &CancellationToken,
    ) -> Result<DriveReport, DriveError>
    where
        E: UpstreamExecutor + ?Sized,
    {
        let max_attempts = self.scheduler.max_retry_attempts();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<(ErrorKind, String)> = None;
        let mut attempts_made = 0;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(DriveError::Cancelled);
            }

            let session = match self.scheduler.select_best(&excluded) {
                Ok(session) => session,
                Err(_) => break,
            };
            attempts_made = attempt;

            tracing::info!(
                session = %mask_key(&session.session_key),
                score = session.health_score,
                attempt,
                max_attempts,
                "driving request"
            );

            let started = Instant::now();
            let outcome = executor.run(&session.session_key, session.org_id.as_deref()).await;
            let latency = started.elapsed();

            if outcome.ok {
                self.scheduler.record_success(&session.session_key, latency);
                if session.org_id.is_none() {
                    if let Some(org_id) = outcome.org_id.as_deref() {
                        self.scheduler.set_org_id(&session.session_key, org_id);
                    }
                }
                return Ok(DriveReport {
                    session_key: session.session_key,
                    latency,
                    attempts: attempt,
                });
            }

            let message = outcome
                .error
                .unwrap_or_else(|| format!("upstream returned status {}", outcome.status));
            let kind = classify(outcome.status, &message);
            self.scheduler.record_error(&session.session_key, kind, &message);
            last_error = Some((kind, message));

            if should_stop_retry(kind) {
                tracing::info!(kind = %kind, "stopping retries, error is not recoverable");
                break;
            }

            excluded.insert(session.session_key);

            if attempt < max_attempts {
                let delay = backoff_delay(attempt, kind);
                tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::select! {
                    () = cancel.cancelled() => return Err(DriveError::Cancelled),
                    () = tokio::time::sleep(delay) => {},
                }
            }
        }

        match last_error {
            Some((kind, message)) => {
                Err(DriveError::Exhausted { attempts: attempts_made, kind, message })
            },
            None => Err(DriveError::NoAvailableSession),
        }
    }
}
