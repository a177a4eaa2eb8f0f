//! Live telemetry broadcasting.
//!
//! A broadcast hub fans scheduler snapshots out to every connected WebSocket
//! client: a periodic stats/sessions tick every five seconds plus
//! event-driven frames whenever the credential pool is mutated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::scheduler::SessionScheduler;

const BROADCAST_CAPACITY: usize = 100;
const STATS_TICK: Duration = Duration::from_secs(5);

/// One WebSocket frame: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryFrame {
    fn new(kind: &'static str, data: Value) -> Self {
        Self { kind, data, timestamp: Utc::now() }
    }
}

pub struct TelemetryHub {
    scheduler: Arc<SessionScheduler>,
    tx: broadcast::Sender<TelemetryFrame>,
}

impl TelemetryHub {
    pub fn new(scheduler: Arc<SessionScheduler>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { scheduler, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.tx.subscribe()
    }

    /// Spawns the periodic snapshot broadcaster.
    pub fn start(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                if hub.tx.receiver_count() == 0 {
                    continue;
                }
                hub.broadcast_stats();
                hub.broadcast_sessions();
            }
        });
        tracing::info!("telemetry broadcaster started (interval: 5s)");
    }

    pub fn stats_frame(&self) -> TelemetryFrame {
        let data = serde_json::to_value(self.scheduler.stats()).unwrap_or(Value::Null);
        TelemetryFrame::new("stats_update", data)
    }

    pub fn sessions_frame(&self) -> TelemetryFrame {
        let data = serde_json::to_value(self.scheduler.list_health()).unwrap_or(Value::Null);
        TelemetryFrame::new("sessions_update", data)
    }

    pub fn broadcast_stats(&self) {
        let _ = self.tx.send(self.stats_frame());
    }

    pub fn broadcast_sessions(&self) {
        let _ = self.tx.send(self.sessions_frame());
    }

    /// Emits a `session_change` frame followed by a fresh pool snapshot.
    pub fn broadcast_session_change(&self, session_key: &str, action: &str) {
        let frame = TelemetryFrame::new(
            "session_change",
            json!({ "session_key": session_key, "action": action }),
        );
        let _ = self.tx.send(frame);
        self.broadcast_sessions();
    }
}
