//! HTTP facade: router, handlers, middleware, telemetry, upstream client.

pub mod handlers;
pub mod middleware;
pub mod server;
pub mod telemetry;
pub mod upstream;

pub use middleware::SecurityConfig;
pub use server::{build_router, AppState, RelayServer, RuntimeSettings};
pub use telemetry::{TelemetryFrame, TelemetryHub};
