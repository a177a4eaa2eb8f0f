pub mod auth;
pub mod cors;

pub use auth::{admin_auth_middleware, api_auth_middleware, SecurityConfig};
pub use cors::cors_layer;
