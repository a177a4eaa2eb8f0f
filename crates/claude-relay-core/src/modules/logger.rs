//! Logging utilities.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global logger.
pub fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

/// Mask a secret for log output, keeping a short identifying prefix.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 12 {
        return "*".repeat(secret.len());
    }
    format!("{}...", &secret[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_keeps_prefix() {
        let masked = mask_secret("sk-ant-sid01-abcdefghij");
        assert_eq!(masked, "sk-ant-sid01...");
    }

    #[test]
    fn test_mask_secret_short_value() {
        assert_eq!(mask_secret("short"), "*****");
    }
}
