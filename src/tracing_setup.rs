//! Tracing initialization
//!
//! Structured logging via `tracing`, filtered by `RUST_LOG` with a sensible
//! default. Call once at startup; embedding hosts that already install a
//! subscriber should skip this.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber
///
/// Respects `RUST_LOG`; defaults to `info` for this crate and `warn` for
/// everything else. Returns an error if a global subscriber is already set.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,reflective_memory=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(())
}
