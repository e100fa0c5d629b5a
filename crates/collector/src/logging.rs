//! Tracing subscriber setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use usage_analytics_config::ObservabilityConfig;

use crate::error::Result;

/// Install the global subscriber: `EnvFilter` from `log_level`, plain or JSON output
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {}", config.log_level, e))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_logging {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;
    Ok(())
}
