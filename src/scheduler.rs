//! Periodic tick driving `refresh()` across the provider registry.
//!
//! Not tied to any particular UI toolkit: the bin crate's `watch`
//! command owns the tokio runtime and runs this loop directly.

use std::sync::Arc;

use tokio::time::interval;

use crate::config::Config;
use crate::providers::ProviderRegistry;

/// Runs until `config.refresh_interval` is `Manual`, in which case it
/// returns immediately after the zero-delay initial kick without ever
/// ticking again. Only providers `config.is_enabled()` accepts are
/// refreshed on either the initial kick or subsequent ticks.
pub async fn run_scheduler(registry: Arc<ProviderRegistry>, config: Config) {
    refresh_enabled(&registry, &config).await;

    let Some(period) = config.refresh_interval.as_duration() else {
        tracing::info!("refresh interval is Manual, scheduler will not tick");
        return;
    };

    let mut tick = interval(period);
    // The first tick() call returns immediately; the initial kick above
    // already covers it, so the loop's own ticks start at `period`.
    tick.tick().await;

    loop {
        tick.tick().await;
        refresh_enabled(&registry, &config).await;
    }
}

async fn refresh_enabled(registry: &ProviderRegistry, config: &Config) {
    for provider in registry.providers() {
        if !config.is_enabled(provider.id()) {
            continue;
        }
        provider.refresh().await;
        tracing::debug!(provider = provider.name(), state = ?provider.state(), "refreshed");
    }
}
