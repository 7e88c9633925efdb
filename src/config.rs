//! Runtime configuration, sourced from environment variables with
//! in-code defaults. No config file format is mandated; this crate
//! keeps it minimal and environment-driven.

use std::collections::HashMap;
use std::time::Duration;

use crate::providers::ProviderId;

const REFRESH_INTERVAL_ENV: &str = "INCUBAR_REFRESH_INTERVAL_MS";
const DISABLED_PROVIDERS_ENV: &str = "INCUBAR_DISABLED_PROVIDERS";

const ALL_PROVIDERS: [ProviderId; 4] = [
    ProviderId::Codex,
    ProviderId::Claude,
    ProviderId::Gemini,
    ProviderId::Antigravity,
];

/// Scheduler tick cadence. `Manual` disables the periodic tick entirely;
/// the user-triggered "refresh all" path still calls `refresh()` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshInterval {
    Manual,
    Seconds60,
    Seconds180,
    Seconds300,
    Seconds900,
}

impl RefreshInterval {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            RefreshInterval::Manual => None,
            RefreshInterval::Seconds60 => Some(Duration::from_secs(60)),
            RefreshInterval::Seconds180 => Some(Duration::from_secs(180)),
            RefreshInterval::Seconds300 => Some(Duration::from_secs(300)),
            RefreshInterval::Seconds900 => Some(Duration::from_secs(900)),
        }
    }

    fn from_millis(ms: i64) -> Option<Self> {
        match ms {
            -1 => Some(RefreshInterval::Manual),
            60_000 => Some(RefreshInterval::Seconds60),
            180_000 => Some(RefreshInterval::Seconds180),
            300_000 => Some(RefreshInterval::Seconds300),
            900_000 => Some(RefreshInterval::Seconds900),
            _ => None,
        }
    }
}

impl Default for RefreshInterval {
    fn default() -> Self {
        RefreshInterval::Seconds60
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub refresh_interval: RefreshInterval,
    enabled_providers: HashMap<ProviderId, bool>,
}

impl Config {
    /// Reads `INCUBAR_REFRESH_INTERVAL_MS` and `INCUBAR_DISABLED_PROVIDERS`,
    /// falling back to "60s, all providers enabled" and logging a warning
    /// when a variable is set but does not parse.
    pub fn from_env() -> Self {
        let refresh_interval = match std::env::var(REFRESH_INTERVAL_ENV) {
            Ok(raw) => match raw.parse::<i64>().ok().and_then(RefreshInterval::from_millis) {
                Some(interval) => interval,
                None => {
                    tracing::warn!(
                        value = %raw,
                        "unrecognized {REFRESH_INTERVAL_ENV} value, defaulting to 60s"
                    );
                    RefreshInterval::default()
                }
            },
            Err(_) => RefreshInterval::default(),
        };

        let mut enabled_providers: HashMap<ProviderId, bool> =
            ALL_PROVIDERS.iter().map(|&id| (id, true)).collect();

        if let Ok(raw) = std::env::var(DISABLED_PROVIDERS_ENV) {
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match parse_provider_name(name) {
                    Some(id) => {
                        enabled_providers.insert(id, false);
                    }
                    None => {
                        tracing::warn!(provider = name, "unrecognized entry in {DISABLED_PROVIDERS_ENV}, ignoring");
                    }
                }
            }
        }

        Config {
            refresh_interval,
            enabled_providers,
        }
    }

    /// Whether `id` should be scheduled/refreshed. Defaults to `true` for
    /// any provider not explicitly disabled.
    pub fn is_enabled(&self, id: ProviderId) -> bool {
        self.enabled_providers.get(&id).copied().unwrap_or(true)
    }

    pub fn with_refresh_interval(mut self, refresh_interval: RefreshInterval) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn disable(&mut self, id: ProviderId) {
        self.enabled_providers.insert(id, false);
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            refresh_interval: RefreshInterval::default(),
            enabled_providers: ALL_PROVIDERS.iter().map(|&id| (id, true)).collect(),
        }
    }
}

fn parse_provider_name(name: &str) -> Option<ProviderId> {
    match name.to_ascii_lowercase().as_str() {
        "codex" => Some(ProviderId::Codex),
        "claude" => Some(ProviderId::Claude),
        "gemini" => Some(ProviderId::Gemini),
        "antigravity" => Some(ProviderId::Antigravity),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_millis_values_map_to_variants() {
        assert_eq!(RefreshInterval::from_millis(-1), Some(RefreshInterval::Manual));
        assert_eq!(RefreshInterval::from_millis(60_000), Some(RefreshInterval::Seconds60));
        assert_eq!(RefreshInterval::from_millis(900_000), Some(RefreshInterval::Seconds900));
    }

    #[test]
    fn unknown_millis_value_is_rejected() {
        assert_eq!(RefreshInterval::from_millis(45_000), None);
    }

    #[test]
    fn manual_interval_has_no_duration() {
        assert!(RefreshInterval::Manual.as_duration().is_none());
        assert_eq!(RefreshInterval::Seconds60.as_duration(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn default_config_is_60_seconds_all_enabled() {
        let config = Config::default();
        assert_eq!(config.refresh_interval, RefreshInterval::Seconds60);
        assert!(config.is_enabled(ProviderId::Codex));
        assert!(config.is_enabled(ProviderId::Antigravity));
    }

    #[test]
    fn parse_provider_name_is_case_insensitive() {
        assert_eq!(parse_provider_name("Claude"), Some(ProviderId::Claude));
        assert_eq!(parse_provider_name("nonsense"), None);
    }
}
