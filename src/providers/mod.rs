//! Provider subsystem: per-vendor usage-acquisition engines and the registry
//! that holds them.
//!
//! Every provider hides its acquisition mechanics (subprocess JSON-RPC,
//! PTY scraping, OAuth REST, process/port probing) behind the uniform
//! [`Provider`] contract so the tray surface never has to know which
//! vendor it is looking at.

mod antigravity;
mod claude;
mod codex;
mod gemini;
pub mod json_rpc;
pub mod pty_session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

pub use antigravity::AntigravityProvider;
pub use claude::ClaudeProvider;
pub use codex::CodexProvider;
pub use gemini::GeminiProvider;

/// Closed set of vendors this crate knows how to drive.
///
/// `Unknown` is not reachable through [`ProviderRegistry`]; it exists only
/// as a safe default so `name()` never has to panic on an unmatched id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Codex,
    Claude,
    Gemini,
    Antigravity,
    #[serde(skip)]
    Unknown,
}

impl ProviderId {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderId::Codex => "Codex",
            ProviderId::Claude => "Claude",
            ProviderId::Gemini => "Gemini",
            ProviderId::Antigravity => "Antigravity",
            ProviderId::Unknown => "Unknown",
        }
    }
}

/// Coarse health state. `Active` and `Error` are reached only from a
/// provider's own refresh logic; `Stale` is reserved for explicit
/// invalidation and is not produced anywhere in this crate today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Active,
    Error,
    Stale,
}

/// One quota window (session, weekly, or per-model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimit {
    pub label: String,
    pub used: f64,
    pub total: f64,
    pub unit: String,
    pub reset_description: String,
}

impl UsageLimit {
    pub fn percent_window(label: impl Into<String>, used: f64, reset_description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            used,
            total: 100.0,
            unit: "%".to_string(),
            reset_description: reset_description.into(),
        }
    }

    /// `0.0` if `total <= 0`, else `used/total*100`. Intentionally
    /// unclamped: an out-of-range value here is an acquisition bug, not
    /// something to paper over.
    pub fn percent(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            (self.used / self.total) * 100.0
        }
    }

    /// Render-time clamp of [`Self::percent`], used only for display.
    pub fn percent_clamped(&self) -> f64 {
        self.percent().clamp(0.0, 100.0)
    }
}

/// An ordered, provider-defined sequence of quota windows plus the time
/// they were acquired. Order is stable across a provider's lifetime; the
/// first element is the primary/session window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub limits: Vec<UsageLimit>,
    pub timestamp: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn empty() -> Self {
        Self {
            limits: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn new(limits: Vec<UsageLimit>) -> Self {
        Self {
            limits,
            timestamp: Utc::now(),
        }
    }
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Uniform contract every vendor-specific provider implements. Providers
/// never throw to callers: every failure taxonomy in the error-handling
/// design surfaces only as `state() == ProviderState::Error`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Start (or ignore, if one is already running) an asynchronous
    /// acquisition. Never blocks the caller beyond the await point itself.
    async fn refresh(&self);

    /// Last known usage; defined even before the first refresh (empty).
    fn snapshot(&self) -> UsageSnapshot;

    fn state(&self) -> ProviderState;

    fn id(&self) -> ProviderId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Change notifications: fires whenever snapshot or state changes.
    fn subscribe(&self) -> watch::Receiver<(ProviderState, UsageSnapshot)>;
}

/// Shared bookkeeping every concrete provider embeds: the published
/// `(state, snapshot)` pair and the watch channel observers subscribe to.
///
/// This is the only place a provider touches anything resembling shared
/// mutable state, and `watch::Sender` is a channel primitive rather than
/// a `Mutex<ProviderState>` a provider would have to reason about itself.
pub(crate) struct ProviderCore {
    id: ProviderId,
    tx: watch::Sender<(ProviderState, UsageSnapshot)>,
}

impl ProviderCore {
    pub(crate) fn new(id: ProviderId) -> Self {
        let (tx, _rx) = watch::channel((ProviderState::Active, UsageSnapshot::empty()));
        Self { id, tx }
    }

    pub(crate) fn id(&self) -> ProviderId {
        self.id
    }

    pub(crate) fn snapshot(&self) -> UsageSnapshot {
        self.tx.borrow().1.clone()
    }

    pub(crate) fn state(&self) -> ProviderState {
        self.tx.borrow().0
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<(ProviderState, UsageSnapshot)> {
        self.tx.subscribe()
    }

    /// Record a successful refresh: state becomes `Active`, snapshot is
    /// replaced, and subscribers observe both changes atomically.
    pub(crate) fn publish_active(&self, snapshot: UsageSnapshot) {
        let _ = self.tx.send((ProviderState::Active, snapshot));
    }

    /// Record a failed refresh: state becomes `Error`, the previous
    /// snapshot is retained verbatim (invariant 4 of the data model).
    pub(crate) fn publish_error(&self) {
        self.tx.send_modify(|(state, _snapshot)| {
            *state = ProviderState::Error;
        });
    }
}

/// Holds the four concrete providers in a fixed canonical order. No
/// dynamic add/remove: the set of vendors this crate supports is closed.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: vec![
                Arc::new(CodexProvider::new()),
                Arc::new(ClaudeProvider::new()),
                Arc::new(GeminiProvider::new()),
                Arc::new(AntigravityProvider::new()),
            ],
        }
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn provider(&self, id: ProviderId) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_all_four_providers_in_order() {
        let registry = ProviderRegistry::new();
        let ids: Vec<ProviderId> = registry.providers().iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![
                ProviderId::Codex,
                ProviderId::Claude,
                ProviderId::Gemini,
                ProviderId::Antigravity,
            ]
        );
    }

    #[test]
    fn registry_lookup_by_id() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.provider(ProviderId::Gemini).map(|p| p.id()),
            Some(ProviderId::Gemini)
        );
    }

    #[test]
    fn percent_is_zero_when_total_is_zero() {
        let limit = UsageLimit {
            label: "Session".to_string(),
            used: 10.0,
            total: 0.0,
            unit: "%".to_string(),
            reset_description: String::new(),
        };
        assert_eq!(limit.percent(), 0.0);
    }

    #[test]
    fn percent_matches_used_over_total() {
        let limit = UsageLimit::percent_window("Session", 42.0, "");
        assert_eq!(limit.percent(), 42.0);
    }

    #[test]
    fn percent_clamped_caps_out_of_range_values() {
        let limit = UsageLimit {
            label: "Session".to_string(),
            used: 180.0,
            total: 100.0,
            unit: "%".to_string(),
            reset_description: String::new(),
        };
        assert_eq!(limit.percent(), 180.0);
        assert_eq!(limit.percent_clamped(), 100.0);
    }

    #[tokio::test]
    async fn provider_core_starts_active_with_empty_snapshot() {
        let core = ProviderCore::new(ProviderId::Codex);
        assert_eq!(core.state(), ProviderState::Active);
        assert!(core.snapshot().limits.is_empty());
    }

    #[tokio::test]
    async fn provider_core_error_retains_previous_snapshot() {
        let core = ProviderCore::new(ProviderId::Codex);
        let snapshot = UsageSnapshot::new(vec![UsageLimit::percent_window("Session", 10.0, "")]);
        core.publish_active(snapshot.clone());
        core.publish_error();

        assert_eq!(core.state(), ProviderState::Error);
        assert_eq!(core.snapshot().limits, snapshot.limits);
    }
}
