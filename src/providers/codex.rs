//! Drives the Codex CLI as a long-lived subprocess over JSON-RPC through
//! an `initialize -> initialized -> account/rateLimits/read` handshake,
//! then terminates it.

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tokio::sync::Mutex;

use super::json_rpc::JsonRpcChannel;
use super::{Provider, ProviderCore, ProviderId, ProviderState, UsageLimit, UsageSnapshot};
use crate::error::ProviderError;

const CODEX_BINARY: &str = "codex";
const CLIENT_NAME: &str = "incubar";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Internal handshake phase. Kept as a tagged value (not boolean flags)
/// so a re-entrant `refresh()` call is a single match arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodexPhase {
    Idle,
    Starting,
    Initializing,
    FetchingLimits,
    Finished,
}

pub struct CodexProvider {
    core: ProviderCore,
    phase: Mutex<CodexPhase>,
}

impl CodexProvider {
    pub fn new() -> Self {
        Self {
            core: ProviderCore::new(ProviderId::Codex),
            phase: Mutex::new(CodexPhase::Idle),
        }
    }

    async fn try_claim(&self) -> bool {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, CodexPhase::Idle | CodexPhase::Finished) {
            return false;
        }
        *phase = CodexPhase::Starting;
        true
    }

    async fn set_phase(&self, phase: CodexPhase) {
        *self.phase.lock().await = phase;
    }

    async fn run_handshake(&self) -> Result<UsageSnapshot, ProviderError> {
        let channel = JsonRpcChannel::spawn(
            CODEX_BINARY,
            &["-s", "read-only", "-a", "untrusted", "app-server"],
        )
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "failed to spawn codex app-server");
            ProviderError::BinaryMissing(CODEX_BINARY.to_string())
        })?;

        self.set_phase(CodexPhase::Initializing).await;

        channel
            .request(
                "initialize",
                json!({"clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION}}),
            )
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "codex initialize handshake failed");
                ProviderError::Protocol(err.to_string())
            })?;

        channel
            .notify("initialized", json!({}))
            .await
            .map_err(|err| ProviderError::Protocol(err.to_string()))?;

        self.set_phase(CodexPhase::FetchingLimits).await;

        let result = channel
            .request("account/rateLimits/read", json!({}))
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "codex rateLimits/read failed");
                ProviderError::Protocol(err.to_string())
            })?;

        channel.terminate().await;
        self.set_phase(CodexPhase::Finished).await;

        parse_rate_limits(&result)
            .ok_or_else(|| ProviderError::ParseMiss("malformed rateLimits response".to_string()))
    }
}

impl Default for CodexProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rate_limits(result: &serde_json::Value) -> Option<UsageSnapshot> {
    let rate_limits = result.get("rateLimits")?;
    let mut limits = Vec::with_capacity(2);

    if let Some(primary) = rate_limits.get("primary") {
        limits.push(window_from("Session", primary)?);
    }
    if let Some(secondary) = rate_limits.get("secondary") {
        limits.push(window_from("Weekly", secondary)?);
    }

    if limits.is_empty() {
        return None;
    }
    Some(UsageSnapshot::new(limits))
}

fn window_from(label: &str, window: &serde_json::Value) -> Option<UsageLimit> {
    let used = window.get("usedPercent")?.as_f64()?;
    let reset_description = window
        .get("resetDescription")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Some(UsageLimit::percent_window(label, used, reset_description))
}

#[async_trait]
impl Provider for CodexProvider {
    async fn refresh(&self) {
        if !self.try_claim().await {
            return;
        }

        match self.run_handshake().await {
            Ok(snapshot) => self.core.publish_active(snapshot),
            Err(_) => self.core.publish_error(),
        }

        // Whether the handshake succeeded or failed, the provider is free
        // to accept another refresh: Error is never terminal.
        self.set_phase(CodexPhase::Idle).await;
    }

    fn snapshot(&self) -> UsageSnapshot {
        self.core.snapshot()
    }

    fn state(&self) -> ProviderState {
        self.core.state()
    }

    fn id(&self) -> ProviderId {
        self.core.id()
    }

    fn subscribe(&self) -> watch::Receiver<(ProviderState, UsageSnapshot)> {
        self.core.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_session_and_weekly_windows_in_order() {
        let result = json!({
            "rateLimits": {
                "primary": {"usedPercent": 37.5, "resetDescription": "Resets in 3h"},
                "secondary": {"usedPercent": 12.0, "resetDescription": "Resets Monday"}
            }
        });

        let snapshot = parse_rate_limits(&result).expect("snapshot");
        assert_eq!(snapshot.limits.len(), 2);
        assert_eq!(snapshot.limits[0].label, "Session");
        assert_eq!(snapshot.limits[0].used, 37.5);
        assert_eq!(snapshot.limits[0].reset_description, "Resets in 3h");
        assert_eq!(snapshot.limits[1].label, "Weekly");
        assert_eq!(snapshot.limits[1].used, 12.0);
        assert_eq!(snapshot.limits[1].reset_description, "Resets Monday");
    }

    #[test]
    fn missing_rate_limits_field_is_rejected() {
        let result = json!({"unrelated": true});
        assert!(parse_rate_limits(&result).is_none());
    }

    #[tokio::test]
    async fn reentrant_refresh_is_a_no_op_while_running() {
        let provider = CodexProvider::new();
        assert!(provider.try_claim().await);
        // A second claim attempt while the first is "in flight" must fail.
        assert!(!provider.try_claim().await);
        provider.set_phase(CodexPhase::Idle).await;
        assert!(provider.try_claim().await);
    }

    #[tokio::test]
    async fn error_is_never_terminal() {
        let provider = CodexProvider::new();
        provider.core.publish_error();
        assert_eq!(provider.state(), ProviderState::Error);
        // Phase resets to Idle after any outcome, so refresh can run again.
        assert!(provider.try_claim().await);
    }
}
