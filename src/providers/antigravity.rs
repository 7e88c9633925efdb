//! Enumerates running processes for the Antigravity language server, parses
//! its command-line flags for a CSRF token and candidate ports, then probes
//! those ports over self-signed HTTPS with protocol-specific headers.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::sync::watch;

use super::{Provider, ProviderCore, ProviderId, ProviderState, UsageLimit, UsageSnapshot};
use crate::error::ProviderError;

const PROCESS_NAME_HINT: &str = "language_server";
const USER_STATUS_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUserStatus";

static CSRF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--csrf_token[=\s]+(\S+)").unwrap());
static EXT_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--extension_server_port[=\s]+(\d+)").unwrap());
static LISTEN_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\d+)\s+\(LISTEN\)").unwrap());

#[derive(Debug, Clone, PartialEq)]
struct ProcessInfo {
    pid: u32,
    csrf_token: String,
    extension_port: Option<u16>,
}

pub struct AntigravityProvider {
    core: ProviderCore,
    busy: AtomicBool,
}

impl AntigravityProvider {
    pub fn new() -> Self {
        Self {
            core: ProviderCore::new(ProviderId::Antigravity),
            busy: AtomicBool::new(false),
        }
    }

    async fn scan_process(&self) -> Result<ProcessInfo, ProviderError> {
        let output = Command::new("ps")
            .args(["-ax", "-o", "pid=,command="])
            .output()
            .await
            .map_err(|err| ProviderError::BinaryMissing(format!("ps ({err})")))?;

        let text = String::from_utf8_lossy(&output.stdout);
        find_process(&text).ok_or_else(|| {
            ProviderError::NotFound("antigravity language server process not found".to_string())
        })
    }

    async fn discover_ports(&self, info: &ProcessInfo) -> Result<Vec<u16>, ProviderError> {
        let output = Command::new("lsof")
            .args([
                "-nP",
                "-iTCP",
                "-sTCP:LISTEN",
                "-a",
                "-p",
                &info.pid.to_string(),
            ])
            .output()
            .await;

        let ports = match output {
            Ok(output) => parse_listening_ports(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => Vec::new(),
        };

        if !ports.is_empty() {
            return Ok(ports);
        }
        if let Some(extension_port) = info.extension_port {
            return Ok(vec![extension_port]);
        }
        Err(ProviderError::NotFound(
            "no listening ports found and no extension port known".to_string(),
        ))
    }

    async fn probe(&self, port: u16, csrf_token: &str) -> Result<UsageSnapshot, ProviderError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(ProviderError::Network)?;

        let url = format!("https://127.0.0.1:{port}{USER_STATUS_PATH}");
        let body = serde_json::json!({
            "metadata": {
                "ideName": "antigravity",
                "extensionName": "antigravity",
                "ideVersion": "unknown",
                "locale": "en",
            }
        });

        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Codeium-Csrf-Token", csrf_token)
            .header("Connect-Protocol-Version", "1")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::Network)?;

        if !response.status().is_success() {
            return Err(ProviderError::Network(response.error_for_status().unwrap_err()));
        }

        let json: Value = response
            .json()
            .await
            .map_err(ProviderError::Network)?;

        select_limits(&json)
            .ok_or_else(|| ProviderError::ParseMiss("no usable quota configs in response".to_string()))
    }

    async fn run_refresh(&self) -> Result<UsageSnapshot, ProviderError> {
        let info = self.scan_process().await?;
        let ports = self.discover_ports(&info).await?;
        let port = *ports.first().expect("discover_ports never returns empty Ok");
        self.probe(port, &info.csrf_token).await
    }
}

impl Default for AntigravityProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn find_process(ps_output: &str) -> Option<ProcessInfo> {
    for line in ps_output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.contains(PROCESS_NAME_HINT) {
            continue;
        }
        if !trimmed.contains("--app_data_dir") || !trimmed.contains("antigravity") {
            continue;
        }

        let Some((pid_str, command_line)) = trimmed.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        let Some(csrf_token) = CSRF_RE.captures(command_line).map(|c| c[1].to_string()) else {
            continue;
        };
        let extension_port = EXT_PORT_RE
            .captures(command_line)
            .and_then(|c| c[1].parse::<u16>().ok());

        return Some(ProcessInfo {
            pid,
            csrf_token,
            extension_port,
        });
    }
    None
}

fn parse_listening_ports(lsof_output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = lsof_output
        .lines()
        .filter_map(|line| LISTEN_PORT_RE.captures(line))
        .filter_map(|c| c[1].parse::<u16>().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Select up to three quota configs by case-insensitive label substring
/// match, in the fixed order Claude, Pro, Flash.
fn select_limits(json: &Value) -> Option<UsageSnapshot> {
    let configs = json
        .get("userStatus")?
        .get("cascadeModelConfigData")?
        .get("clientModelConfigs")?
        .as_array()?;

    let entries: Vec<(String, f64)> = configs
        .iter()
        .filter_map(|config| {
            let label = config.get("label")?.as_str()?.to_string();
            let fraction = config.get("quotaInfo")?.get("remainingFraction")?.as_f64()?;
            Some((label, fraction))
        })
        .collect();

    let find = |want: &str, exclude: Option<&str>| {
        entries.iter().find(|(label, _)| {
            let lower = label.to_lowercase();
            lower.contains(want) && exclude.map(|ex| !lower.contains(ex)).unwrap_or(true)
        })
    };

    let mut limits = Vec::with_capacity(3);
    if let Some((_, fraction)) = find("claude", Some("thinking")) {
        limits.push(UsageLimit::percent_window("Claude", (1.0 - fraction) * 100.0, ""));
    }
    if let Some((_, fraction)) = find("pro", Some("low")) {
        limits.push(UsageLimit::percent_window("Pro", (1.0 - fraction) * 100.0, ""));
    }
    if let Some((_, fraction)) = find("flash", None) {
        limits.push(UsageLimit::percent_window("Flash", (1.0 - fraction) * 100.0, ""));
    }

    if limits.is_empty() {
        return None;
    }
    Some(UsageSnapshot::new(limits))
}

#[async_trait]
impl Provider for AntigravityProvider {
    async fn refresh(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.run_refresh().await {
            Ok(snapshot) => self.core.publish_active(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "antigravity refresh failed");
                self.core.publish_error();
            }
        }

        self.busy.store(false, Ordering::SeqCst);
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
    fn finds_process_with_csrf_token_and_extension_port() {
        let ps_output = "12345 /opt/antigravity/language_server_linux_x64 --app_data_dir=/x --csrf_token ABC123 --extension_server_port=54321";
        let info = find_process(ps_output).expect("process info");
        assert_eq!(info.pid, 12345);
        assert_eq!(info.csrf_token, "ABC123");
        assert_eq!(info.extension_port, Some(54321));
    }

    #[test]
    fn ignores_unrelated_process_lines() {
        let ps_output = "1 /sbin/init\n2 /usr/bin/language_server_linux_x64 --no-antigravity-flag";
        assert!(find_process(ps_output).is_none());
    }

    #[test]
    fn parses_and_sorts_listening_ports() {
        let lsof_output = "lang 123 u IPv4 TCP 127.0.0.1:55555 (LISTEN)\nlang 123 u IPv4 TCP 127.0.0.1:54321 (LISTEN)\n";
        assert_eq!(parse_listening_ports(lsof_output), vec![54321, 55555]);
    }

    #[test]
    fn selects_claude_pro_flash_excluding_thinking_and_low() {
        let response = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        {"label": "Claude 3.7", "quotaInfo": {"remainingFraction": 0.9}},
                        {"label": "Claude 3.7 Thinking", "quotaInfo": {"remainingFraction": 0.1}},
                        {"label": "Gemini Pro", "quotaInfo": {"remainingFraction": 0.4}},
                        {"label": "Gemini Flash", "quotaInfo": {"remainingFraction": 0.2}},
                    ]
                }
            }
        });

        let snapshot = select_limits(&response).expect("snapshot");
        assert_eq!(snapshot.limits.len(), 3);
        assert_eq!(snapshot.limits[0].label, "Claude");
        assert_eq!(snapshot.limits[0].used, 10.0);
        assert_eq!(snapshot.limits[1].label, "Pro");
        assert_eq!(snapshot.limits[1].used, 60.0);
        assert_eq!(snapshot.limits[2].label, "Flash");
        assert_eq!(snapshot.limits[2].used, 80.0);
    }

    #[test]
    fn excludes_pro_low_variant() {
        let response = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        {"label": "Gemini Pro Low", "quotaInfo": {"remainingFraction": 0.5}},
                        {"label": "Gemini Flash", "quotaInfo": {"remainingFraction": 0.5}},
                    ]
                }
            }
        });

        let snapshot = select_limits(&response).expect("snapshot");
        assert_eq!(snapshot.limits.len(), 1);
        assert_eq!(snapshot.limits[0].label, "Flash");
    }

    #[tokio::test]
    async fn reentrant_refresh_guard_blocks_second_call() {
        let provider = AntigravityProvider::new();
        assert!(!provider.busy.swap(true, Ordering::SeqCst));
        assert!(provider.busy.swap(true, Ordering::SeqCst));
    }
}
