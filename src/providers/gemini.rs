//! OAuth-refresh-capable REST client with an on-disk credential cache.
//!
//! Reads `${HOME}/.gemini/oauth_creds.json`, refreshes the access token
//! when it is near expiry, and calls Google's internal quota endpoint.
//! Token refresh writes are atomic (temp file + rename) and preserve every
//! unrelated key already present in the credentials file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use super::{Provider, ProviderCore, ProviderId, ProviderState, UsageLimit, UsageSnapshot};
use crate::error::ProviderError;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const QUOTA_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota";
const CREDENTIALS_RELATIVE_PATH: &str = ".gemini/oauth_creds.json";

// Build-time constants extracted from the vendor CLI. Kept redacted, as
// in the reference application, rather than embedding the literal
// secret-shaped string.
const OAUTH_CLIENT_ID: &str = "REDACTED_GEMINI_OAUTH_CLIENT_ID";
const OAUTH_CLIENT_SECRET: &str = "REDACTED_GEMINI_OAUTH_CLIENT_SECRET";

const EXPIRY_SKEW_MS: i64 = 300_000;

const TARGET_MODELS: [(&str, &str); 2] = [("gemini-2.5-flash", "Flash"), ("gemini-2.5-pro", "Pro")];

#[derive(Debug, Clone, Default)]
struct OAuthCredentials {
    access_token: String,
    refresh_token: Option<String>,
    expiry_epoch_ms: i64,
}

pub struct GeminiProvider {
    core: ProviderCore,
    client: reqwest::Client,
    busy: AtomicBool,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            core: ProviderCore::new(ProviderId::Gemini),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            busy: AtomicBool::new(false),
        }
    }

    fn credentials_path() -> Result<PathBuf, ProviderError> {
        dirs::home_dir()
            .map(|home| home.join(CREDENTIALS_RELATIVE_PATH))
            .ok_or_else(|| ProviderError::NotFound("could not determine home directory".to_string()))
    }

    async fn load_credentials(path: &PathBuf) -> Result<OAuthCredentials, ProviderError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ProviderError::NotFound(format!("failed to read gemini credentials: {err}")))?;
        let json: Value = serde_json::from_str(&content)
            .map_err(|err| ProviderError::Protocol(format!("malformed gemini credentials: {err}")))?;
        let access_token = json
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if access_token.is_empty() {
            return Err(ProviderError::Auth("gemini credentials missing access_token".to_string()));
        }
        Ok(OAuthCredentials {
            access_token,
            refresh_token: json
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            expiry_epoch_ms: json.get("expiry_date").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    /// Read-modify-write the credentials file, touching only the two
    /// known keys and preserving everything else, via temp-file + rename.
    async fn merge_write(path: &PathBuf, access_token: &str, expiry_epoch_ms: i64) -> Result<(), ProviderError> {
        let existing_content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let mut existing: Value =
            serde_json::from_str(&existing_content).unwrap_or_else(|_| serde_json::json!({}));

        existing["access_token"] = serde_json::json!(access_token);
        existing["expiry_date"] = serde_json::json!(expiry_epoch_ms);

        let serialized = serde_json::to_string_pretty(&existing)
            .map_err(|err| ProviderError::Protocol(format!("failed to serialize gemini credentials: {err}")))?;

        let dir = path
            .parent()
            .ok_or_else(|| ProviderError::NotFound("credentials path has no parent".to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| {
            ProviderError::Protocol(format!("failed to create temp credentials file: {err}"))
        })?;
        use std::io::Write;
        tmp.write_all(serialized.as_bytes())
            .map_err(|err| ProviderError::Protocol(format!("failed to write temp credentials file: {err}")))?;
        tmp.persist(path).map_err(|err| {
            ProviderError::Protocol(format!("failed to rename temp credentials file into place: {err}"))
        })?;
        Ok(())
    }

    async fn refresh_access_token(
        &self,
        path: &PathBuf,
        refresh_token: &str,
    ) -> Result<OAuthCredentials, ProviderError> {
        let body = format!(
            "client_id={OAUTH_CLIENT_ID}&client_secret={OAUTH_CLIENT_SECRET}&refresh_token={refresh_token}&grant_type=refresh_token"
        );

        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(ProviderError::Network)?;

        if !response.status().is_success() {
            return Err(ProviderError::Auth(format!("token refresh failed: HTTP {}", response.status())));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(ProviderError::Network)?;

        let expiry_epoch_ms = chrono::Utc::now().timestamp_millis() + (parsed.expires_in * 1000.0) as i64;
        Self::merge_write(path, &parsed.access_token, expiry_epoch_ms).await?;

        Ok(OAuthCredentials {
            access_token: parsed.access_token,
            refresh_token: Some(refresh_token.to_string()),
            expiry_epoch_ms,
        })
    }

    async fn run_refresh(&self) -> Result<UsageSnapshot, ProviderError> {
        let path = Self::credentials_path()?;
        let mut creds = Self::load_credentials(&path).await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        if creds.expiry_epoch_ms > 0 && now_ms > creds.expiry_epoch_ms - EXPIRY_SKEW_MS {
            creds = self.refresh_access_token(&path, &require_refresh_token(&creds)?).await?;
        }

        let mut response = self.fetch_quota(&creds.access_token).await?;

        if response.status().as_u16() == 401 {
            // The cached token was rejected outright (revoked, clock skew,
            // etc). Refresh immediately and retry once rather than writing
            // a sentinel the time-based guard above would never act on.
            creds = self.refresh_access_token(&path, &require_refresh_token(&creds)?).await?;
            response = self.fetch_quota(&creds.access_token).await?;
        }

        if !response.status().is_success() {
            return Err(ProviderError::Network(
                response.error_for_status().unwrap_err(),
            ));
        }

        let json: Value = response
            .json()
            .await
            .map_err(ProviderError::Network)?;

        parse_quota_snapshot(&json)
            .ok_or_else(|| ProviderError::ParseMiss("no usable quota buckets in response".to_string()))
    }

    async fn fetch_quota(&self, access_token: &str) -> Result<reqwest::Response, ProviderError> {
        self.client
            .post(QUOTA_ENDPOINT)
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ProviderError::Network)
    }
}

fn require_refresh_token(creds: &OAuthCredentials) -> Result<String, ProviderError> {
    creds
        .refresh_token
        .clone()
        .ok_or_else(|| ProviderError::Auth("no refresh token available".to_string()))
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: f64,
}

/// Group buckets by `modelId`, keeping the entry with the *highest* used
/// percentage (worst usage across variants of the same model), then
/// filter to the two canonical targets in their fixed label order.
fn parse_quota_snapshot(json: &Value) -> Option<UsageSnapshot> {
    let buckets = json.get("buckets")?.as_array()?;
    if buckets.is_empty() {
        return None;
    }

    let mut worst_used: HashMap<String, f64> = HashMap::new();
    for bucket in buckets {
        let model_id = bucket.get("modelId").and_then(Value::as_str)?.to_string();
        let fraction = match bucket.get("remainingFraction").and_then(Value::as_f64) {
            Some(f) => f,
            None => continue,
        };
        let used = (1.0 - fraction) * 100.0;
        worst_used
            .entry(model_id)
            .and_modify(|existing| {
                if used > *existing {
                    *existing = used;
                }
            })
            .or_insert(used);
    }

    let mut limits = Vec::with_capacity(TARGET_MODELS.len());
    for (model_id, label) in TARGET_MODELS {
        if let Some(&used) = worst_used.get(model_id) {
            limits.push(UsageLimit::percent_window(label, used, ""));
        }
    }

    if limits.is_empty() {
        return None;
    }
    Some(UsageSnapshot::new(limits))
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn refresh(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.run_refresh().await {
            Ok(snapshot) => self.core.publish_active(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "gemini refresh failed");
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
    fn keeps_worst_bucket_per_model_and_orders_flash_then_pro() {
        let response = json!({
            "buckets": [
                {"modelId": "gemini-2.5-flash", "remainingFraction": 0.8},
                {"modelId": "gemini-2.5-flash", "remainingFraction": 0.3},
                {"modelId": "gemini-2.5-pro", "remainingFraction": 0.5},
            ]
        });

        let snapshot = parse_quota_snapshot(&response).expect("snapshot");
        assert_eq!(snapshot.limits.len(), 2);
        assert_eq!(snapshot.limits[0].label, "Flash");
        assert_eq!(snapshot.limits[0].used, 70.0);
        assert_eq!(snapshot.limits[1].label, "Pro");
        assert_eq!(snapshot.limits[1].used, 50.0);
    }

    #[test]
    fn ignores_non_target_models() {
        let response = json!({
            "buckets": [
                {"modelId": "gemini-1.5-flash", "remainingFraction": 0.1},
            ]
        });
        assert!(parse_quota_snapshot(&response).is_none());
    }

    #[test]
    fn empty_buckets_yields_none() {
        let response = json!({"buckets": []});
        assert!(parse_quota_snapshot(&response).is_none());
    }

    #[tokio::test]
    async fn credential_merge_preserves_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        tokio::fs::write(
            &path,
            serde_json::json!({
                "access_token": "OLD",
                "refresh_token": "unchanged-refresh",
                "expiry_date": 1,
                "some_other_field": "keep-me",
            })
            .to_string(),
        )
        .await
        .unwrap();

        GeminiProvider::merge_write(&path, "NEW", 999).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["access_token"], "NEW");
        assert_eq!(value["expiry_date"], 999);
        assert_eq!(value["refresh_token"], "unchanged-refresh");
        assert_eq!(value["some_other_field"], "keep-me");
    }

    #[tokio::test]
    async fn reentrant_refresh_guard_blocks_second_call() {
        let provider = GeminiProvider::new();
        assert!(!provider.busy.swap(true, Ordering::SeqCst));
        assert!(provider.busy.swap(true, Ordering::SeqCst));
        provider.busy.store(false, Ordering::SeqCst);
        assert!(!provider.busy.swap(true, Ordering::SeqCst));
    }
}
