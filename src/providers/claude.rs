//! Drives the Claude CLI under a pseudo-terminal: waits for the
//! interactive prompt, injects `/usage`, and scrapes ANSI-stripped output
//! for the session/weekly percentage lines.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use super::pty_session::{strip_ansi, PtyEvent, PtySession};
use super::{Provider, ProviderCore, ProviderId, ProviderState, UsageLimit, UsageSnapshot};
use crate::error::ProviderError;

const CLAUDE_BINARY: &str = "claude";
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

static SESSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Current session\s+(\d+)%\s+(used|left)").unwrap());
static WEEKLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Current week\s+\(all models\)\s+(\d+)%\s+(used|left)").unwrap());

pub struct ClaudeProvider {
    core: ProviderCore,
    busy: Mutex<bool>,
}

impl ClaudeProvider {
    pub fn new() -> Self {
        Self {
            core: ProviderCore::new(ProviderId::Claude),
            busy: Mutex::new(false),
        }
    }

    async fn try_claim(&self) -> bool {
        let mut busy = self.busy.lock().await;
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    async fn release(&self) {
        *self.busy.lock().await = false;
    }

    async fn run_session(&self) -> Result<UsageSnapshot, ProviderError> {
        if which::which(CLAUDE_BINARY).is_err() {
            return Err(ProviderError::BinaryMissing(CLAUDE_BINARY.to_string()));
        }

        let (mut session, mut events) = PtySession::start(CLAUDE_BINARY, &[]).map_err(|err| {
            ProviderError::SpawnFailure(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
        })?;

        let mut buffer = String::new();
        let mut sent_usage = false;
        let mut session_limit: Option<UsageLimit> = None;
        let mut weekly_limit: Option<UsageLimit> = None;

        let outcome = timeout(REFRESH_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::DataRead(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        if !sent_usage
                            && (buffer.contains("Ready to code") || buffer.contains('>'))
                        {
                            if session.write(b"/usage\n").is_err() {
                                return Err(ProviderError::Protocol(
                                    "failed to write /usage to claude pty".to_string(),
                                ));
                            }
                            sent_usage = true;
                        }

                        let (session_match, weekly_match) = parse_usage(&buffer);
                        if session_match.is_some() {
                            session_limit = session_match;
                        }
                        if weekly_match.is_some() {
                            weekly_limit = weekly_match;
                        }

                        if session_limit.is_some() && weekly_limit.is_some() {
                            return Ok(());
                        }
                    }
                    PtyEvent::ProcessExited(_) => {
                        return Err(ProviderError::ParseMiss(
                            "claude exited before usage could be read".to_string(),
                        ));
                    }
                }
            }
            Err(ProviderError::ParseMiss(
                "claude pty closed before usage could be read".to_string(),
            ))
        })
        .await
        .unwrap_or_else(|_| {
            Err(ProviderError::ParseMiss(
                "timed out waiting for claude usage output".to_string(),
            ))
        });

        session.close().await;

        outcome?;

        Ok(UsageSnapshot::new(vec![
            session_limit.expect("session checked above"),
            weekly_limit.expect("weekly checked above"),
        ]))
    }
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_usage(buffer: &str) -> (Option<UsageLimit>, Option<UsageLimit>) {
    let stripped = strip_ansi(buffer);
    let session = SESSION_RE
        .captures(&stripped)
        .map(|c| window_from_capture("Session", &c));
    let weekly = WEEKLY_RE
        .captures(&stripped)
        .map(|c| window_from_capture("Weekly", &c));
    (session, weekly)
}

fn window_from_capture(label: &str, captures: &Captures) -> UsageLimit {
    let value: f64 = captures[1].parse().unwrap_or(0.0);
    let used = if captures[2].eq_ignore_ascii_case("left") {
        100.0 - value
    } else {
        value
    };
    UsageLimit::percent_window(label, used, "")
}

#[async_trait]
impl Provider for ClaudeProvider {
    async fn refresh(&self) {
        if !self.try_claim().await {
            return;
        }

        match self.run_session().await {
            Ok(snapshot) => self.core.publish_active(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "claude refresh failed");
                self.core.publish_error();
            }
        }

        self.release().await;
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

    #[test]
    fn parses_ansi_wrapped_session_and_weekly_lines() {
        let chunk = "\x1b[31mCurrent session\x1b[0m   42% used\nCurrent week (all models)   88% left\n";
        let (session, weekly) = parse_usage(chunk);

        let session = session.expect("session");
        assert_eq!(session.label, "Session");
        assert_eq!(session.used, 42.0);

        let weekly = weekly.expect("weekly");
        assert_eq!(weekly.label, "Weekly");
        assert_eq!(weekly.used, 12.0);
    }

    #[test]
    fn used_word_is_stored_directly() {
        let chunk = "Current session   5% used\n";
        let (session, _weekly) = parse_usage(chunk);
        assert_eq!(session.expect("session").used, 5.0);
    }

    #[test]
    fn no_match_returns_none_for_both() {
        let chunk = "Welcome to claude\n> ";
        let (session, weekly) = parse_usage(chunk);
        assert!(session.is_none());
        assert!(weekly.is_none());
    }

    #[tokio::test]
    async fn reentrant_refresh_is_rejected_while_busy() {
        let provider = ClaudeProvider::new();
        assert!(provider.try_claim().await);
        assert!(!provider.try_claim().await);
        provider.release().await;
        assert!(provider.try_claim().await);
    }
}
