use std::sync::Arc;

use anyhow::{bail, Context, Result};
use incubar::config::Config;
use incubar::logging::init_logging;
use incubar::providers::{ProviderId, ProviderRegistry, ProviderState, UsageSnapshot};
use incubar::scheduler::run_scheduler;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug)]
struct CliArgs {
    command: String,
    format: OutputFormat,
    provider: Option<String>,
    pretty: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderPayload {
    provider: String,
    state: String,
    limits: Vec<LimitPayload>,
    updated_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitPayload {
    label: String,
    used: f64,
    total: f64,
    unit: String,
    percent: f64,
    reset_description: String,
}

#[tokio::main]
async fn main() {
    let args = parse_args(std::env::args().skip(1).collect());
    if args.command == "--help" || args.command == "-h" {
        print_help();
        return;
    }
    if args.command == "--version" || args.command == "-V" {
        println!("incubar {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_logging();

    let result = match args.command.as_str() {
        "status" => run_status(args).await,
        "watch" => run_watch(args).await,
        _ => bail_unknown_command(&args.command),
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn bail_unknown_command(command: &str) -> Result<()> {
    bail!("Unknown command: {command}. Use --help for usage.")
}

fn parse_args(mut argv: Vec<String>) -> CliArgs {
    let mut format = OutputFormat::Text;
    let mut pretty = false;
    let mut provider = None;
    let mut command = String::new();
    let mut json_output = false;

    if let Some(first) = argv.first() {
        if !first.starts_with('-') {
            command = argv.remove(0);
        }
    }

    if command.is_empty() {
        command = "status".to_string();
    }

    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" => {
                if let Some(value) = iter.next() {
                    if value == "json" {
                        format = OutputFormat::Json;
                    } else if value == "text" {
                        format = OutputFormat::Text;
                    }
                }
            }
            "--json" => {
                format = OutputFormat::Json;
                json_output = true;
            }
            "--pretty" => pretty = true,
            "--provider" => provider = iter.next(),
            "--help" | "-h" | "--version" | "-V" => {
                command = arg;
                break;
            }
            _ => {}
        }
    }

    CliArgs {
        command,
        format,
        provider,
        pretty: pretty || json_output,
    }
}

async fn run_status(args: CliArgs) -> Result<()> {
    let providers = select_providers(args.provider.as_deref())?;
    let registry = ProviderRegistry::new();

    let mut payloads = Vec::new();
    let mut sections = Vec::new();

    for provider_id in providers {
        let provider = registry
            .provider(provider_id)
            .with_context(|| format!("provider {} is not registered", provider_id.name()))?;
        provider.refresh().await;

        let payload = to_payload(provider_id, provider.state(), provider.snapshot());
        match args.format {
            OutputFormat::Text => sections.push(render_status_text(&payload)),
            OutputFormat::Json => payloads.push(payload),
        }
    }

    match args.format {
        OutputFormat::Text => {
            if !sections.is_empty() {
                println!("{}", sections.join("\n\n"));
            }
        }
        OutputFormat::Json => print_json(&payloads, args.pretty)?,
    }

    Ok(())
}

async fn run_watch(_args: CliArgs) -> Result<()> {
    let registry = Arc::new(ProviderRegistry::new());
    let config = Config::from_env();
    tracing::info!(interval = ?config.refresh_interval, "starting watch loop");

    for provider in registry.providers() {
        if !config.is_enabled(provider.id()) {
            tracing::info!(provider = provider.name(), "provider disabled, not watching");
            continue;
        }

        let mut rx = provider.subscribe();
        let name = provider.name();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let (state, snapshot) = rx.borrow().clone();
                tracing::info!(provider = name, state = ?state, limits = snapshot.limits.len(), "dataChanged");
            }
        });
    }

    run_scheduler(registry, config).await;
    Ok(())
}

fn to_payload(id: ProviderId, state: ProviderState, snapshot: UsageSnapshot) -> ProviderPayload {
    ProviderPayload {
        provider: id.name().to_string(),
        state: state_label(state).to_string(),
        limits: snapshot
            .limits
            .iter()
            .map(|limit| LimitPayload {
                label: limit.label.clone(),
                used: limit.used,
                total: limit.total,
                unit: limit.unit.clone(),
                percent: limit.percent_clamped(),
                reset_description: limit.reset_description.clone(),
            })
            .collect(),
        updated_at: snapshot.timestamp.to_rfc3339(),
    }
}

fn render_status_text(payload: &ProviderPayload) -> String {
    let mut lines = Vec::new();
    lines.push(format!("== {} ==", payload.provider));
    lines.push(format!("State: {}", payload.state));
    if payload.limits.is_empty() {
        lines.push("No usage data yet".to_string());
    } else {
        for limit in &payload.limits {
            let mut line = format!("{}: {:.1}%", limit.label, limit.percent);
            if !limit.reset_description.is_empty() {
                line.push_str(" - ");
                line.push_str(&limit.reset_description);
            }
            lines.push(line);
        }
    }
    lines.push(format!("Updated: {}", payload.updated_at));
    lines.join("\n")
}

fn print_json<T: Serialize>(payload: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(payload)
    } else {
        serde_json::to_string(payload)
    }
    .context("failed to serialize status payload as JSON")?;
    println!("{output}");
    Ok(())
}

fn select_providers(provider: Option<&str>) -> Result<Vec<ProviderId>> {
    match provider {
        Some("all") | None => Ok(vec![
            ProviderId::Codex,
            ProviderId::Claude,
            ProviderId::Gemini,
            ProviderId::Antigravity,
        ]),
        Some(value) => Ok(vec![parse_provider(value)?]),
    }
}

fn parse_provider(value: &str) -> Result<ProviderId> {
    match value {
        "codex" => Ok(ProviderId::Codex),
        "claude" => Ok(ProviderId::Claude),
        "gemini" => Ok(ProviderId::Gemini),
        "antigravity" => Ok(ProviderId::Antigravity),
        _ => bail!("Unknown provider: {value}"),
    }
}

fn state_label(state: ProviderState) -> &'static str {
    match state {
        ProviderState::Active => "active",
        ProviderState::Error => "error",
        ProviderState::Stale => "stale",
    }
}

fn print_help() {
    println!(
        "incubar {}\n\nUsage:\n  incubar status [--format text|json] [--provider <id|all>] [--pretty]\n  incubar watch\n\nCommands:\n  status  Refresh every provider once and print its usage snapshot\n  watch   Run the periodic scheduler and log dataChanged events\n\nFlags:\n  --format <text|json>  Output format for status\n  --json               Shortcut for --format json\n  --pretty             Pretty-print JSON output\n  --provider <id|all>  Provider to query (codex|claude|gemini|antigravity|all)\n  -h, --help           Show help\n  -V, --version        Show version",
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_with_json_flag() {
        let args = parse_args(vec!["status".to_string(), "--json".to_string()]);
        assert_eq!(args.command, "status");
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.pretty);
    }

    #[test]
    fn defaults_to_status_when_no_command_given() {
        let args = parse_args(vec!["--provider".to_string(), "codex".to_string()]);
        assert_eq!(args.command, "status");
        assert_eq!(args.provider.as_deref(), Some("codex"));
    }

    #[test]
    fn select_providers_all_returns_fixed_order() {
        let providers = select_providers(None).unwrap();
        assert_eq!(
            providers,
            vec![
                ProviderId::Codex,
                ProviderId::Claude,
                ProviderId::Gemini,
                ProviderId::Antigravity
            ]
        );
    }

    #[test]
    fn select_providers_rejects_unknown_name() {
        assert!(select_providers(Some("unknown-vendor")).is_err());
    }
}
