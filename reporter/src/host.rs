use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use smartplug_common::BatteryReport;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    battery::{self, POWER_SUPPLY_ROOT},
    games::{self, ProcessScanner},
};

const IDENTIFIER_HEADER: &str = "X-Computer-Name";
/// Covers a controller query plus a command at their default 5s timeouts,
/// and one re-plan after an intent flip.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
struct ReporterConfig {
    controller_url: String,
    computer_name: Option<String>,
    interval: Duration,
    games: Vec<String>,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct UpdateReply {
    intent: Option<String>,
    plug: Option<String>,
    #[serde(rename = "commandError")]
    command_error: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ReporterConfig::from_lookup(|name| std::env::var(name).ok())?;
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to build http client")?;

    info!(
        "battery reporter started: {} every {}s as {}",
        config.update_url(),
        config.interval.as_secs(),
        config.computer_name.as_deref().unwrap_or("<client ip>")
    );

    let mut scanner = ProcessScanner::new();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, stopping reporter");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(err) = report_once(&client, &config, &mut scanner).await {
                    warn!("battery report failed: {err:#}");
                }
            }
        }
    }
}

async fn report_once(
    client: &reqwest::Client,
    config: &ReporterConfig,
    scanner: &mut ProcessScanner,
) -> anyhow::Result<()> {
    let Some(reading) = battery::read(Path::new(POWER_SUPPLY_ROOT)).await? else {
        warn!("no battery detected, skipping report");
        return Ok(());
    };

    let is_gaming = if config.games.is_empty() {
        false
    } else {
        let running = scanner.running();
        match games::find_game(&running, &config.games) {
            Some(game) => {
                debug!("game running: {game}");
                true
            }
            None => false,
        }
    };

    let report = BatteryReport {
        battery_percent: reading.percent,
        is_charging: reading.power_plugged,
        is_gaming,
    };
    info!(
        battery = reading.percent,
        plugged = reading.power_plugged,
        gaming = is_gaming,
        "battery {}",
        reading.status_label()
    );

    let mut request = client.post(config.update_url()).json(&report);
    if let Some(name) = &config.computer_name {
        request = request.header(IDENTIFIER_HEADER, name);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to reach controller at {}", config.controller_url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("controller rejected report ({status}): {body}"));
    }

    let reply: UpdateReply = response
        .json()
        .await
        .context("invalid controller response")?;
    info!(
        intent = reply.intent.as_deref().unwrap_or("UNKNOWN"),
        plug = reply.plug.as_deref().unwrap_or("UNKNOWN"),
        "report accepted"
    );
    if let Some(err) = reply.command_error {
        warn!("controller could not switch the plug: {err}");
    }
    Ok(())
}

impl ReporterConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let controller_url = lookup("CONTROLLER_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());

        let computer_name = lookup("COMPUTER_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let interval =
            seconds_var(&lookup, "REPORT_INTERVAL")?.unwrap_or(Duration::from_secs(30));
        let request_timeout =
            seconds_var(&lookup, "REQUEST_TIMEOUT")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let games = lookup("GAME_PROCESSES")
            .map(|raw| games::parse_game_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            controller_url,
            computer_name,
            interval,
            games,
            request_timeout,
        })
    }

    fn update_url(&self) -> String {
        format!("{}/update", self.controller_url)
    }
}

/// Whole seconds, at least one.
fn seconds_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<Duration>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let secs = raw
        .trim()
        .parse::<u64>()
        .map_err(|err| anyhow!("invalid {name} value '{raw}': {err}"))?;
    if secs == 0 {
        return Err(anyhow!("{name} must be at least 1 second"));
    }
    Ok(Some(Duration::from_secs(secs)))
}
