use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use smartplug_common::{BatteryReport, PlugDriver, Policy, RuntimeConfig};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::{Controller, ReportRejection},
    plug::{MqttPlug, PlugPort, SimulatedPlug},
    settings,
    store::StatusStore,
    watchdog,
};

const IDENTIFIER_HEADER: &str = "x-computer-name";

#[derive(Clone)]
struct AppState {
    controller: Controller,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct UnknownDeviceBody {
    status: &'static str,
    message: String,
    available_mappings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateResponse {
    status: &'static str,
    message: String,
    intent: Option<&'static str>,
    plug: &'static str,
    #[serde(rename = "commandError", skip_serializing_if = "Option::is_none")]
    command_error: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = settings::load().await?;
    info!(
        "battery thresholds: on <= {}%, off >= {}%; ping timeout {}s",
        config.thresholds.low(),
        config.thresholds.high(),
        config.engine.ping_timeout_ms / 1_000
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let port = build_port(&config, cancel.clone());
    let controller = Controller::new(
        StatusStore::new(&config.devices, Policy::from_config(&config), monotonic_ms()),
        Dispatcher::new(port, &config.engine),
    );

    let watchdog = watchdog::spawn(
        controller.clone(),
        Duration::from_millis(config.engine.watchdog_interval_ms),
        cancel.clone(),
    );

    let app = router(AppState { controller });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("controller server failed")?;

    cancel.cancel();
    let grace = Duration::from_millis(config.engine.shutdown_grace_ms);
    if tokio::time::timeout(grace, watchdog).await.is_err() {
        warn!("watchdog did not stop within {}ms, abandoning it", grace.as_millis());
    }

    info!("controller stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/update", post(handle_update))
        .route("/status", get(handle_get_statuses))
        .route("/status/{identifier}", get(handle_get_status))
        // Dashboards read /status from other origins.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn build_port(config: &RuntimeConfig, cancel: CancellationToken) -> Arc<dyn PlugPort> {
    match config.driver {
        PlugDriver::Mqtt => Arc::new(MqttPlug::connect(
            &config.mqtt,
            config.devices.values(),
            cancel,
        )),
        PlugDriver::Simulated => {
            warn!("using simulated plug driver, no real plugs will be switched");
            Arc::new(SimulatedPlug::new())
        }
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    warn!(error = %err, "failed to register SIGTERM handler");
                    let _ = signal::ctrl_c().await;
                    info!("received Ctrl+C, initiating shutdown");
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                _ = signal::ctrl_c() => info!("received Ctrl+C, initiating shutdown"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal::ctrl_c().await;
            info!("received Ctrl+C, initiating shutdown");
        }
        cancel.cancel();
    });
}

async fn handle_update(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(report): Json<BatteryReport>,
) -> impl IntoResponse {
    let source = peer.ip().to_string();
    let identifier = headers
        .get(IDENTIFIER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| source.clone());

    let result = state
        .controller
        .report_status(&identifier, &report, &source, monotonic_ms(), Utc::now())
        .await;

    match result {
        Ok(result) => {
            info!(
                device = %result.identifier,
                battery = report.battery_percent,
                charging = report.is_charging,
                gaming = report.is_gaming,
                "status update"
            );
            Json(UpdateResponse {
                status: "success",
                message: format!("status updated for {}", result.identifier),
                intent: result.intent.map(|intent| intent.as_str()),
                plug: result.known_state.as_str(),
                command_error: result.command.err().map(|err| err.to_string()),
            })
            .into_response()
        }
        Err(ReportRejection::UnknownIdentifier(err)) => {
            warn!("rejected update from {source}: {err}");
            (
                StatusCode::NOT_FOUND,
                Json(UnknownDeviceBody {
                    status: "error",
                    message: err.to_string(),
                    available_mappings: state.controller.store().identifiers(),
                }),
            )
                .into_response()
        }
        Err(ReportRejection::Invalid(err)) => {
            warn!("rejected update for {identifier}: {err}");
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

async fn handle_get_statuses(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.statuses(monotonic_ms()).await)
}

async fn handle_get_status(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> impl IntoResponse {
    match state.controller.status(&identifier, monotonic_ms()).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::{body::to_bytes, http::HeaderValue, response::Response};
    use serde_json::Value;
    use smartplug_common::{DeviceConfig, DeviceIntent, EngineConfig, Thresholds};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    fn state(plug: Arc<SimulatedPlug>) -> AppState {
        let mut devices = BTreeMap::new();
        devices.insert(
            "GAMING-PC".to_string(),
            DeviceConfig {
                device_id: "plug-1".to_string(),
                device_ip: "10.0.0.5".to_string(),
                topic: None,
                dp_id: 1,
            },
        );
        let policy = Policy {
            thresholds: Thresholds::default(),
            ping_timeout_ms: 300_000,
        };
        AppState {
            controller: Controller::new(
                StatusStore::new(&devices, policy, monotonic_ms()),
                Dispatcher::new(plug, &EngineConfig::default()),
            ),
        }
    }

    fn peer() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 50_000)))
    }

    fn named(name: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IDENTIFIER_HEADER, HeaderValue::from_str(name).expect("header"));
        headers
    }

    fn report(percent: f32) -> Json<BatteryReport> {
        Json(BatteryReport {
            battery_percent: percent,
            is_charging: false,
            is_gaming: false,
        })
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn update_switches_plug_and_reports_state() {
        let plug = Arc::new(SimulatedPlug::new());
        let state = state(plug.clone());

        let response = handle_update(State(state), peer(), named("gaming-pc"), report(12.0))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["intent"], "ON");
        assert_eq!(body["plug"], "ON");
        assert_eq!(plug.state("plug-1"), Some(DeviceIntent::On));
    }

    #[tokio::test]
    async fn unknown_identifier_lists_mappings() {
        let state = state(Arc::new(SimulatedPlug::new()));

        // No header: falls back to the peer address, which is not mapped.
        let response = handle_update(State(state), peer(), HeaderMap::new(), report(12.0))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .is_some_and(|message| message.contains("192.168.1.20")));
        assert_eq!(body["available_mappings"][0], "GAMING-PC");
    }

    #[tokio::test]
    async fn status_is_readable_cross_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state(Arc::new(SimulatedPlug::new())));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(
                b"OPTIONS /status HTTP/1.1\r\nHost: controller\r\n\
                  Origin: http://dashboard.local\r\n\
                  Access-Control-Request-Method: GET\r\nConnection: close\r\n\r\n",
            )
            .await
            .expect("write preflight");
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read response");
        let response = String::from_utf8_lossy(&raw).to_ascii_lowercase();

        assert!(response.starts_with("http/1.1 200"), "{response}");
        assert!(response.contains("access-control-allow-origin: *"), "{response}");
    }

    #[tokio::test]
    async fn out_of_range_percent_is_bad_request() {
        let plug = Arc::new(SimulatedPlug::new());
        let state = state(plug.clone());

        let response = handle_update(State(state), peer(), named("GAMING-PC"), report(101.0))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(plug.query_count(), 0);
    }

    #[tokio::test]
    async fn status_endpoints_expose_device_view() {
        let state = state(Arc::new(SimulatedPlug::new()));

        let response = handle_get_status(State(state.clone()), Path("gaming-pc".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deviceId"], "plug-1");
        assert_eq!(body["knownState"], "UNKNOWN");
        assert_eq!(body["activity"], "NEVER_REPORTED");

        let response = handle_get_status(State(state.clone()), Path("laptop".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(handle_get_statuses(State(state)).await.into_response()).await;
        assert!(body.get("GAMING-PC").is_some());
    }
}
