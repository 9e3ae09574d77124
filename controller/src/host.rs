use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use heating_common::{
    EntityId, HeatingEngine, HeatingError, HeatingEvent, HeatingSetup, RuntimeConfig,
    SharedHost,
};

use crate::mqtt::{HostMessage, MqttHost, Topics};

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<HeatingEngine>>,
    dispatch: mpsc::UnboundedSender<HostMessage>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ReapplyResponse {
    room: String,
    queued: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("HEATING_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./heating.json"));
    let mut runtime = load_runtime_config(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());

    let timezone: Tz = runtime
        .timezone
        .parse()
        .map_err(|_| anyhow!("unknown timezone '{}'", runtime.timezone))?;
    let setup = HeatingSetup::assemble(&runtime.heating).context("invalid heating config")?;
    let entities = referenced_entities(&setup);

    let network = &runtime.network;
    let mut mqtt_options = MqttOptions::new(
        network.client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 256);

    let (dispatch, messages) = mpsc::unbounded_channel();
    let host = Arc::new(MqttHost::new(
        mqtt,
        Topics::new(&network.state_prefix, &network.command_prefix),
        timezone,
        &entities,
        dispatch.clone(),
    ));
    spawn_mqtt_loop(host.clone(), eventloop);

    wait_for_entities(
        &host,
        &entities,
        Duration::from_secs(runtime.startup_timeout_secs),
    )
    .await;

    let shared: SharedHost = host.clone();
    let mut engine = HeatingEngine::new(setup, shared).context("failed to build rooms")?;
    engine.start();
    let engine = Arc::new(Mutex::new(engine));
    spawn_dispatch_loop(engine.clone(), messages);

    let app_state = AppState {
        engine: engine.clone(),
        dispatch,
    };
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/rooms/{name}", get(handle_get_room))
        .route("/api/rooms/{name}/reapply", post(handle_reapply_room))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.lock().await.stop();
    info!("controller stopped");
    Ok(())
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("{} not found, running with defaults", path.display());
            return Ok(RuntimeConfig::default());
        }
        Err(err) => return Err(err.into()),
    };
    parse_runtime_config(path, &raw)
}

fn parse_runtime_config(path: &Path, raw: &[u8]) -> anyhow::Result<RuntimeConfig> {
    let yaml = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| matches!(extension, "yaml" | "yml"));
    if yaml {
        Ok(serde_yaml::from_slice(raw)?)
    } else {
        Ok(serde_json::from_slice(raw)?)
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    let network = &mut runtime.network;
    if let Some(host) = lookup("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(port) = lookup("CONTROLLER_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.http_port = port;
    }
}

fn referenced_entities(setup: &HeatingSetup) -> Vec<EntityId> {
    let mut entities: Vec<EntityId> = setup
        .rooms
        .iter()
        .flat_map(|room| room.referenced_entities())
        .cloned()
        .collect();
    entities.sort();
    entities.dedup();
    entities
}

/// Gives retained states time to arrive. Entities still missing afterwards
/// fail engine construction.
async fn wait_for_entities(host: &MqttHost, entities: &[EntityId], timeout: Duration) {
    let arrived = tokio::time::timeout(timeout, async {
        while !host.store().missing(entities).is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;

    if arrived.is_err() {
        let missing = host.store().missing(entities);
        warn!(
            "no state for {} entities after {}s: {:?}",
            missing.len(),
            timeout.as_secs(),
            missing
        );
    }
}

fn spawn_mqtt_loop(host: Arc<MqttHost>, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) = host.handle_publish(&message.topic, &message.payload) {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    host.subscribe_all();
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Feeds host notifications into the engine one at a time.
fn spawn_dispatch_loop(
    engine: Arc<Mutex<HeatingEngine>>,
    mut messages: mpsc::UnboundedReceiver<HostMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let mut engine = engine.lock().await;
            let result = match message {
                HostMessage::StateChanged(change) => {
                    engine.handle_state_change(&change);
                    Ok(())
                }
                HostMessage::Timer(handle, target) => engine.handle_timer(handle, &target),
                HostMessage::Event(event) => engine.handle_event(&event),
            };
            if let Err(err) = result {
                warn!("dispatch failed: {err}");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.status();
    Json(status)
}

async fn handle_get_room(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> axum::response::Response {
    match state.engine.lock().await.room_status(&name) {
        Ok(status) => Json(status).into_response(),
        Err(err) => heating_error_response(&err),
    }
}

async fn handle_reapply_room(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> axum::response::Response {
    if let Err(err) = state.engine.lock().await.room_status(&name) {
        return heating_error_response(&err);
    }

    if let Err(err) = queue_reapply(&state.dispatch, &name) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
    }
    (
        StatusCode::ACCEPTED,
        Json(ReapplyResponse {
            room: name,
            queued: true,
        }),
    )
        .into_response()
}

/// Queues a reapply on the dispatch loop, bypassing the broker.
fn queue_reapply(dispatch: &mpsc::UnboundedSender<HostMessage>, room: &str) -> anyhow::Result<()> {
    dispatch
        .send(HostMessage::Event(HeatingEvent::Reapply {
            room: Some(room.to_string()),
        }))
        .map_err(|_| anyhow!("dispatch loop is not running"))
}

fn heating_error_response(err: &HeatingError) -> axum::response::Response {
    let status = match err {
        HeatingError::UnknownRoom(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_yaml_and_json_by_extension() {
        let yaml = b"timezone: Europe/Vienna\nheating:\n  default_mode: comfort\n";
        let runtime = parse_runtime_config(Path::new("heating.yml"), yaml).unwrap();
        assert_eq!(runtime.timezone, "Europe/Vienna");
        assert_eq!(runtime.heating.default_mode, "comfort");

        let json = br#"{"http_port": 8181}"#;
        let runtime = parse_runtime_config(Path::new("heating.json"), json).unwrap();
        assert_eq!(runtime.http_port, 8181);
        assert!(parse_runtime_config(Path::new("heating.json"), yaml).is_err());
    }

    #[test]
    fn environment_overrides_network_settings() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USER", "heating"),
            ("CONTROLLER_HTTP_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut runtime = RuntimeConfig::default();

        apply_env_overrides(&mut runtime, |key| env.get(key).map(|value| value.to_string()));

        assert_eq!(runtime.network.mqtt_host, "broker.local");
        assert_eq!(runtime.network.mqtt_port, 8883);
        assert_eq!(runtime.network.mqtt_user, "heating");
        assert_eq!(runtime.network.mqtt_pass, "");
        assert_eq!(runtime.http_port, 8080);
    }

    #[test]
    fn reapply_goes_straight_to_dispatch() {
        let (dispatch, mut messages) = mpsc::unbounded_channel();

        queue_reapply(&dispatch, "living").unwrap();
        match messages.try_recv().unwrap() {
            HostMessage::Event(HeatingEvent::Reapply { room }) => {
                assert_eq!(room.as_deref(), Some("living"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        drop(messages);
        assert!(queue_reapply(&dispatch, "living").is_err());
    }

    #[test]
    fn collects_each_entity_once() {
        let config: heating_common::HeatingConfig = serde_json::from_str(
            r#"{
                "schedules": { "work": [] },
                "rooms": {
                    "a": { "control_point": "climate.a", "thermostats": [{"entity_id": "climate.a_trv"}],
                           "sensors": ["sensor.hall"], "default_schedule": "work" },
                    "b": { "control_point": "climate.b", "thermostats": [{"entity_id": "climate.b_trv"}],
                           "sensors": ["sensor.hall"], "default_schedule": "work" }
                }
            }"#,
        )
        .unwrap();
        let setup = HeatingSetup::assemble(&config).unwrap();

        assert_eq!(
            referenced_entities(&setup)
                .iter()
                .map(EntityId::as_str)
                .collect::<Vec<_>>(),
            vec!["climate.a", "climate.a_trv", "climate.b", "climate.b_trv", "sensor.hall"]
        );
    }
}
