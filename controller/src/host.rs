use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tradfri_common::{config::deserialize_device_id, topics, DeviceSettings, PrintEvent, RuntimeConfig};

use crate::{
    gateway::InMemoryGateway,
    plugin::{ApiCommand, ApiReply, ControllerError, Notification, PowerController, SettingsUpdate},
    printer,
    store::AppStore,
    wizard::WizardError,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const DEFAULT_SECURITY_CODE: &str = "0000000000000000";

#[derive(Clone)]
struct AppState {
    controller: Arc<PowerController>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRequest {
    #[serde(default)]
    dev: Option<DeviceSettings>,
}

#[derive(Debug, Deserialize)]
struct SaveDeviceRequest {
    #[serde(default)]
    device: Option<DeviceSettings>,
}

#[derive(Debug, Deserialize)]
struct DeleteDeviceRequest {
    #[serde(default, deserialize_with = "optional_device_id")]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetOutletRequest {
    #[serde(default, deserialize_with = "optional_device_id")]
    selected_outlet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TryConnectRequest {
    #[serde(default)]
    gateway: Option<String>,
    #[serde(rename = "securityCode", default)]
    security_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    event: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::from_env();
    let mut runtime = match store.load_runtime_config().await {
        Ok((runtime, migrated)) => {
            if migrated {
                info!("migrated stored settings to the current version");
                if let Err(err) = store.save_runtime_config(&runtime).await {
                    warn!("failed to persist migrated settings: {err}");
                }
            }
            runtime
        }
        Err(err) => {
            warn!("failed to load runtime config from store: {err}");
            RuntimeConfig::default()
        }
    };
    apply_env_overrides(&mut runtime);

    let gateway = build_gateway(&runtime)?;
    let link = printer::link_from_config(&runtime.printer);
    let controller = PowerController::new(runtime.clone(), store, Arc::new(gateway), link);

    if let Some(base) = runtime.mqtt.base_topic.clone().filter(|base| !base.is_empty()) {
        let mut mqtt_options =
            MqttOptions::new("tradfri-controller-rust", runtime.mqtt.host.clone(), runtime.mqtt.port);
        if !runtime.mqtt.user.is_empty() {
            mqtt_options.set_credentials(runtime.mqtt.user.clone(), runtime.mqtt.pass.clone());
        }
        let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
        info!("mqtt enabled with base topic {base}");
        spawn_mqtt_loop(controller.clone(), mqtt.clone(), eventloop, base.clone());
        spawn_notification_forwarder(controller.clone(), mqtt, base);
    } else {
        info!("mqtt disabled, no base topic configured");
    }

    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.load_devices().await {
                warn!("initial device load failed: {err}");
            }
            controller.state_data().await;
        });
    }

    let app = router(AppState {
        controller: controller.clone(),
    });

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/wizard/setOutlet", post(handle_set_outlet))
        .route("/wizard/tryConnect", post(handle_try_connect))
        .route("/devices", get(handle_get_devices))
        .route("/device/save", post(handle_save_device))
        .route("/device/delete", post(handle_delete_device))
        .route("/sidebar/info", get(handle_sidebar_info))
        .route("/sidebar/postpone", post(handle_postpone))
        .route("/sidebar/cancelShutdown", post(handle_cancel_shutdown))
        .route("/sidebar/shutdownNow", post(handle_shutdown_now))
        .route("/navbar/info", get(handle_navbar_info))
        .route("/api/plugin", post(handle_api_command))
        .route("/api/event", post(handle_event))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/api/status", get(handle_get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.mqtt.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.mqtt.user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.mqtt.pass = pass;
    }
}

/// In-process gateway seeded from `TRADFRI_SEED_DEVICES`, or the built-in device set.
fn build_gateway(runtime: &RuntimeConfig) -> anyhow::Result<InMemoryGateway> {
    let code = std::env::var("TRADFRI_SECURITY_CODE")
        .unwrap_or_else(|_| DEFAULT_SECURITY_CODE.to_string());
    let devices = match std::env::var("TRADFRI_SEED_DEVICES") {
        Ok(path) => InMemoryGateway::load_seed(&PathBuf::from(path))?,
        Err(_) => InMemoryGateway::default_devices(),
    };

    let gateway = InMemoryGateway::any_host(code).with_devices(devices);
    if runtime.gateway.is_complete() {
        gateway.register_identity(runtime.gateway.identity.clone(), runtime.gateway.psk.clone());
    }
    Ok(gateway)
}

fn spawn_mqtt_loop(
    controller: Arc<PowerController>,
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    base: String,
) {
    let subscriptions = [
        topics::plugin_wildcard(&base),
        topics::event_wildcard(&base),
        topics::temperature_wildcard(&base),
    ];

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&controller, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in &subscriptions {
                        if let Err(err) = mqtt.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
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

async fn handle_mqtt_message(controller: &Arc<PowerController>, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }
    let Ok(message) = std::str::from_utf8(payload) else {
        warn!("dropping non utf8 mqtt payload on topic {topic}");
        return;
    };

    if let Err(err) = controller.on_mqtt_message(topic, message).await {
        warn!("mqtt message handling error on {topic}: {err}");
    }
}

/// Publishes device states and UI messages under the plugin topic.
fn spawn_notification_forwarder(controller: Arc<PowerController>, mqtt: AsyncClient, base: String) {
    let mut notifications = controller.subscribe();
    tokio::spawn(async move {
        loop {
            let notification = match notifications.recv().await {
                Ok(notification) => notification,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("notification forwarder skipped {skipped} messages");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let (topic, body) = match &notification {
                Notification::DeviceState { id, state } => {
                    (topics::device_state_topic(&base, id), serde_json::to_vec(state))
                }
                Notification::Message(message) => {
                    (topics::message_topic(&base, message.kind), serde_json::to_vec(message))
                }
            };
            match body {
                Ok(body) => {
                    debug!("publishing {topic}");
                    if let Err(err) = mqtt.publish(topic, QoS::AtLeastOnce, false, body).await {
                        warn!("mqtt publish failed: {err}");
                    }
                }
                Err(err) => warn!("notification serialization failed: {err}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn handle_set_outlet(
    State(state): State<AppState>,
    Json(request): Json<SetOutletRequest>,
) -> impl IntoResponse {
    let Some(outlet) = request.selected_outlet else {
        return error_response(StatusCode::BAD_REQUEST, "Expected selected_outlet.");
    };
    match state.controller.set_outlet(&outlet).await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_try_connect(
    State(state): State<AppState>,
    Json(request): Json<TryConnectRequest>,
) -> impl IntoResponse {
    let (Some(gateway), Some(code)) = (request.gateway, request.security_code) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Expected security code and gateway.",
        );
    };

    match state.controller.try_connect(&gateway, &code).await {
        Ok(devices) => Json(devices).into_response(),
        Err(WizardError::Psk(err)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to generate psk: {err}"),
        ),
        Err(WizardError::Controller(err)) => controller_error(err),
    }
}

async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.controller.load_devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_save_device(
    State(state): State<AppState>,
    Json(request): Json<SaveDeviceRequest>,
) -> impl IntoResponse {
    let Some(device) = request.device else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device");
    };
    match state.controller.save_device(device).await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_delete_device(
    State(state): State<AppState>,
    Json(request): Json<DeleteDeviceRequest>,
) -> impl IntoResponse {
    let Some(device_id) = request.device_id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device_id");
    };
    match state.controller.delete_device(&device_id).await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_sidebar_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.sidebar_info().await)
}

async fn handle_postpone(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    let Some(device) = request.dev else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device");
    };
    state.controller.plan_stop(&device, true).await;
    handle_sidebar_info(State(state)).await.into_response()
}

async fn handle_cancel_shutdown(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    let Some(device) = request.dev else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device");
    };
    Json(state.controller.cancel_shutdown(&device.id).await).into_response()
}

async fn handle_shutdown_now(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    let Some(device) = request.dev else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device");
    };
    if let Err(err) = state.controller.shutdown_now(&device).await {
        return controller_error(err);
    }
    handle_sidebar_info(State(state)).await.into_response()
}

async fn handle_navbar_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.navbar_info().await)
}

async fn handle_api_command(
    State(state): State<AppState>,
    Json(command): Json<ApiCommand>,
) -> impl IntoResponse {
    match state.controller.api_command(command).await {
        Ok(ApiReply::Done) => StatusCode::NO_CONTENT.into_response(),
        Ok(reply) => Json(reply).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> impl IntoResponse {
    state
        .controller
        .on_event(&PrintEvent::parse(&request.event))
        .await;
    handle_sidebar_info(State(state)).await.into_response()
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.settings_view().await)
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    match state.controller.update_settings(update).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => controller_error(err),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

fn optional_device_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_device_id(deserializer).map(Some)
}

fn controller_error(err: ControllerError) -> axum::response::Response {
    let status = match &err {
        ControllerError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        ControllerError::MissingDevice | ControllerError::Payload(_) => StatusCode::BAD_REQUEST,
        ControllerError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        ControllerError::Client(_) | ControllerError::Device(_) => StatusCode::BAD_GATEWAY,
        ControllerError::Store(_) | ControllerError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
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
    use super::*;

    #[test]
    fn device_ids_in_requests_accept_numbers() {
        let request: SetOutletRequest =
            serde_json::from_value(serde_json::json!({ "selected_outlet": 65537 })).unwrap();
        assert_eq!(request.selected_outlet.as_deref(), Some("65537"));

        let request: DeleteDeviceRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(request.device_id, None);
    }

    #[test]
    fn controller_errors_map_to_statuses() {
        assert_eq!(
            controller_error(ControllerError::UnknownDevice("1".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            controller_error(ControllerError::MissingDevice).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            controller_error(ControllerError::NotConfigured).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
