//! Host runtime plumbing shared by the board binaries: config loading, the
//! MQTT poll loop, publishing and RPC responses.

use std::time::Duration;

use anyhow::Context;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use crate::{config::BoardConfig, event::Event, rpc::RpcError};

pub const DEFAULT_CONFIG_PATH: &str = "./board.json";

/// Loads `BOARD_CONFIG` (default `./board.json`) and applies network env
/// overrides.
pub fn load_config() -> anyhow::Result<BoardConfig> {
    let path = std::env::var("BOARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = BoardConfig::load(&path)
        .with_context(|| format!("failed to load board config from {path}"))?;
    config
        .network
        .apply_overrides(|key| std::env::var(key).ok());
    info!("loaded board config for {}", config.device.id);
    Ok(config)
}

/// Builds the MQTT client for this board and spawns its poll loop.
pub fn connect_mqtt(board: &'static str, config: &BoardConfig) -> AsyncClient {
    let network = &config.network;
    let mut mqtt_options = MqttOptions::new(
        config.device.id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    spawn_mqtt_loop(board, eventloop);
    mqtt
}

fn spawn_mqtt_loop(board: &'static str, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Incoming::ConnAck(_))) => info!("{board} mqtt connected"),
                Ok(_) => {}
                Err(err) => {
                    warn!("{board} mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// QoS 0, not retained. Failures are logged and dropped.
pub fn publish_event(mqtt: &AsyncClient, topic: &str, event: &Event) {
    let payload = match event.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to encode event for {topic}: {err}");
            return;
        }
    };

    info!("[{topic}] {payload}");
    if let Err(err) = mqtt.try_publish(topic, QoS::AtMostOnce, false, payload) {
        warn!("failed to publish to {topic}: {err}");
    }
}

/// Turns a dispatch result into the HTTP answer for `method`.
pub fn rpc_response(method: &str, reply: Option<Result<Event, RpcError>>) -> Response {
    match reply {
        Some(Ok(event)) => match event.to_vec() {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(err) => rpc_error_response(&RpcError::internal(err.to_string())),
        },
        Some(Err(err)) => {
            warn!("{method} failed: {}", err.message);
            rpc_error_response(&err)
        }
        None => rpc_error_response(&RpcError::internal(format!("{method} produced no reply"))),
    }
}

pub fn rpc_error_response(err: &RpcError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match err.body() {
        Ok(body) => json_response(status, body),
        Err(_) => status.into_response(),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub async fn shutdown_signal(board: &'static str) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down {board} board");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_event, DeviceType, FieldValue};

    #[test]
    fn rpc_errors_keep_their_status() {
        let response = rpc_error_response(&RpcError::not_found("Nope.Read"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = rpc_error_response(&RpcError::internal("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn replies_map_to_status_codes() {
        let event = build_event(
            "plug1",
            DeviceType::Sonoff,
            None,
            vec![("relay_on", FieldValue::Flag(true))],
        );
        assert_eq!(
            rpc_response("Sonoff.Relay.On", Some(Ok(event))).status(),
            StatusCode::OK
        );
        assert_eq!(
            rpc_response("Sonoff.Relay.On", None).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
