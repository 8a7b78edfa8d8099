use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    response::Response,
    routing::any,
    Router,
};
use rumqttc::AsyncClient;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::Mutex,
};
use tracing::{info, warn};

use board_common::{
    hardware::sim::{SimAdc, SimDht},
    publish::split_reply,
    rpc::sensor_methods,
    runtime, Edge, Event, MethodTable, RpcError, SensorNode, SensorTrigger,
};

const BOARD: &str = "sensor";

type Node = SensorNode<SimDht, SimAdc>;

#[derive(Clone)]
struct AppState {
    node: Arc<Mutex<Node>>,
    methods: Arc<MethodTable<SensorTrigger>>,
    mqtt: AsyncClient,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = runtime::load_config()?;
    let methods = sensor_methods(&config);

    let mqtt = runtime::connect_mqtt(BOARD, &config);

    let rpc_port = config.network.rpc_port;
    let dht = config.dht1.clone();
    let light = config.light1.clone();
    let motion_enabled = config.motion1.enable;

    let app_state = AppState {
        node: Arc::new(Mutex::new(SensorNode::new(
            config,
            SimDht::new(),
            SimAdc::new(),
        ))),
        methods: Arc::new(methods),
        mqtt,
    };

    if dht.enable {
        info!(
            "dht1 ({:?}) on GPIO{} every {}ms",
            dht.model, dht.pin, dht.period_ms
        );
        spawn_timer(app_state.clone(), dht.period_ms, SensorTrigger::DhtTick);
    }
    if light.enable {
        info!("light1 on ADC{} every {}ms", light.channel, light.period_ms);
        spawn_timer(app_state.clone(), light.period_ms, SensorTrigger::LightTick);
    }
    if motion_enabled {
        info!("motion1 edges read from stdin (rising/falling)");
        spawn_motion_input(app_state.clone());
    }

    info!("rpc methods: {:?}", app_state.methods.names());

    let app = Router::new()
        .route("/rpc/{method}", any(handle_rpc))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], rpc_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor rpc server at {addr}"))?;

    info!("sensor board listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal(BOARD))
        .await?;
    Ok(())
}

fn spawn_timer(app_state: AppState, period_ms: u64, trigger: SensorTrigger) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        // First tick completes immediately; readings start one period in.
        interval.tick().await;

        loop {
            interval.tick().await;
            dispatch(&app_state, trigger).await;
        }
    });
}

fn spawn_motion_input(app_state: AppState) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_edge(&line) {
                    Some(edge) => {
                        dispatch(&app_state, SensorTrigger::MotionEdge(edge)).await;
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!("ignoring motion input `{}`", line.trim()),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!("motion input read failed: {err}");
                    break;
                }
            }
        }
    });
}

fn parse_edge(line: &str) -> Option<Edge> {
    match line.trim().to_ascii_lowercase().as_str() {
        "rising" | "high" | "1" => Some(Edge::Rising),
        "falling" | "low" | "0" => Some(Edge::Falling),
        _ => None,
    }
}

/// Runs one trigger under the node lock and queues its publishes before
/// releasing it, so events from one sensor leave in order.
async fn dispatch(app_state: &AppState, trigger: SensorTrigger) -> Option<Result<Event, RpcError>> {
    let mut node = app_state.node.lock().await;
    let (reply, publishes) = split_reply(node.handle(trigger));

    for (topic, event) in publishes {
        runtime::publish_event(&app_state.mqtt, &topic, &event);
    }
    reply
}

async fn handle_rpc(State(app_state): State<AppState>, Path(method): Path<String>) -> Response {
    let trigger = match app_state.methods.lookup(&method) {
        Ok(trigger) => trigger,
        Err(err) => return runtime::rpc_error_response(&err),
    };

    let reply = dispatch(&app_state, trigger).await;
    runtime::rpc_response(&method, reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_input_accepts_edge_words() {
        assert_eq!(parse_edge("rising"), Some(Edge::Rising));
        assert_eq!(parse_edge("  HIGH\n"), Some(Edge::Rising));
        assert_eq!(parse_edge("0"), Some(Edge::Falling));
        assert_eq!(parse_edge("sideways"), None);
    }
}
