use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

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
    hardware::sim::SimGpio, publish::split_reply, rpc::sonoff_methods, runtime, ButtonDebouncer,
    Event, MethodTable, RelayBoard, RpcError, SonoffTrigger,
};

const BOARD: &str = "sonoff";

#[derive(Clone)]
struct AppState {
    board: Arc<Mutex<RelayBoard<SimGpio>>>,
    methods: Arc<MethodTable<SonoffTrigger>>,
    mqtt: AsyncClient,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = runtime::load_config()?;
    let methods = sonoff_methods(&config);

    let mqtt = runtime::connect_mqtt(BOARD, &config);

    let sonoff = config.sonoff.clone();
    let board = RelayBoard::new(config.device.id.clone(), sonoff.clone(), SimGpio::new());
    info!(
        "relay on GPIO{}, led on GPIO{}, button on GPIO{}",
        sonoff.relay_pin, sonoff.led_pin, sonoff.button_pin
    );

    let app_state = AppState {
        board: Arc::new(Mutex::new(board)),
        methods: Arc::new(methods),
        mqtt,
    };

    if sonoff.enable {
        info!("button presses read from stdin (press)");
        spawn_button_input(app_state.clone(), sonoff.button_debounce_ms);
    } else {
        warn!("sonoff disabled in config; no rpc methods registered");
    }

    info!("rpc methods: {:?}", app_state.methods.names());

    let app = Router::new()
        .route("/rpc/{method}", any(handle_rpc))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.network.rpc_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sonoff rpc server at {addr}"))?;

    info!("sonoff board listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal(BOARD))
        .await?;
    Ok(())
}

fn spawn_button_input(app_state: AppState, debounce_ms: u64) {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut debouncer = ButtonDebouncer::new(debounce_ms);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_press(&line) => {
                    // Truncated like the ESP interrupt stamp; the debouncer wraps.
                    let now_ms = started.elapsed().as_millis() as u32;
                    if debouncer.accept(now_ms) {
                        dispatch(&app_state, SonoffTrigger::ButtonPressed).await;
                    } else {
                        info!("button bounce ignored");
                    }
                }
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => warn!("ignoring button input `{}`", line.trim()),
                Ok(None) => break,
                Err(err) => {
                    warn!("button input read failed: {err}");
                    break;
                }
            }
        }
    });
}

fn is_press(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "press" | "p" | "button"
    )
}

/// Runs one trigger under the board lock; publishes are queued before the
/// lock is released so relay events leave in the order they happened.
async fn dispatch(app_state: &AppState, trigger: SonoffTrigger) -> Option<Result<Event, RpcError>> {
    let mut board = app_state.board.lock().await;
    let (reply, publishes) = split_reply(board.handle(trigger));

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
    fn button_input_words() {
        assert!(is_press("press"));
        assert!(is_press(" P \n"));
        assert!(!is_press("release"));
    }
}
