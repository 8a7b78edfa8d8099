use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, Input, InputOutput, InterruptType, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use board_common::{
    publish::split_reply, rpc::sonoff_methods, BoardConfig, ButtonDebouncer, Event, Gpio,
    MethodTable, NetworkConfig, RelayBoard, RpcError, SonoffTrigger,
};

const NVS_NAMESPACE: &str = "board";
const NVS_CONFIG_KEY: &str = "config_json";
const RPC_PREFIX: &str = "/rpc/";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const BUTTON_POLL_MS: u64 = 10;

/// Milliseconds since boot of the last falling edge on the button, written
/// from the ISR. Zero means no press yet.
static BUTTON_ISR_TIMESTAMP: AtomicU32 = AtomicU32::new(0);

type SharedBoard = Arc<Mutex<RelayBoard<EspGpio>>>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Relay and LED outputs. Pins are input-output so the relay level can be
/// read back from the pad.
struct EspGpio {
    pins: Vec<(u8, PinDriver<'static, AnyIOPin, InputOutput>)>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load board config from NVS: {err:#}");
        BoardConfig::default()
    });
    info!("loaded board config for {}", config.device.id);

    let Peripherals { modem, .. } = Peripherals::take()?;

    let sonoff = config.sonoff.clone();
    let gpio = EspGpio::new(&[sonoff.relay_pin, sonoff.led_pin])
        .context("failed to initialize relay and led pins")?;
    let board: SharedBoard = Arc::new(Mutex::new(RelayBoard::new(
        config.device.id.clone(),
        sonoff.clone(),
        gpio,
    )));

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;

    let (mqtt, conn) = create_mqtt_client(&config)?;
    spawn_mqtt_poll(conn)?;
    let mqtt: SharedMqtt = Arc::new(Mutex::new(mqtt));

    if sonoff.enable {
        let button = init_button_pin(sonoff.button_pin).context("failed to initialize button")?;
        spawn_button_waiter(button, sonoff.button_debounce_ms, board.clone(), mqtt.clone())?;
    } else {
        warn!("sonoff disabled in config; no rpc methods registered");
    }

    let methods = Arc::new(sonoff_methods(&config));
    let server = create_http_server(board, mqtt, methods)?;
    info!("sonoff board ready");

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

impl EspGpio {
    fn new(pins: &[u8]) -> anyhow::Result<Self> {
        let mut drivers = Vec::with_capacity(pins.len());
        for &pin in pins {
            // SAFETY: pin numbers come from board config and are not claimed
            // by any other driver in this firmware.
            let io = unsafe { AnyIOPin::new(i32::from(pin)) };
            let driver = PinDriver::input_output(io)
                .with_context(|| format!("failed to claim GPIO{pin}"))?;
            drivers.push((pin, driver));
        }
        Ok(Self { pins: drivers })
    }

    fn driver(&self, pin: u8) -> Option<&PinDriver<'static, AnyIOPin, InputOutput>> {
        self.pins
            .iter()
            .find(|(number, _)| *number == pin)
            .map(|(_, driver)| driver)
    }
}

impl Gpio for EspGpio {
    fn write(&mut self, pin: u8, level: bool) {
        let Some((_, driver)) = self.pins.iter_mut().find(|(number, _)| *number == pin) else {
            warn!("write to unclaimed GPIO{pin}");
            return;
        };

        let result = if level {
            driver.set_high()
        } else {
            driver.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive GPIO{pin} {}: {err:?}", if level { "high" } else { "low" });
        }
    }

    fn read(&self, pin: u8) -> bool {
        self.driver(pin).is_some_and(|driver| driver.is_high())
    }
}

fn init_button_pin(pin: u8) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    // SAFETY: see `EspGpio::new`.
    let io = unsafe { AnyIOPin::new(i32::from(pin)) };
    let mut button = PinDriver::input(io)?;
    button.set_pull(Pull::Up)?;
    button.set_interrupt_type(InterruptType::NegEdge)?;

    // SAFETY: the callback reads the RTC counter and stores to an atomic,
    // both of which are ISR-safe.
    unsafe {
        button.subscribe(|| {
            let now_ms = (esp_idf_svc::sys::esp_timer_get_time() / 1_000) as u32;
            BUTTON_ISR_TIMESTAMP.store(now_ms.max(1), Ordering::Release);
        })?;
    }
    button.enable_interrupt()?;
    info!("button armed on GPIO{pin}");
    Ok(button)
}

/// Debounces ISR timestamps into button presses and re-arms the interrupt.
fn spawn_button_waiter(
    mut button: PinDriver<'static, AnyIOPin, Input>,
    debounce_ms: u64,
    board: SharedBoard,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("button".to_string())
        .stack_size(8192)
        .spawn(move || {
            let mut debouncer = ButtonDebouncer::new(debounce_ms);
            let mut last_seen = 0_u32;

            loop {
                let stamp = BUTTON_ISR_TIMESTAMP.load(Ordering::Acquire);
                if stamp != last_seen {
                    last_seen = stamp;
                    if debouncer.accept(stamp) {
                        dispatch(&board, &mqtt, SonoffTrigger::ButtonPressed);
                    }
                    if let Err(err) = button.enable_interrupt() {
                        warn!("failed to re-arm button interrupt: {err:?}");
                    }
                }
                thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
            }
        })
        .context("failed to spawn button thread")?;
    Ok(())
}

/// Runs one trigger and enqueues its publishes while the board is still
/// locked, keeping relay events in order.
fn dispatch(
    board: &SharedBoard,
    mqtt: &SharedMqtt,
    trigger: SonoffTrigger,
) -> Option<Result<Event, RpcError>> {
    let mut board = match board.lock() {
        Ok(board) => board,
        Err(poisoned) => poisoned.into_inner(),
    };
    let (reply, publishes) = split_reply(board.handle(trigger));

    for (topic, event) in publishes {
        publish_event(mqtt, &topic, &event);
    }
    reply
}

fn publish_event(mqtt: &SharedMqtt, topic: &str, event: &Event) {
    let payload = match event.to_vec() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("failed to encode event for {topic}: {err}");
            return;
        }
    };

    let mut client = match mqtt.lock() {
        Ok(client) => client,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(err) = client.enqueue(topic, QoS::AtMostOnce, false, &payload) {
        warn!("failed to publish to {topic}: {err:?}");
    }
}

fn create_http_server(
    board: SharedBoard,
    mqtt: SharedMqtt,
    methods: Arc<MethodTable<SonoffTrigger>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    let route = format!("{RPC_PREFIX}*");

    for http_method in [Method::Get, Method::Post] {
        let board = board.clone();
        let mqtt = mqtt.clone();
        let methods = methods.clone();
        server.fn_handler::<anyhow::Error, _>(&route, http_method, move |req| {
            let method = rpc_method(req.uri()).to_string();
            let reply = match methods.lookup(&method) {
                Ok(trigger) => dispatch(&board, &mqtt, trigger).unwrap_or_else(|| {
                    Err(RpcError::internal(format!("{method} produced no reply")))
                }),
                Err(err) => Err(err),
            };

            match reply {
                Ok(event) => write_json(req, 200, &event.to_vec()?),
                Err(err) => {
                    warn!("{method} failed: {}", err.message);
                    write_json(req, err.code, &err.body()?)
                }
            }
        })?;
    }

    Ok(server)
}

fn rpc_method(uri: &str) -> &str {
    let path = uri.split('?').next().unwrap_or_default();
    path.strip_prefix(RPC_PREFIX).unwrap_or(path)
}

fn write_json(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    body: &[u8],
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(body)?;
    Ok(())
}

fn spawn_mqtt_poll(mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            if let Err(err) = conn.next() {
                warn!("sonoff mqtt poll error: {err:?}");
                thread::sleep(Duration::from_secs(2));
            }
        })
        .context("failed to spawn mqtt thread")?;
    Ok(())
}

fn create_mqtt_client(
    config: &BoardConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &config.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(config.device.id.as_str()),
        username: (!network.mqtt_user.is_empty()).then_some(network.mqtt_user.as_str()),
        password: (!network.mqtt_pass.is_empty()).then_some(network.mqtt_pass.as_str()),
        ..Default::default()
    };

    Ok(EspMqttClient::new(&url, &conf)?)
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<BoardConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(BoardConfig::from_json(value)?),
            None => Ok(BoardConfig::default()),
        }
    }
}
