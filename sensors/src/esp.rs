use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, dht22};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, Input, InputOutput, InterruptType, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{
        adc_atten_t_ADC_ATTEN_DB_12, adc_bitwidth_t_ADC_BITWIDTH_12, adc_oneshot_chan_cfg_t,
        adc_oneshot_config_channel, adc_oneshot_new_unit, adc_oneshot_read,
        adc_oneshot_unit_handle_t, adc_oneshot_unit_init_cfg_t, adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
        adc_unit_t_ADC_UNIT_1, esp,
    },
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use board_common::{
    publish::split_reply, rpc::sensor_methods, AnalogInput, BoardConfig, DhtDriver, DhtError,
    DhtModel, DhtSample, Edge, Event, MethodTable, NetworkConfig, RpcError, SensorNode,
    SensorTrigger,
};

const NVS_NAMESPACE: &str = "board";
const NVS_CONFIG_KEY: &str = "config_json";
const RPC_PREFIX: &str = "/rpc/";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const MOTION_POLL_MS: u64 = 20;

static MOTION_PENDING: AtomicBool = AtomicBool::new(false);

/// Drivers are only claimed for enabled features.
type Node = SensorNode<Option<EspDht>, Option<EspAdc>>;
type SharedNode = Arc<Mutex<Node>>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// DHT11/DHT22 on a single open-drain line.
struct EspDht {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

/// ADC1 oneshot unit with the light channel configured.
struct EspAdc {
    handle: adc_oneshot_unit_handle_t,
}

// The unit handle is only used behind the node mutex.
unsafe impl Send for EspAdc {}

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

    let dht = if config.dht1.enable {
        Some(EspDht::new(config.dht1.pin).context("failed to initialize dht1")?)
    } else {
        None
    };
    let adc = if config.light1.enable {
        Some(EspAdc::new(config.light1.channel).context("failed to initialize light1 adc")?)
    } else {
        None
    };
    let motion_pin = if config.motion1.enable {
        Some(init_motion_pin(config.motion1.pin).context("failed to initialize motion1")?)
    } else {
        None
    };

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;

    let (mqtt, conn) = create_mqtt_client(&config)?;
    spawn_mqtt_poll(conn)?;
    let mqtt: SharedMqtt = Arc::new(Mutex::new(mqtt));

    let methods = Arc::new(sensor_methods(&config));
    let dht_config = config.dht1.clone();
    let light_config = config.light1.clone();
    let node: SharedNode = Arc::new(Mutex::new(SensorNode::new(config, dht, adc)));

    if dht_config.enable {
        spawn_timer(
            "dht1",
            node.clone(),
            mqtt.clone(),
            dht_config.period_ms,
            SensorTrigger::DhtTick,
        )?;
    }
    if light_config.enable {
        spawn_timer(
            "light1",
            node.clone(),
            mqtt.clone(),
            light_config.period_ms,
            SensorTrigger::LightTick,
        )?;
    }
    if let Some(pin) = motion_pin {
        spawn_motion_waiter(pin, node.clone(), mqtt.clone())?;
    }

    let server = create_http_server(node, mqtt, methods)?;
    info!("sensor board ready");

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

impl EspDht {
    fn new(pin: u8) -> anyhow::Result<Self> {
        // SAFETY: the pin number comes from board config and is not claimed
        // by any other driver in this firmware.
        let pin = unsafe { AnyIOPin::new(i32::from(pin)) };
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl DhtDriver for EspDht {
    fn read(
        &mut self,
        pin: u8,
        model: DhtModel,
        fahrenheit: bool,
    ) -> Result<DhtSample, DhtError> {
        if let Err(err) = self.pin.set_high() {
            return Err(DhtError::Bus(format!("GPIO{pin}: {err:?}")));
        }

        let sample = match model {
            DhtModel::Dht11 => dht11::blocking::read(&mut self.delay, &mut self.pin)
                .map(|reading| DhtSample {
                    temperature: f32::from(reading.temperature),
                    humidity: f32::from(reading.relative_humidity),
                })
                .map_err(map_dht_error)?,
            DhtModel::Dht22 => dht22::blocking::read(&mut self.delay, &mut self.pin)
                .map(|reading| DhtSample {
                    temperature: reading.temperature,
                    humidity: reading.relative_humidity,
                })
                .map_err(map_dht_error)?,
        };

        info!(
            "[dht1] {:.2}°C {:.2}%",
            sample.temperature, sample.humidity
        );
        Ok(DhtSample {
            temperature: if fahrenheit {
                board_common::hardware::celsius_to_fahrenheit(sample.temperature)
            } else {
                sample.temperature
            },
            humidity: sample.humidity,
        })
    }
}

fn map_dht_error<E: core::fmt::Debug>(err: dht_sensor::DhtError<E>) -> DhtError {
    match err {
        dht_sensor::DhtError::Timeout => DhtError::Timeout,
        dht_sensor::DhtError::ChecksumMismatch => DhtError::Checksum,
        other => DhtError::Bus(format!("{other:?}")),
    }
}

impl EspAdc {
    fn new(channel: u8) -> anyhow::Result<Self> {
        let init_cfg = adc_oneshot_unit_init_cfg_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
            ..Default::default()
        };
        let mut handle: adc_oneshot_unit_handle_t = core::ptr::null_mut();
        esp!(unsafe { adc_oneshot_new_unit(&init_cfg, &mut handle) })?;

        let chan_cfg = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        esp!(unsafe { adc_oneshot_config_channel(handle, u32::from(channel), &chan_cfg) })?;

        info!("ADC1 channel {channel} configured");
        Ok(Self { handle })
    }
}

impl AnalogInput for EspAdc {
    fn read(&mut self, channel: u8) -> i32 {
        let mut raw: i32 = 0;
        // SAFETY: handle was created in `new` and is only used under the node lock.
        let ret = unsafe { adc_oneshot_read(self.handle, u32::from(channel), &mut raw) };
        if let Err(err) = esp!(ret) {
            warn!("adc read on channel {channel} failed: {err}");
            return 0;
        }
        info!("[light1] level {raw}");
        raw
    }
}

fn init_motion_pin(pin: u8) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    // SAFETY: see `EspDht::new`.
    let pin = unsafe { AnyIOPin::new(i32::from(pin)) };
    let mut pin = PinDriver::input(pin)?;
    pin.set_pull(Pull::Down)?;
    pin.set_interrupt_type(InterruptType::AnyEdge)?;

    // SAFETY: the callback only stores to an atomic, which is ISR-safe.
    unsafe {
        pin.subscribe(|| MOTION_PENDING.store(true, Ordering::Release))?;
    }
    pin.enable_interrupt()?;
    Ok(pin)
}

/// Turns PIR interrupts into motion edges. The interrupt is re-armed after
/// each edge is handled.
fn spawn_motion_waiter(
    mut pin: PinDriver<'static, AnyIOPin, Input>,
    node: SharedNode,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("motion1".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            if MOTION_PENDING.swap(false, Ordering::AcqRel) {
                let edge = if pin.is_high() {
                    Edge::Rising
                } else {
                    Edge::Falling
                };
                dispatch(&node, &mqtt, SensorTrigger::MotionEdge(edge));

                if let Err(err) = pin.enable_interrupt() {
                    warn!("failed to re-arm motion interrupt: {err:?}");
                }
            }
            thread::sleep(Duration::from_millis(MOTION_POLL_MS));
        })
        .context("failed to spawn motion thread")?;
    Ok(())
}

fn spawn_timer(
    name: &str,
    node: SharedNode,
    mqtt: SharedMqtt,
    period_ms: u64,
    trigger: SensorTrigger,
) -> anyhow::Result<()> {
    info!("{name} every {period_ms}ms");
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(8192)
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(period_ms));
            dispatch(&node, &mqtt, trigger);
        })
        .with_context(|| format!("failed to spawn {name} timer"))?;
    Ok(())
}

/// Runs one trigger and enqueues its publishes while the node is still
/// locked, keeping per-sensor event order.
fn dispatch(
    node: &SharedNode,
    mqtt: &SharedMqtt,
    trigger: SensorTrigger,
) -> Option<Result<Event, RpcError>> {
    let mut node = match node.lock() {
        Ok(node) => node,
        Err(poisoned) => poisoned.into_inner(),
    };
    let (reply, publishes) = split_reply(node.handle(trigger));

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
    node: SharedNode,
    mqtt: SharedMqtt,
    methods: Arc<MethodTable<SensorTrigger>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    let route = format!("{RPC_PREFIX}*");

    for http_method in [Method::Get, Method::Post] {
        let node = node.clone();
        let mqtt = mqtt.clone();
        let methods = methods.clone();
        server.fn_handler::<anyhow::Error, _>(&route, http_method, move |req| {
            let method = rpc_method(req.uri()).to_string();
            let reply = match methods.lookup(&method) {
                Ok(trigger) => dispatch(&node, &mqtt, trigger).unwrap_or_else(|| {
                    Err(RpcError::internal(format!("{method} produced no reply")))
                }),
                Err(err) => Err(err),
            };

            match reply {
                Ok(event) => write_json(req, 200, &event.to_vec()?),
                Err(err) => write_json(req, err.code, &err.body()?),
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
                warn!("sensor mqtt poll error: {err:?}");
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
