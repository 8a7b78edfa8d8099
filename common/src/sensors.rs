use crate::{
    config::{BoardConfig, DhtConfig},
    event::{build_event, DeviceType, Event, FieldValue},
    hardware::{AnalogInput, DhtDriver},
    names::*,
    publish::{route, Channels, Delivery},
    rpc::RpcError,
};

pub const DHT_READ_FAILED: &str = "last dht read failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// PIR output went high: motion detected.
    Rising,
    /// PIR output went low: area is still.
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorTrigger {
    DhtTick,
    DhtQuery,
    LightTick,
    LightQuery,
    MotionEdge(Edge),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtReading {
    pub temp: f64,
    pub humidity: f64,
}

pub fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

pub fn read_dht<D: DhtDriver>(driver: &mut D, config: &DhtConfig) -> Result<DhtReading, String> {
    driver
        .read(config.pin, config.model, config.fahrenheit)
        .map(|sample| DhtReading {
            temp: round2(sample.temperature),
            humidity: round2(sample.humidity),
        })
        .map_err(|err| err.to_string())
}

pub fn dht_event(device_id: &str, reading: &Result<DhtReading, String>) -> Event {
    let fields = match reading {
        Ok(reading) => vec![
            (FIELD_TEMP, FieldValue::Fixed2(reading.temp)),
            (FIELD_HUMIDITY, FieldValue::Fixed2(reading.humidity)),
        ],
        Err(err) => vec![(FIELD_ERR, FieldValue::Text(err.clone()))],
    };
    build_event(device_id, DeviceType::Sensors, Some(SENSOR_DHT1), fields)
}

/// RPC answer for `DHT1.Read`, built from the last timer reading.
///
/// The success payload carries no `sensor` key; older dashboards match on
/// that exact shape.
pub fn dht_reply(
    device_id: &str,
    last: Option<&Result<DhtReading, String>>,
) -> Result<Event, RpcError> {
    match last {
        Some(Ok(reading)) => Ok(build_event(
            device_id,
            DeviceType::Sensors,
            None,
            vec![
                (FIELD_TEMP, FieldValue::Fixed2(reading.temp)),
                (FIELD_HUMIDITY, FieldValue::Fixed2(reading.humidity)),
            ],
        )),
        Some(Err(_)) | None => {
            let body = build_event(
                device_id,
                DeviceType::Sensors,
                None,
                vec![(FIELD_MSG, FieldValue::Text(DHT_READ_FAILED.to_string()))],
            );
            let message = body
                .to_json()
                .unwrap_or_else(|_| DHT_READ_FAILED.to_string());
            Err(RpcError::internal(message))
        }
    }
}

pub fn read_light<A: AnalogInput>(adc: &mut A, device_id: &str, channel: u8) -> Event {
    let level = adc.read(channel);
    build_event(
        device_id,
        DeviceType::Sensors,
        Some(SENSOR_LIGHT1),
        vec![(FIELD_LEVEL, FieldValue::Int(i64::from(level)))],
    )
}

pub fn motion_event(device_id: &str, edge: Edge) -> Event {
    build_event(
        device_id,
        DeviceType::Sensors,
        Some(SENSOR_MOTION1),
        vec![(
            FIELD_MOTION_DETECTED,
            FieldValue::Flag(edge == Edge::Rising),
        )],
    )
}

#[derive(Debug, Clone, Default)]
pub struct SensorState {
    last_dht: Option<Result<DhtReading, String>>,
}

/// Owns the sensor drivers and the cached DHT reading for one board.
#[derive(Debug)]
pub struct SensorNode<D, A> {
    config: BoardConfig,
    dht: D,
    adc: A,
    state: SensorState,
}

impl<D: DhtDriver, A: AnalogInput> SensorNode<D, A> {
    pub fn new(config: BoardConfig, dht: D, adc: A) -> Self {
        Self {
            config,
            dht,
            adc,
            state: SensorState::default(),
        }
    }

    pub fn last_dht(&self) -> Option<&Result<DhtReading, String>> {
        self.state.last_dht.as_ref()
    }

    pub fn dht_mut(&mut self) -> &mut D {
        &mut self.dht
    }

    pub fn adc_mut(&mut self) -> &mut A {
        &mut self.adc
    }

    pub fn handle(&mut self, trigger: SensorTrigger) -> Vec<Delivery> {
        let device_id = self.config.device.id.as_str();

        match trigger {
            SensorTrigger::DhtTick | SensorTrigger::DhtQuery if !self.config.dht1.enable => {
                Vec::new()
            }
            SensorTrigger::LightTick | SensorTrigger::LightQuery if !self.config.light1.enable => {
                Vec::new()
            }
            SensorTrigger::MotionEdge(_) if !self.config.motion1.enable => Vec::new(),
            SensorTrigger::DhtTick => {
                let reading = read_dht(&mut self.dht, &self.config.dht1);
                let event = dht_event(device_id, &reading);
                self.state.last_dht = Some(reading);
                route(event, Channels::mqtt(&self.config.dht1.mqtt_topic))
            }
            SensorTrigger::DhtQuery => match dht_reply(device_id, self.state.last_dht.as_ref()) {
                Ok(event) => vec![Delivery::Reply(event)],
                Err(err) => vec![Delivery::ReplyError(err)],
            },
            SensorTrigger::LightTick => {
                let event = read_light(&mut self.adc, device_id, self.config.light1.channel);
                route(event, Channels::mqtt(&self.config.light1.mqtt_topic))
            }
            SensorTrigger::LightQuery => {
                let event = read_light(&mut self.adc, device_id, self.config.light1.channel);
                route(event, Channels::reply_only())
            }
            SensorTrigger::MotionEdge(edge) => route(
                motion_event(device_id, edge),
                Channels::mqtt(&self.config.motion1.mqtt_topic),
            ),
        }
    }
}
