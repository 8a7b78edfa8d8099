use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::{
    config::BoardConfig,
    names::*,
    sensors::SensorTrigger,
    sonoff::{Action, SonoffCommand, SonoffTrigger, Target},
};

pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_INTERNAL: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: u16,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a RpcError,
}

impl RpcError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, message)
    }

    pub fn not_found(method: &str) -> Self {
        Self::new(CODE_NOT_FOUND, format!("No handler for {method}"))
    }

    /// `{"error":{"code":N,"message":"..."}}`
    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&ErrorBody { error: self })
    }
}

/// Registered RPC methods for one board, keyed by method name.
#[derive(Debug, Clone)]
pub struct MethodTable<T> {
    methods: HashMap<&'static str, T>,
}

impl<T: Copy> MethodTable<T> {
    pub fn new(entries: Vec<(&'static str, T)>) -> Self {
        Self {
            methods: entries.into_iter().collect(),
        }
    }

    pub fn lookup(&self, method: &str) -> Result<T, RpcError> {
        self.methods
            .get(method)
            .copied()
            .ok_or_else(|| RpcError::not_found(method))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Methods served by the sensor board. Disabled features are left out.
pub fn sensor_methods(config: &BoardConfig) -> MethodTable<SensorTrigger> {
    let mut entries = Vec::new();
    if config.dht1.enable {
        entries.push((METHOD_DHT1_READ, SensorTrigger::DhtQuery));
    }
    if config.light1.enable {
        entries.push((METHOD_LIGHT1_READ, SensorTrigger::LightQuery));
    }
    MethodTable::new(entries)
}

pub fn sonoff_methods(config: &BoardConfig) -> MethodTable<SonoffTrigger> {
    if !config.sonoff.enable {
        return MethodTable::new(Vec::new());
    }

    let command = |target, action| SonoffTrigger::Command(SonoffCommand { target, action });
    MethodTable::new(vec![
        (METHOD_RELAY_ON, command(Target::Relay, Action::TurnOn)),
        (METHOD_RELAY_OFF, command(Target::Relay, Action::TurnOff)),
        (METHOD_RELAY_STATUS, command(Target::Relay, Action::GetState)),
        (METHOD_BUTTON_ENABLE, command(Target::Button, Action::Enable)),
        (METHOD_BUTTON_DISABLE, command(Target::Button, Action::Disable)),
        (METHOD_BUTTON_STATUS, command(Target::Button, Action::GetState)),
        (METHOD_LED_ENABLE, command(Target::Led, Action::Enable)),
        (METHOD_LED_DISABLE, command(Target::Led, Action::Disable)),
        (METHOD_LED_STATUS, command(Target::Led, Action::GetState)),
    ])
}
