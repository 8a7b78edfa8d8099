//! Hardware ports used by the sensor and relay logic.
//!
//! The ESP build implements these on top of esp-idf-hal; host builds and
//! tests use the simulated devices in [`sim`].

use thiserror::Error;

use crate::config::DhtModel;

/// Digital pins, addressed by GPIO number. Writes are fire-and-forget:
/// callers that care about the outcome read the pin back.
pub trait Gpio {
    fn write(&mut self, pin: u8, level: bool);
    fn read(&self, pin: u8) -> bool;

    fn toggle(&mut self, pin: u8) {
        let level = self.read(pin);
        self.write(pin, !level);
    }
}

pub trait AnalogInput {
    fn read(&mut self, channel: u8) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtSample {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    #[error("timeout waiting for dht response")]
    Timeout,
    #[error("dht checksum mismatch")]
    Checksum,
    #[error("dht bus error: {0}")]
    Bus(String),
}

pub trait DhtDriver {
    fn read(&mut self, pin: u8, model: DhtModel, fahrenheit: bool)
        -> Result<DhtSample, DhtError>;
}

/// A sensor that is not fitted. Disabled features never reach these reads,
/// so they only report the absence.
impl<D: DhtDriver> DhtDriver for Option<D> {
    fn read(&mut self, pin: u8, model: DhtModel, fahrenheit: bool)
        -> Result<DhtSample, DhtError> {
        match self {
            Some(driver) => driver.read(pin, model, fahrenheit),
            None => Err(DhtError::Bus(format!("no dht fitted on GPIO{pin}"))),
        }
    }
}

impl<A: AnalogInput> AnalogInput for Option<A> {
    fn read(&mut self, channel: u8) -> i32 {
        match self {
            Some(adc) => adc.read(channel),
            None => 0,
        }
    }
}

pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub mod sim {
    use std::collections::{HashMap, HashSet, VecDeque};

    use super::*;

    /// In-memory pin bank. Pins marked stuck ignore writes, which models a
    /// failed output driver.
    #[derive(Debug, Default, Clone)]
    pub struct SimGpio {
        levels: HashMap<u8, bool>,
        stuck: HashSet<u8>,
        writes: Vec<(u8, bool)>,
    }

    impl SimGpio {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_stuck(&mut self, pin: u8, stuck: bool) {
            if stuck {
                self.stuck.insert(pin);
            } else {
                self.stuck.remove(&pin);
            }
        }

        pub fn writes(&self) -> &[(u8, bool)] {
            &self.writes
        }

        pub fn clear_writes(&mut self) {
            self.writes.clear();
        }
    }

    impl Gpio for SimGpio {
        fn write(&mut self, pin: u8, level: bool) {
            self.writes.push((pin, level));
            if !self.stuck.contains(&pin) {
                self.levels.insert(pin, level);
            }
        }

        fn read(&self, pin: u8) -> bool {
            self.levels.get(&pin).copied().unwrap_or(false)
        }
    }

    /// Replays scripted levels, then produces a slow synthetic wave.
    #[derive(Debug, Default, Clone)]
    pub struct SimAdc {
        scripted: VecDeque<i32>,
        tick: u32,
    }

    impl SimAdc {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, level: i32) {
            self.scripted.push_back(level);
        }
    }

    impl AnalogInput for SimAdc {
        fn read(&mut self, _channel: u8) -> i32 {
            if let Some(level) = self.scripted.pop_front() {
                return level;
            }
            self.tick = self.tick.wrapping_add(1);
            400 + (self.tick % 12) as i32 * 25
        }
    }

    /// Replays scripted results, then produces drifting plausible readings.
    #[derive(Debug, Default, Clone)]
    pub struct SimDht {
        scripted: VecDeque<Result<DhtSample, DhtError>>,
        tick: u32,
    }

    impl SimDht {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, result: Result<DhtSample, DhtError>) {
            self.scripted.push_back(result);
        }
    }

    impl DhtDriver for SimDht {
        fn read(
            &mut self,
            _pin: u8,
            _model: DhtModel,
            fahrenheit: bool,
        ) -> Result<DhtSample, DhtError> {
            if let Some(result) = self.scripted.pop_front() {
                return result;
            }

            self.tick = self.tick.wrapping_add(1);
            let temp_c = 20.0 + (self.tick % 8) as f32 * 0.25;
            let humidity = 42.0 + (self.tick % 6) as f32 * 0.5;
            Ok(DhtSample {
                temperature: if fahrenheit {
                    celsius_to_fahrenheit(temp_c)
                } else {
                    temp_c
                },
                humidity,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{sim::*, *};

    #[test]
    fn toggle_flips_level() {
        let mut gpio = SimGpio::new();
        gpio.toggle(12);
        assert!(gpio.read(12));
        gpio.toggle(12);
        assert!(!gpio.read(12));
        assert_eq!(gpio.writes(), &[(12, true), (12, false)]);
    }

    #[test]
    fn stuck_pin_ignores_writes() {
        let mut gpio = SimGpio::new();
        gpio.set_stuck(12, true);
        gpio.write(12, true);
        assert!(!gpio.read(12));
    }

    #[test]
    fn scripted_dht_results_come_first() {
        let mut dht = SimDht::new();
        dht.push(Err(DhtError::Timeout));

        assert_eq!(dht.read(5, DhtModel::Dht22, false), Err(DhtError::Timeout));
        assert!(dht.read(5, DhtModel::Dht22, false).is_ok());
    }

    #[test]
    fn missing_drivers_report_absence() {
        let mut dht: Option<SimDht> = None;
        assert_eq!(
            dht.read(5, DhtModel::Dht11, false),
            Err(DhtError::Bus("no dht fitted on GPIO5".to_string()))
        );

        let mut adc: Option<SimAdc> = None;
        assert_eq!(adc.read(0), 0);

        let mut sim = SimAdc::new();
        sim.push(730);
        let mut fitted = Some(sim);
        assert_eq!(fitted.read(0), 730);
    }

    #[test]
    fn synthetic_dht_honours_unit() {
        let mut celsius = SimDht::new();
        let mut fahrenheit = SimDht::new();

        let c = celsius.read(5, DhtModel::Dht22, false).unwrap();
        let f = fahrenheit.read(5, DhtModel::Dht22, true).unwrap();
        assert!((f.temperature - celsius_to_fahrenheit(c.temperature)).abs() < 0.001);
    }
}
