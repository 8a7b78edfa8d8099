use thiserror::Error;

use crate::{
    config::SonoffConfig,
    event::{build_event, DeviceType, Event, FieldValue},
    hardware::Gpio,
    names::*,
    publish::{route, Channels, Delivery},
    rpc::RpcError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Relay,
    Button,
    Led,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    TurnOn,
    TurnOff,
    GetState,
    Enable,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SonoffCommand {
    pub target: Target,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SonoffTrigger {
    Command(SonoffCommand),
    /// Physical button press, already debounced.
    ButtonPressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no or invalid action provided")]
    InvalidRelayAction,
    #[error("no or invalid action provided to callback")]
    InvalidCallbackAction,
}

impl From<CommandError> for RpcError {
    fn from(err: CommandError) -> Self {
        RpcError::internal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayBoardState {
    pub relay_on: bool,
    pub led_disabled: bool,
    pub button_disabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct PolicyFlags {
    led_disabled: bool,
    button_disabled: bool,
}

/// Relay, LED and button of a Sonoff Basic style plug.
///
/// The relay state is never cached: every report reads the relay pin back,
/// so a write that did not take effect shows up in the reply.
#[derive(Debug)]
pub struct RelayBoard<G> {
    device_id: String,
    config: SonoffConfig,
    gpio: G,
    flags: PolicyFlags,
}

impl<G: Gpio> RelayBoard<G> {
    /// Takes ownership of the pins and drives them to the power-on state:
    /// LED off, relay off.
    pub fn new(device_id: impl Into<String>, config: SonoffConfig, gpio: G) -> Self {
        let mut board = Self {
            device_id: device_id.into(),
            config,
            gpio,
            flags: PolicyFlags::default(),
        };
        board.write_led(false);
        board.gpio.write(board.config.relay_pin, false);
        board
    }

    pub fn gpio(&self) -> &G {
        &self.gpio
    }

    pub fn gpio_mut(&mut self) -> &mut G {
        &mut self.gpio
    }

    pub fn relay_on(&self) -> bool {
        self.gpio.read(self.config.relay_pin)
    }

    pub fn led_lit(&self) -> bool {
        self.gpio.read(self.config.led_pin) != self.config.led_active_low
    }

    pub fn state(&self) -> RelayBoardState {
        RelayBoardState {
            relay_on: self.relay_on(),
            led_disabled: self.flags.led_disabled,
            button_disabled: self.flags.button_disabled,
        }
    }

    pub fn handle(&mut self, trigger: SonoffTrigger) -> Vec<Delivery> {
        match trigger {
            SonoffTrigger::Command(command) => match self.execute(command) {
                Ok(event) => {
                    // Status queries answer the caller only; telemetry is for changes.
                    let channels = if command.action == Action::GetState {
                        Channels::reply_only()
                    } else {
                        Channels::reply_and_mqtt(&self.config.mqtt_topic)
                    };
                    route(event, channels)
                }
                Err(err) => vec![Delivery::ReplyError(err.into())],
            },
            SonoffTrigger::ButtonPressed => match self.button_pressed() {
                Some(event) => route(event, Channels::mqtt(&self.config.mqtt_topic)),
                None => Vec::new(),
            },
        }
    }

    /// Applies one command and returns the status event describing the
    /// affected target. Invalid pairings touch no hardware.
    pub fn execute(&mut self, command: SonoffCommand) -> Result<Event, CommandError> {
        match (command.target, command.action) {
            (Target::Relay, Action::TurnOn) => {
                self.apply_led(true);
                self.gpio.write(self.config.relay_pin, true);
                Ok(self.relay_event())
            }
            (Target::Relay, Action::TurnOff) => {
                self.apply_led(false);
                self.gpio.write(self.config.relay_pin, false);
                Ok(self.relay_event())
            }
            (Target::Relay, Action::GetState) => Ok(self.relay_event()),
            (Target::Relay, _) => Err(CommandError::InvalidRelayAction),

            (Target::Button, Action::Enable) => {
                self.flags.button_disabled = false;
                Ok(self.button_event())
            }
            (Target::Button, Action::Disable) => {
                self.flags.button_disabled = true;
                Ok(self.button_event())
            }
            (Target::Button, Action::GetState) => Ok(self.button_event()),

            (Target::Led, Action::Enable) => {
                self.flags.led_disabled = false;
                let relay_on = self.relay_on();
                self.apply_led(relay_on);
                Ok(self.led_event())
            }
            (Target::Led, Action::Disable) => {
                self.flags.led_disabled = true;
                self.apply_led(false);
                Ok(self.led_event())
            }
            (Target::Led, Action::GetState) => Ok(self.led_event()),

            (Target::Button | Target::Led, _) => Err(CommandError::InvalidCallbackAction),
        }
    }

    /// Flips the LED and relay pins directly.
    ///
    /// This does not consult `led_disabled`: with the LED disabled a press
    /// lights it until the next explicit relay or LED command.
    fn button_pressed(&mut self) -> Option<Event> {
        if self.flags.button_disabled {
            return None;
        }

        self.gpio.toggle(self.config.led_pin);
        self.gpio.toggle(self.config.relay_pin);
        Some(self.relay_event())
    }

    fn apply_led(&mut self, on: bool) {
        self.write_led(on && !self.flags.led_disabled);
    }

    fn write_led(&mut self, lit: bool) {
        self.gpio
            .write(self.config.led_pin, lit != self.config.led_active_low);
    }

    fn relay_event(&self) -> Event {
        self.status_event(FIELD_RELAY_ON, self.relay_on())
    }

    fn button_event(&self) -> Event {
        self.status_event(FIELD_BUTTON_DISABLED, self.flags.button_disabled)
    }

    fn led_event(&self) -> Event {
        self.status_event(FIELD_LED_DISABLED, self.flags.led_disabled)
    }

    fn status_event(&self, field: &str, value: bool) -> Event {
        build_event(
            &self.device_id,
            DeviceType::Sonoff,
            None,
            vec![(field, FieldValue::Flag(value))],
        )
    }
}

/// Drops presses that arrive within `window_ms` of the last accepted one.
///
/// Timestamps are milliseconds since boot truncated to `u32`, as stamped by
/// the button interrupt. Differences use wrapping arithmetic so the counter
/// rolling over after ~49.7 days does not lock the button out.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    window_ms: u32,
    last_accepted_ms: Option<u32>,
}

impl ButtonDebouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: u32::try_from(window_ms).unwrap_or(u32::MAX),
            last_accepted_ms: None,
        }
    }

    pub fn accept(&mut self, now_ms: u32) -> bool {
        let accepted = self
            .last_accepted_ms
            .map(|last| now_ms.wrapping_sub(last) >= self.window_ms)
            .unwrap_or(true);
        if accepted {
            self.last_accepted_ms = Some(now_ms);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hardware::sim::SimGpio;

    const TOPIC: &str = "home/plug";

    fn board(topic: &str) -> RelayBoard<SimGpio> {
        let config = SonoffConfig {
            mqtt_topic: topic.to_string(),
            ..SonoffConfig::default()
        };
        RelayBoard::new("plug1", config, SimGpio::new())
    }

    fn cmd(target: Target, action: Action) -> SonoffTrigger {
        SonoffTrigger::Command(SonoffCommand { target, action })
    }

    fn reply_json(deliveries: &[Delivery]) -> String {
        match deliveries.first() {
            Some(Delivery::Reply(event)) => event.to_json().unwrap(),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    fn assert_led_policy(board: &RelayBoard<SimGpio>) {
        let state = board.state();
        assert_eq!(
            board.led_lit(),
            state.relay_on && !state.led_disabled,
            "led out of policy for {state:?}"
        );
    }

    #[test]
    fn power_on_state_is_all_off() {
        let board = board("");
        assert!(!board.relay_on());
        assert!(!board.led_lit());
        // LED is active low: off means the pin is high.
        assert!(board.gpio().read(13));
        assert_eq!(board.state(), RelayBoardState::default());
    }

    #[test]
    fn relay_round_trip_reports_read_back() {
        let mut board = board("");

        board.handle(cmd(Target::Relay, Action::TurnOn));
        assert_eq!(
            reply_json(&board.handle(cmd(Target::Relay, Action::GetState))),
            r#"{"device_id":"plug1","device_type":"sonoff","relay_on":1}"#
        );

        board.handle(cmd(Target::Relay, Action::TurnOff));
        assert_eq!(
            reply_json(&board.handle(cmd(Target::Relay, Action::GetState))),
            r#"{"device_id":"plug1","device_type":"sonoff","relay_on":0}"#
        );
    }

    #[test]
    fn stuck_relay_is_reported_from_hardware() {
        let mut board = board("");
        board.gpio_mut().set_stuck(12, true);

        let deliveries = board.handle(cmd(Target::Relay, Action::TurnOn));
        assert_eq!(
            reply_json(&deliveries),
            r#"{"device_id":"plug1","device_type":"sonoff","relay_on":0}"#
        );
    }

    #[test]
    fn led_follows_policy_across_commands() {
        let mut board = board(TOPIC);
        let sequence = [
            cmd(Target::Relay, Action::TurnOn),
            cmd(Target::Led, Action::Disable),
            cmd(Target::Relay, Action::TurnOff),
            cmd(Target::Relay, Action::TurnOn),
            cmd(Target::Led, Action::Enable),
            cmd(Target::Led, Action::Disable),
            cmd(Target::Led, Action::Enable),
            cmd(Target::Relay, Action::TurnOff),
            cmd(Target::Led, Action::Enable),
        ];

        for trigger in sequence {
            board.handle(trigger);
            assert_led_policy(&board);
        }
    }

    #[test]
    fn led_enable_relights_when_relay_is_on() {
        let mut board = board("");
        board.handle(cmd(Target::Led, Action::Disable));
        board.handle(cmd(Target::Relay, Action::TurnOn));
        assert!(!board.led_lit());

        let deliveries = board.handle(cmd(Target::Led, Action::Enable));
        assert!(board.led_lit());
        assert_eq!(
            reply_json(&deliveries),
            r#"{"device_id":"plug1","device_type":"sonoff","led_disabled":0}"#
        );
    }

    #[test]
    fn led_disable_forces_led_off_immediately() {
        let mut board = board("");
        board.handle(cmd(Target::Relay, Action::TurnOn));
        assert!(board.led_lit());

        board.handle(cmd(Target::Led, Action::Disable));
        assert!(!board.led_lit());
        assert!(board.relay_on());
    }

    #[test]
    fn disabled_button_ignores_presses() {
        let mut board = board(TOPIC);
        board.handle(cmd(Target::Button, Action::Disable));
        board.gpio_mut().clear_writes();

        for _ in 0..5 {
            assert!(board.handle(SonoffTrigger::ButtonPressed).is_empty());
        }
        assert!(board.gpio().writes().is_empty());
        assert!(!board.relay_on());

        board.handle(cmd(Target::Button, Action::Enable));
        let deliveries = board.handle(SonoffTrigger::ButtonPressed);
        assert!(board.relay_on());
        assert!(board.led_lit());
        assert_eq!(
            deliveries,
            vec![Delivery::Publish {
                topic: TOPIC.to_string(),
                event: build_event(
                    "plug1",
                    DeviceType::Sonoff,
                    None,
                    vec![(FIELD_RELAY_ON, FieldValue::Flag(true))],
                ),
            }]
        );
    }

    #[test]
    fn button_press_without_topic_is_silent() {
        let mut board = board("");
        assert!(board.handle(SonoffTrigger::ButtonPressed).is_empty());
        assert!(board.relay_on());
    }

    #[test]
    fn button_press_bypasses_led_policy() {
        let mut board = board("");
        board.handle(cmd(Target::Led, Action::Disable));

        board.handle(SonoffTrigger::ButtonPressed);
        assert!(board.relay_on());
        assert!(board.led_lit());

        // The next explicit command restores the policy.
        board.handle(cmd(Target::Relay, Action::TurnOn));
        assert_led_policy(&board);
    }

    #[test]
    fn status_queries_never_publish() {
        let mut board = board(TOPIC);

        for target in [Target::Relay, Target::Button, Target::Led] {
            let deliveries = board.handle(cmd(target, Action::GetState));
            assert_eq!(deliveries.len(), 1);
            assert!(deliveries[0].is_reply());
        }
    }

    #[test]
    fn state_changes_publish_iff_topic_configured() {
        let changes = [
            cmd(Target::Relay, Action::TurnOn),
            cmd(Target::Relay, Action::TurnOff),
            cmd(Target::Button, Action::Disable),
            cmd(Target::Button, Action::Enable),
            cmd(Target::Led, Action::Disable),
            cmd(Target::Led, Action::Enable),
        ];

        let mut with_topic = board(TOPIC);
        let mut without_topic = board("");
        for trigger in changes {
            let published = with_topic.handle(trigger);
            assert_eq!(published.len(), 2);
            assert!(published[0].is_reply());
            assert!(matches!(&published[1], Delivery::Publish { topic, .. } if topic == TOPIC));

            let silent = without_topic.handle(trigger);
            assert_eq!(silent.len(), 1);
            assert!(silent[0].is_reply());
        }
    }

    #[test]
    fn invalid_actions_return_500_without_side_effects() {
        let mut board = board(TOPIC);
        board.gpio_mut().clear_writes();

        let relay = board.handle(cmd(Target::Relay, Action::Enable));
        assert_eq!(
            relay,
            vec![Delivery::ReplyError(RpcError::internal(
                "no or invalid action provided"
            ))]
        );

        for target in [Target::Button, Target::Led] {
            for action in [Action::TurnOn, Action::TurnOff] {
                let deliveries = board.handle(cmd(target, action));
                let [Delivery::ReplyError(err)] = deliveries.as_slice() else {
                    panic!("expected error for {target:?}/{action:?}");
                };
                assert_eq!(err.code, 500);
                assert!(err.message.contains("no or invalid action provided"));
            }
        }

        assert!(board.gpio().writes().is_empty());
        assert_eq!(board.state(), RelayBoardState::default());
    }

    #[test]
    fn button_status_reports_flag() {
        let mut board = board("");
        board.handle(cmd(Target::Button, Action::Disable));
        assert_eq!(
            reply_json(&board.handle(cmd(Target::Button, Action::GetState))),
            r#"{"device_id":"plug1","device_type":"sonoff","button_disabled":1}"#
        );

        let reply = board.execute(SonoffCommand {
            target: Target::Button,
            action: Action::Enable,
        });
        assert_eq!(
            reply.unwrap().field(FIELD_BUTTON_DISABLED).and_then(FieldValue::as_flag),
            Some(false)
        );
    }

    #[test]
    fn active_high_led_wiring() {
        let config = SonoffConfig {
            led_active_low: false,
            ..SonoffConfig::default()
        };
        let mut board = RelayBoard::new("plug1", config, SimGpio::new());

        board.handle(cmd(Target::Relay, Action::TurnOn));
        assert!(board.gpio().read(13));
        assert!(board.led_lit());
    }

    #[test]
    fn debouncer_drops_presses_inside_window() {
        let mut debouncer = ButtonDebouncer::new(500);

        assert!(debouncer.accept(1_000));
        assert!(!debouncer.accept(1_200));
        assert!(!debouncer.accept(1_499));
        assert!(debouncer.accept(1_500));
        assert!(debouncer.accept(5_000));
    }

    #[test]
    fn debouncer_survives_millisecond_counter_wrap() {
        let mut debouncer = ButtonDebouncer::new(500);
        assert!(debouncer.accept(u32::MAX - 100));

        // 200ms later, across the wrap: still a bounce.
        assert!(!debouncer.accept(99));
        // 1s after the first press.
        assert!(debouncer.accept(899));
        assert!(!debouncer.accept(1_000));
        assert!(debouncer.accept(10_000));
        assert!(debouncer.accept(3_600_000));
    }
}
