pub const SENSOR_DHT1: &str = "dht1";
pub const SENSOR_LIGHT1: &str = "light1";
pub const SENSOR_MOTION1: &str = "motion1";

pub const FIELD_TEMP: &str = "temp";
pub const FIELD_HUMIDITY: &str = "humidity";
pub const FIELD_LEVEL: &str = "level";
pub const FIELD_MOTION_DETECTED: &str = "motion_detected";
pub const FIELD_RELAY_ON: &str = "relay_on";
pub const FIELD_BUTTON_DISABLED: &str = "button_disabled";
pub const FIELD_LED_DISABLED: &str = "led_disabled";
pub const FIELD_ERR: &str = "err";
pub const FIELD_MSG: &str = "msg";

pub const METHOD_DHT1_READ: &str = "DHT1.Read";
pub const METHOD_LIGHT1_READ: &str = "Light1.Read";

pub const METHOD_RELAY_ON: &str = "Sonoff.Relay.On";
pub const METHOD_RELAY_OFF: &str = "Sonoff.Relay.Off";
pub const METHOD_RELAY_STATUS: &str = "Sonoff.Relay.Status";
pub const METHOD_BUTTON_ENABLE: &str = "Sonoff.Button.Enable";
pub const METHOD_BUTTON_DISABLE: &str = "Sonoff.Button.Disable";
pub const METHOD_BUTTON_STATUS: &str = "Sonoff.Button.Status";
pub const METHOD_LED_ENABLE: &str = "Sonoff.LED.Enable";
pub const METHOD_LED_DISABLE: &str = "Sonoff.LED.Disable";
pub const METHOD_LED_STATUS: &str = "Sonoff.LED.Status";
