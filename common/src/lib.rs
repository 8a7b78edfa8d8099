pub mod config;
pub mod event;
pub mod hardware;
pub mod names;
pub mod publish;
pub mod rpc;
#[cfg(feature = "host")]
pub mod runtime;
pub mod sensors;
pub mod sonoff;

pub use config::{
    BoardConfig, DeviceConfig, DhtConfig, DhtModel, LightConfig, MotionConfig, NetworkConfig,
    SonoffConfig,
};
pub use event::{build_event, DeviceType, Event, FieldValue};
pub use hardware::{AnalogInput, DhtDriver, DhtError, DhtSample, Gpio};
pub use names::*;
pub use publish::{route, Channels, Delivery};
pub use rpc::{MethodTable, RpcError};
pub use sensors::{Edge, SensorNode, SensorTrigger};
pub use sonoff::{Action, ButtonDebouncer, RelayBoard, SonoffCommand, SonoffTrigger, Target};
