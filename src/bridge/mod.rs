//! The bridge itself: register map, link threads, Modbus mirror, polling,
//! firmware upgrade and the supervisor tying them together.

pub mod identity;
pub mod link;
pub mod mirror;
pub mod mode;
pub mod poller;
pub mod register_map;
pub mod supervisor;
pub mod upgrade;

pub use identity::DeviceIdentity;
pub use link::SensorLink;
pub use mirror::{MirrorServer, ModbusMirror};
pub use mode::{BridgeMode, ModeGate};
pub use poller::PollingScheduler;
pub use register_map::{RegisterMap, SensorMapEntry};
pub use supervisor::Bridge;
pub use upgrade::{UpgradeOutcome, Upgrader};
