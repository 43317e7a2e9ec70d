//! sensorhub: bridge between a serial JSON sensor board and Modbus/TCP
//!
//! The bridge polls the sensor board over a serial link, republishes the
//! readings as holding registers on a Modbus/TCP server and upgrades the
//! board firmware in the field when an upgrade request file shows up.
//!
//! The internal boot helpers are kept in a separate, hidden module to keep
//! logger setup out of the generated documentation.

#[doc(hidden)]
pub mod boot;
pub mod bridge;
pub mod config;
pub mod protocol;

pub use bridge::Bridge;
pub use config::BridgeConfig;
