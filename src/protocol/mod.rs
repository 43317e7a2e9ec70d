//! Wire-level pieces of the sensor board link: the byte transport, the
//! command vocabulary, JSON framing, the reset line and the firmware
//! transfer hand-off.

pub mod framer;
pub mod message;
pub mod reset;
pub mod transfer;
pub mod transport;

pub use framer::MessageFramer;
pub use message::{InboundMessage, SensorCommand};
pub use reset::ResetLine;
pub use transfer::FirmwareTransfer;
pub use transport::Transport;
