//! Serial device drivers for the exposure rig.
//!
//! Each driver owns one [`serial::SerialLink`] and adds its device's command
//! vocabulary on top. The shared open/write/read/close surface is the
//! [`serial::SerialDevice`] capability, implemented for every driver through
//! [`serial::LinkOwner`].

pub mod laser;
pub mod mock;
pub mod serial;
pub mod shutter;
pub mod stage;

pub use laser::{LaserHead, LaserSettings};
pub use serial::{
    Connector, ReadOutcome, SerialDevice, SerialLink, SerialPortConfig, TokioSerialConnector,
    Transport,
};
pub use shutter::Shutter;
pub use stage::{Axis, StageController, StageSettings};
