//! Core library for the holo_daq exposure controller.
//!
//! Writes a greyscale raster onto holographic film point by point: a
//! two-axis stage positions the film, a toggle shutter times each exposure
//! and a laser head sets the power. All three sit on their own serial port.
//!
//! - [`exposure`] turns user range rules into per-intensity exposure and power tables
//! - [`raster`] holds the pixel grid and maps pixels to stage positions
//! - [`estimator`] predicts how long a scan will take
//! - [`sequencer`] drives the devices pixel by pixel
//! - [`session`] acquires and releases the rig around a scan
//! - [`control`] carries run/pause/abort from the operator to the scan
//! - [`hardware`] has the serial drivers and a mock rig for tests

pub mod config;
pub mod control;
pub mod error;
pub mod error_recovery;
pub mod estimator;
pub mod exposure;
pub mod hardware;
pub mod raster;
pub mod sequencer;
pub mod session;

pub use error::{HoloError, HoloResult};
