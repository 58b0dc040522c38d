//! Custom error types for the application.
//!
//! This module defines the primary error type, `HoloError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while preparing and running an
//! exposure session.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: a serial link could not be opened, written or read.
//! - **`DeviceTimeout`**: the motion-done polling loop ran out
//!   of attempts before the device reported the expected state.
//! - **`IncompatibleDevice`**: the laser head identity check failed. Always fatal and
//!   never retried; operating an unverified head can destroy it.
//! - **`MalformedRange`**: a user-authored exposure/ignore/power rule could not be
//!   parsed. Raised while building tables, before any device I/O.
//! - **`UserAborted`**: the operator aborted the scan. Not a fault; the session maps it
//!   to a normal `Aborted` outcome.
//! - **`Config`** / **`Configuration`**: loading or validating the configuration.
//! - **`InvalidGrid`**, **`InvalidGeometry`**, **`InvalidArgument`**: rejected inputs.
//!
//! By using `#[from]`, `HoloError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type HoloResult<T> = std::result::Result<T, HoloError>;

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum HoloError {
    /// Open/write/read failure on a serial link.
    #[error("Connection error on '{port}': {message}")]
    Connection {
        /// Port identifier the failure happened on.
        port: String,
        /// Human readable cause.
        message: String,
    },

    /// A bounded polling loop expired.
    #[error("Device '{device}' timed out after {attempts} attempts ({elapsed:?}) waiting for {operation}")]
    DeviceTimeout {
        /// Device name.
        device: String,
        /// What the caller was waiting for.
        operation: String,
        /// Number of polls issued.
        attempts: u32,
        /// Total time spent polling.
        elapsed: Duration,
    },

    /// The connected laser head does not carry the expected identity.
    #[error("Incompatible device '{device}': expected head id {expected}, found {found}")]
    IncompatibleDevice {
        /// Device name.
        device: String,
        /// Expected identity signature.
        expected: String,
        /// What the device reported.
        found: String,
    },

    /// User-authored range rule could not be parsed or is out of the 0-256 domain.
    #[error("Malformed range '{line}': {reason}")]
    MalformedRange {
        /// Offending rule text.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Operator aborted the scan.
    #[error("User aborted the scan")]
    UserAborted,

    /// Configuration failed to load.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Pixel grid is empty or not rectangular.
    #[error("Invalid pixel grid: {0}")]
    InvalidGrid(String),

    /// Film geometry is not strictly positive.
    #[error("Invalid film geometry: {0}")]
    InvalidGeometry(String),

    /// A driver operation received an argument it cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Grid CSV could not be read.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,

    /// One or more devices failed to release cleanly.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<HoloError>),
}

impl HoloError {
    /// Shorthand for a [`HoloError::Connection`].
    pub fn connection(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`HoloError::MalformedRange`].
    pub fn malformed(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRange {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// True for the operator abort, which is a normal terminal outcome.
    pub fn is_user_abort(&self) -> bool {
        matches!(self, Self::UserAborted)
    }
}
