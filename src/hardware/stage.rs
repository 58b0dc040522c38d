//! Two-axis motion stage controller driver
//!
//! Newport ESP-style ASCII protocol, one command per line:
//!
//! | Command        | Purpose                               |
//! |----------------|---------------------------------------|
//! | `{axis}MO`     | enable (motor on)                     |
//! | `{axis}VA{v}`  | velocity                              |
//! | `{axis}AC{a}`  | acceleration                          |
//! | `{axis}AG{a}`  | deceleration                          |
//! | `{axis}OR0`    | search for home                       |
//! | `{axis}PA{p}`  | move absolute                         |
//! | `{axis}MD?`    | motion done; reply contains `1` when done |
//!
//! Axis 1 carries the film horizontally (pixel columns), axis 2 vertically
//! (pixel rows).

use crate::error::{HoloError, HoloResult};
use crate::error_recovery::PollPolicy;
use crate::hardware::serial::{Connector, LinkOwner, ReadOutcome, SerialLink, SerialPortConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bytes read for a motion-done reply.
const MOTION_STATUS_BYTES: usize = 4;

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Horizontal, follows pixel columns.
    X,
    /// Vertical, follows pixel rows.
    Y,
}

impl Axis {
    /// Controller axis number.
    pub fn number(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Motion parameters applied to both axes at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Velocity in stage units/second
    #[serde(default = "default_velocity")]
    pub velocity: f64,
    /// Acceleration and deceleration in stage units/second²
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    /// Highest velocity the controller accepts
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    /// Highest acceleration the controller accepts
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: f64,
    /// Home both axes before scanning
    #[serde(default = "default_home_on_start")]
    pub home_on_start: bool,
    /// Extra wait after each confirmed move
    #[serde(default, with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Motion-done polling
    #[serde(default = "PollPolicy::motion_done")]
    pub motion_poll: PollPolicy,
}

fn default_velocity() -> f64 {
    1.0
}

fn default_acceleration() -> f64 {
    4.0
}

fn default_max_velocity() -> f64 {
    100.0
}

fn default_max_acceleration() -> f64 {
    400.0
}

fn default_home_on_start() -> bool {
    true
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            velocity: default_velocity(),
            acceleration: default_acceleration(),
            max_velocity: default_max_velocity(),
            max_acceleration: default_max_acceleration(),
            home_on_start: default_home_on_start(),
            settle_delay: Duration::ZERO,
            motion_poll: PollPolicy::motion_done(),
        }
    }
}

/// Driver for the two-axis stage controller.
pub struct StageController {
    link: SerialLink,
    motion_poll: PollPolicy,
    max_velocity: f64,
    max_acceleration: f64,
}

impl LinkOwner for StageController {
    fn link(&self) -> &SerialLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut SerialLink {
        &mut self.link
    }
}

impl StageController {
    /// Create a driver on a closed link.
    pub fn new(config: SerialPortConfig, connector: Arc<dyn Connector>, settings: &StageSettings) -> Self {
        Self {
            link: SerialLink::new("stage", config, connector),
            motion_poll: settings.motion_poll.clone(),
            max_velocity: settings.max_velocity,
            max_acceleration: settings.max_acceleration,
        }
    }

    /// Enable `axis`, apply velocity and acceleration, and optionally home it.
    ///
    /// Velocity and acceleration are applied independently: a rejected value
    /// is logged and skipped, leaving the controller's own default in place,
    /// and does not stop the remaining steps.
    pub async fn configure(
        &mut self,
        axis: Axis,
        velocity: f64,
        acceleration: f64,
        move_home: bool,
    ) -> HoloResult<()> {
        self.link.write(&format!("{axis}MO")).await?;

        match check_motion_parameter("velocity", velocity, self.max_velocity) {
            Ok(()) => {
                if let Err(e) = self.link.write(&format!("{axis}VA{velocity}")).await {
                    warn!(%axis, velocity, error = %e, "velocity rejected, keeping controller default");
                }
            }
            Err(reason) => warn!(%axis, velocity, %reason, "invalid velocity, keeping controller default"),
        }

        match check_motion_parameter("acceleration", acceleration, self.max_acceleration) {
            Ok(()) => {
                for command in [format!("{axis}AC{acceleration}"), format!("{axis}AG{acceleration}")] {
                    if let Err(e) = self.link.write(&command).await {
                        warn!(%axis, acceleration, error = %e, "acceleration rejected, keeping controller default");
                        break;
                    }
                }
            }
            Err(reason) => warn!(%axis, acceleration, %reason, "invalid acceleration, keeping controller default"),
        }

        if move_home {
            self.home(axis).await?;
        }
        Ok(())
    }

    /// Send `axis` to its home switch and wait for it to get there.
    pub async fn home(&mut self, axis: Axis) -> HoloResult<()> {
        info!(%axis, "homing axis");
        self.link.write(&format!("{axis}OR0")).await?;
        self.wait_motion_done(axis).await
    }

    /// Move `axis` to `position` (stage units) and wait until it stops.
    pub async fn move_absolute(&mut self, axis: Axis, position: f64, extra_delay: Duration) -> HoloResult<()> {
        if !position.is_finite() {
            return Err(HoloError::InvalidArgument(format!(
                "axis {axis} target position {position} is not finite"
            )));
        }
        self.link.write(&format!("{axis}PA{position:.4}")).await?;
        self.wait_motion_done(axis).await?;
        if !extra_delay.is_zero() {
            tokio::time::sleep(extra_delay).await;
        }
        debug!(%axis, position, "move complete");
        Ok(())
    }

    /// Poll `{axis}MD?` until the controller reports motion done.
    ///
    /// Fails with [`HoloError::DeviceTimeout`] once the motion poll budget is spent.
    pub async fn wait_motion_done(&mut self, axis: Axis) -> HoloResult<()> {
        let mut budget = self
            .motion_poll
            .start(self.link.name(), format!("axis {axis} motion done"));
        loop {
            budget.attempt()?;
            if self.motion_done(axis).await? {
                trace!(%axis, polls = budget.attempts(), "motion done");
                return Ok(());
            }
            budget.pause().await;
        }
    }

    async fn motion_done(&mut self, axis: Axis) -> HoloResult<bool> {
        self.link.write(&format!("{axis}MD?")).await?;
        match self.link.read(MOTION_STATUS_BYTES).await? {
            ReadOutcome::Data(bytes) => Ok(bytes.contains(&b'1')),
            ReadOutcome::NoData => {
                debug!(%axis, "no motion status reply");
                Ok(false)
            }
        }
    }
}

fn check_motion_parameter(name: &str, value: f64, max: f64) -> Result<(), String> {
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("{name} must be positive, got {value}"));
    }
    if value > max {
        return Err(format!("{name} {value} exceeds controller limit {max}"));
    }
    Ok(())
}
