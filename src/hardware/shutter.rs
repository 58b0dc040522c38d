//! Toggle shutter driver.
//!
//! The controller has a single command, `ens`, which flips the shutter
//! between open and closed on every receipt. An exposure is therefore
//! `ens`, hold, `ens`.

use crate::error::{HoloError, HoloResult};
use crate::hardware::serial::{Connector, LinkOwner, SerialLink, SerialPortConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

/// Toggle command.
const TOGGLE: &str = "ens";

/// Quiet time after closing so back-to-back exposures don't flood the controller.
pub const SHUTTER_SETTLE: Duration = Duration::from_millis(50);

/// Driver for the toggle shutter.
pub struct Shutter {
    link: SerialLink,
    exposures: u64,
}

impl LinkOwner for Shutter {
    fn link(&self) -> &SerialLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut SerialLink {
        &mut self.link
    }
}

impl Shutter {
    /// Create a driver on a closed link.
    pub fn new(config: SerialPortConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            link: SerialLink::new("shutter", config, connector),
            exposures: 0,
        }
    }

    /// Open the shutter for `duration_seconds`, close it, then settle.
    pub async fn toggle_exposure(&mut self, duration_seconds: f64) -> HoloResult<()> {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(HoloError::InvalidArgument(format!(
                "exposure duration must be positive, got {duration_seconds}"
            )));
        }
        let hold = Duration::from_secs_f64(duration_seconds);

        self.link.write(TOGGLE).await?;
        sleep(hold).await;
        if let Err(e) = self.link.write(TOGGLE).await {
            error!(error = %e, "failed to close shutter after exposure");
            return Err(e);
        }
        sleep(SHUTTER_SETTLE).await;

        self.exposures += 1;
        debug!(seconds = duration_seconds, count = self.exposures, "exposure done");
        Ok(())
    }

    /// Completed exposures on this link.
    pub fn exposures(&self) -> u64 {
        self.exposures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockConnector, MOCK_SHUTTER_PORT};
    use crate::hardware::serial::SerialDevice;
    use tokio::time::Instant;

    async fn shutter(connector: &MockConnector) -> Shutter {
        let mut shutter = Shutter::new(SerialPortConfig::new(MOCK_SHUTTER_PORT), Arc::new(connector.clone()));
        shutter.open().await.unwrap();
        shutter
    }

    #[tokio::test(start_paused = true)]
    async fn test_exposure_toggles_twice_and_holds() {
        let connector = MockConnector::rig();
        let mut shutter = shutter(&connector).await;

        let started = Instant::now();
        shutter.toggle_exposure(1.5).await.unwrap();

        assert_eq!(connector.commands(MOCK_SHUTTER_PORT), vec!["ens", "ens"]);
        assert!(started.elapsed() >= Duration::from_millis(1550));
        assert_eq!(shutter.exposures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_duration_is_rejected_before_io() {
        let connector = MockConnector::rig();
        let mut shutter = shutter(&connector).await;

        assert!(shutter.toggle_exposure(0.0).await.is_err());
        assert!(shutter.toggle_exposure(f64::NAN).await.is_err());
        assert!(connector.commands(MOCK_SHUTTER_PORT).is_empty());
    }
}
