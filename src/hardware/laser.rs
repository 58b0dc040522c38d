//! Laser head driver.
//!
//! Protocol Overview:
//! - `L=1` / `L=0`: emission on / off
//! - `P={mw}`: output power in milliwatts
//! - `?HID`: head identity; the reply echoes the query then carries the id
//! - `?P`: current output power, same echo-then-value reply
//!
//! The head identity is checked before anything else is sent. A head that
//! does not report the expected id is refused outright: driving a different
//! head with these power settings can destroy it.

use crate::error::{HoloError, HoloResult};
use crate::error_recovery::PollPolicy;
use crate::hardware::serial::{
    parse_numeric_reply, Connector, LinkOwner, ReadOutcome, SerialLink, SerialPortConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Head id of the supported laser.
pub const EXPECTED_HEAD_ID: f64 = 42185.0;

/// A power reading at or above this means the head is emitting.
pub const ACTIVE_POWER_THRESHOLD_MW: f64 = 0.4;

/// Bytes read for `?HID` and `?P` replies.
const QUERY_REPLY_BYTES: usize = 30;

/// Laser limits and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserSettings {
    /// Highest power the head may be driven to, in mW
    pub max_power_mw: f64,
    /// Wait after each power change for the output to stabilise
    #[serde(default, with = "humantime_serde")]
    pub power_change_pause: Duration,
    /// Identity the head must report
    #[serde(default = "default_head_id")]
    pub expected_head_id: f64,
    /// Bounds the wait for a booting head to answer
    #[serde(default = "PollPolicy::laser_standby")]
    pub standby_poll: PollPolicy,
}

fn default_head_id() -> f64 {
    EXPECTED_HEAD_ID
}

impl Default for LaserSettings {
    fn default() -> Self {
        Self {
            max_power_mw: 10.0,
            power_change_pause: Duration::ZERO,
            expected_head_id: EXPECTED_HEAD_ID,
            standby_poll: PollPolicy::laser_standby(),
        }
    }
}

/// Driver for the laser head.
pub struct LaserHead {
    link: SerialLink,
    max_power_mw: f64,
    power_change_pause: Duration,
    expected_head_id: f64,
    standby_poll: PollPolicy,
    /// Set when a zero-power request switched emission off
    off_by_zero: bool,
    power_changes: u64,
}

impl LinkOwner for LaserHead {
    fn link(&self) -> &SerialLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut SerialLink {
        &mut self.link
    }
}

impl LaserHead {
    /// Create a driver on a closed link.
    pub fn new(config: SerialPortConfig, connector: Arc<dyn Connector>, settings: &LaserSettings) -> Self {
        Self {
            link: SerialLink::new("laser", config, connector),
            max_power_mw: settings.max_power_mw,
            power_change_pause: settings.power_change_pause,
            expected_head_id: settings.expected_head_id,
            standby_poll: settings.standby_poll.clone(),
            off_by_zero: false,
            power_changes: 0,
        }
    }

    /// Set the power ceiling and the post-change pause.
    pub fn configure(&mut self, max_power_mw: f64, power_change_pause: Duration) -> HoloResult<()> {
        if !max_power_mw.is_finite() || max_power_mw <= 0.0 {
            return Err(HoloError::InvalidArgument(format!(
                "maximum laser power must be positive, got {max_power_mw}"
            )));
        }
        warn!(max_power_mw, "laser maximum power set");
        self.max_power_mw = max_power_mw;
        self.power_change_pause = power_change_pause;
        Ok(())
    }

    /// Current power ceiling in mW.
    pub fn max_power_mw(&self) -> f64 {
        self.max_power_mw
    }

    /// Drive the head to `target_mw`, returning the power actually requested.
    ///
    /// Targets above the ceiling are clamped to it. A zero target switches
    /// emission off instead of requesting zero power; the next non-zero
    /// target switches it back on.
    pub async fn set_power(&mut self, target_mw: f64) -> HoloResult<f64> {
        if !target_mw.is_finite() || target_mw < 0.0 {
            return Err(HoloError::InvalidArgument(format!(
                "laser power must be non-negative, got {target_mw}"
            )));
        }

        if target_mw == 0.0 {
            self.turn_off().await?;
            self.off_by_zero = true;
            return Ok(0.0);
        }

        let applied = if target_mw > self.max_power_mw {
            warn!(
                requested_mw = target_mw,
                max_power_mw = self.max_power_mw,
                "requested power above maximum, clamping"
            );
            self.max_power_mw
        } else {
            target_mw
        };

        self.link.write(&format!("P={applied:.2}")).await?;
        if self.off_by_zero {
            self.turn_on().await?;
        }
        self.power_changes += 1;
        debug!(power_mw = applied, "laser power set");

        if !self.power_change_pause.is_zero() {
            sleep(self.power_change_pause).await;
        }
        Ok(applied)
    }

    /// Power commands issued on this link.
    pub fn power_changes(&self) -> u64 {
        self.power_changes
    }

    /// Start emission.
    pub async fn turn_on(&mut self) -> HoloResult<()> {
        self.link.write("L=1").await?;
        self.off_by_zero = false;
        info!("laser on");
        Ok(())
    }

    /// Stop emission.
    pub async fn turn_off(&mut self) -> HoloResult<()> {
        self.link.write("L=0").await?;
        info!("laser off");
        Ok(())
    }

    /// Verify the head identity, returning the id it reported.
    pub async fn identify(&mut self) -> HoloResult<f64> {
        self.link.write("?HID").await?;
        let expected = self.expected_head_id;
        let incompatible = |found: String| HoloError::IncompatibleDevice {
            device: "laser".to_string(),
            expected: format!("{expected}"),
            found,
        };

        let reply = match self.link.read(QUERY_REPLY_BYTES).await? {
            ReadOutcome::Data(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            ReadOutcome::NoData => return Err(incompatible("no reply".to_string())),
        };
        let Some(head_id) = parse_numeric_reply(&reply, "?HID") else {
            return Err(incompatible(reply.trim().to_string()));
        };
        if (head_id - expected).abs() > f64::EPSILON * expected.abs().max(1.0) {
            return Err(incompatible(format!("{head_id}")));
        }

        info!(head_id, "laser head verified");
        Ok(head_id)
    }

    /// Read the output power; `None` when the head does not answer.
    pub async fn read_power(&mut self) -> HoloResult<Option<f64>> {
        self.link.write("?P").await?;
        Ok(self
            .link
            .read(QUERY_REPLY_BYTES)
            .await?
            .text()
            .and_then(|reply| parse_numeric_reply(&reply, "?P")))
    }

    /// Make sure the head is not emitting before the scan is set up.
    ///
    /// A head reading at least [`ACTIVE_POWER_THRESHOLD_MW`] is switched off
    /// once. Anything lower, or no reading at all, means the head is off or
    /// still booting: `L=0` is repeated at the standby interval until the
    /// standby budget is used up, which is the normal end of the wait.
    pub async fn ensure_inactive(&mut self) -> HoloResult<()> {
        let reading = self.read_power().await?;
        if let Some(power_mw) = reading.filter(|p| *p >= ACTIVE_POWER_THRESHOLD_MW) {
            warn!(power_mw, "laser was emitting, switching off");
            return self.turn_off().await;
        }

        let mut budget = self.standby_poll.start(self.link.name(), "laser standby");
        info!(
            power_mw = ?reading,
            wait = ?self.standby_poll.ceiling(),
            "holding laser in standby"
        );
        while budget.attempt().is_ok() {
            self.link.write("L=0").await?;
            budget.pause().await;
        }
        debug!(commands = budget.attempts(), "laser standby complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockBehavior, MockConnector, MOCK_LASER_PORT};
    use crate::hardware::serial::SerialDevice;

    async fn laser(connector: &MockConnector, settings: LaserSettings) -> LaserHead {
        let mut laser = LaserHead::new(SerialPortConfig::new(MOCK_LASER_PORT), Arc::new(connector.clone()), &settings);
        laser.open().await.unwrap();
        laser
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_accepts_expected_head() {
        let connector = MockConnector::rig();
        let mut laser = laser(&connector, LaserSettings::default()).await;
        assert_eq!(laser.identify().await.unwrap(), 42185.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_rejects_other_head() {
        let connector = MockConnector::new();
        connector.register(
            MOCK_LASER_PORT,
            MockBehavior::Laser {
                head_id: 31337.0,
                power_mw: Some(0.0),
            },
        );
        let mut laser = laser(&connector, LaserSettings::default()).await;

        let err = laser.identify().await.unwrap_err();
        assert!(matches!(err, HoloError::IncompatibleDevice { .. }));
        assert!(err.to_string().contains("31337"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_without_reply_is_fatal() {
        let connector = MockConnector::new();
        connector.register(MOCK_LASER_PORT, MockBehavior::Silent);
        let mut laser = laser(&connector, LaserSettings::default()).await;

        assert!(matches!(
            laser.identify().await,
            Err(HoloError::IncompatibleDevice { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_power_clamps_to_max() {
        let connector = MockConnector::rig();
        let mut laser = laser(&connector, LaserSettings::default()).await;
        laser.configure(8.0, Duration::ZERO).unwrap();

        assert_eq!(laser.set_power(12.0).await.unwrap(), 8.0);
        assert_eq!(connector.commands(MOCK_LASER_PORT), vec!["P=8.00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_power_switches_off_then_back_on() {
        let connector = MockConnector::rig();
        let mut laser = laser(&connector, LaserSettings::default()).await;

        laser.set_power(0.0).await.unwrap();
        laser.set_power(3.5).await.unwrap();
        laser.set_power(4.0).await.unwrap();

        assert_eq!(
            connector.commands(MOCK_LASER_PORT),
            vec!["L=0", "P=3.50", "L=1", "P=4.00"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_change_pause_is_honoured() {
        let connector = MockConnector::rig();
        let mut laser = laser(&connector, LaserSettings::default()).await;
        laser.configure(10.0, Duration::from_secs(2)).unwrap();

        let started = tokio::time::Instant::now();
        laser.set_power(5.0).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_inactive_with_answering_head() {
        let connector = MockConnector::new();
        connector.register(
            MOCK_LASER_PORT,
            MockBehavior::Laser {
                head_id: EXPECTED_HEAD_ID,
                power_mw: Some(2.0),
            },
        );
        let mut laser = laser(&connector, LaserSettings::default()).await;

        laser.ensure_inactive().await.unwrap();
        assert_eq!(connector.commands(MOCK_LASER_PORT), vec!["?P", "L=0"]);
    }

    fn short_standby() -> LaserSettings {
        LaserSettings {
            standby_poll: PollPolicy {
                max_attempts: 3,
                interval: Duration::from_millis(100),
            },
            ..LaserSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_inactive_holds_idle_head_in_standby() {
        let connector = MockConnector::rig();
        let mut laser = laser(&connector, short_standby()).await;

        let started = tokio::time::Instant::now();
        laser.ensure_inactive().await.unwrap();

        assert_eq!(
            connector.commands(MOCK_LASER_PORT),
            vec!["?P", "L=0", "L=0", "L=0"]
        );
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_inactive_below_threshold_is_not_a_single_off() {
        let connector = MockConnector::new();
        connector.register(
            MOCK_LASER_PORT,
            MockBehavior::Laser {
                head_id: EXPECTED_HEAD_ID,
                power_mw: Some(0.39),
            },
        );
        let mut laser = laser(&connector, short_standby()).await;

        laser.ensure_inactive().await.unwrap();
        assert_eq!(connector.count(MOCK_LASER_PORT, "L=0"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_inactive_waits_out_silent_head() {
        let connector = MockConnector::new();
        connector.register(
            MOCK_LASER_PORT,
            MockBehavior::Laser {
                head_id: EXPECTED_HEAD_ID,
                power_mw: None,
            },
        );
        let mut laser = laser(&connector, short_standby()).await;

        laser.ensure_inactive().await.unwrap();
        assert_eq!(connector.count(MOCK_LASER_PORT, "?P"), 1);
        assert_eq!(connector.count(MOCK_LASER_PORT, "L=0"), 3);
    }

    #[test]
    fn test_default_standby_matches_boot_time() {
        let policy = LaserSettings::default().standby_poll;
        assert_eq!(policy.max_attempts, 450);
        assert_eq!(policy.ceiling(), Duration::from_secs(45));
    }

    #[test]
    fn test_configure_rejects_non_positive_max() {
        let connector = MockConnector::rig();
        let mut laser = LaserHead::new(
            SerialPortConfig::new(MOCK_LASER_PORT),
            Arc::new(connector),
            &LaserSettings::default(),
        );
        assert!(laser.configure(0.0, Duration::ZERO).is_err());
        assert!(laser.configure(-1.0, Duration::ZERO).is_err());
        assert_eq!(laser.max_power_mw(), 10.0);
    }
}
