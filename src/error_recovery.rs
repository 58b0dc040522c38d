//! Bounded polling for device status loops.
//
// Every "query, sleep, query again" loop in the drivers goes through a
// `PollBudget`. Motion polling turns a spent budget into
// `HoloError::DeviceTimeout`; the laser standby loop simply stops there.

use crate::error::{HoloError, HoloResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Defines how often and how long a status loop may poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// The maximum number of status queries.
    pub max_attempts: u32,
    /// The delay between queries.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(100),
        }
    }
}

impl PollPolicy {
    /// Stage motion-done polling: 500 ms between `MD?` queries, two minutes total.
    pub fn motion_done() -> Self {
        Self {
            max_attempts: 240,
            interval: Duration::from_millis(500),
        }
    }

    /// Laser boot standby: `L=0` every 100 ms, 450 times.
    pub fn laser_standby() -> Self {
        Self {
            max_attempts: 450,
            interval: Duration::from_millis(100),
        }
    }

    /// Upper bound on the time a loop under this policy can take.
    pub fn ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    /// Start tracking one polling loop.
    pub fn start(&self, device: impl Into<String>, operation: impl Into<String>) -> PollBudget {
        PollBudget {
            policy: self.clone(),
            device: device.into(),
            operation: operation.into(),
            attempts: 0,
            started: Instant::now(),
        }
    }
}

/// Attempt counter for a single polling loop.
#[derive(Debug)]
pub struct PollBudget {
    policy: PollPolicy,
    device: String,
    operation: String,
    attempts: u32,
    started: Instant,
}

impl PollBudget {
    /// Claim the next attempt, failing with `DeviceTimeout` once the budget is spent.
    pub fn attempt(&mut self) -> HoloResult<u32> {
        if self.attempts >= self.policy.max_attempts {
            return Err(HoloError::DeviceTimeout {
                device: self.device.clone(),
                operation: self.operation.clone(),
                attempts: self.attempts,
                elapsed: self.started.elapsed(),
            });
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Sleep for the policy interval.
    pub async fn pause(&self) {
        sleep(self.policy.interval).await;
    }

    /// Attempts used so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
