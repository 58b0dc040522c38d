//! Mock Hardware Implementations
//!
//! Provides a simulated serial rig for testing without physical hardware.
//! [`MockConnector`] hands out transports that behave like the stage
//! controller, the shutter and the laser head, and records every command in a
//! single journal shared by all ports, so tests can assert on cross-device
//! ordering.
//!
//! # Available Mocks
//!
//! - `MockBehavior::Stage` - answers `MD?` with `0` for a configurable number
//!   of polls after each move/home, then `1`
//! - `MockBehavior::Shutter` - accepts `ens`, never replies
//! - `MockBehavior::Laser` - answers `?HID` and `?P`
//! - `MockBehavior::Silent` - accepts everything, never replies
//!
//! Replies are queued synchronously while the command is written, so no
//! background tasks are involved and paused tokio time works as expected.

use crate::error::{HoloError, HoloResult};
use crate::hardware::serial::{Connector, SerialPortConfig, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Port names used by [`MockConnector::rig`].
pub const MOCK_STAGE_PORT: &str = "mock-stage";
/// Shutter port of the standard rig.
pub const MOCK_SHUTTER_PORT: &str = "mock-shutter";
/// Laser port of the standard rig.
pub const MOCK_LASER_PORT: &str = "mock-laser";

/// How a simulated device answers commands.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Accepts every command, never replies.
    Silent,
    /// Newport-style stage controller.
    Stage {
        /// `MD?` polls answered with "still moving" after each `PA`/`OR`.
        busy_polls: u32,
    },
    /// Toggle shutter; accepts `ens`.
    Shutter,
    /// Laser head.
    Laser {
        /// Value reported for `?HID`.
        head_id: f64,
        /// Value reported for `?P`; `None` simulates a head still booting.
        power_mw: Option<f64>,
    },
}

/// One command as seen by the mock rig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Port the command was written to.
    pub port: String,
    /// Command text without terminator.
    pub command: String,
}

#[derive(Debug)]
struct PortEntry {
    behavior: MockBehavior,
    fail_open: bool,
    fail_commands: Vec<String>,
    opens: usize,
    closes: usize,
    open_now: usize,
    raw_writes: Vec<String>,
}

#[derive(Debug, Default)]
struct RigState {
    ports: HashMap<String, PortEntry>,
    journal: Vec<JournalEntry>,
}

/// Connector that opens simulated devices.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<RigState>>,
}

impl MockConnector {
    /// Empty rig with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage, shutter and a compatible laser on the standard mock ports.
    pub fn rig() -> Self {
        let connector = Self::new();
        connector.register(MOCK_STAGE_PORT, MockBehavior::Stage { busy_polls: 1 });
        connector.register(MOCK_SHUTTER_PORT, MockBehavior::Shutter);
        connector.register(
            MOCK_LASER_PORT,
            MockBehavior::Laser {
                head_id: 42185.0,
                power_mw: Some(0.0),
            },
        );
        connector
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a simulated device on `port`.
    pub fn register(&self, port: &str, behavior: MockBehavior) {
        self.lock().ports.insert(
            port.to_string(),
            PortEntry {
                behavior,
                fail_open: false,
                fail_commands: Vec::new(),
                opens: 0,
                closes: 0,
                open_now: 0,
                raw_writes: Vec::new(),
            },
        );
    }

    /// Make every future open of `port` fail.
    pub fn fail_open(&self, port: &str) {
        if let Some(entry) = self.lock().ports.get_mut(port) {
            entry.fail_open = true;
        }
    }

    /// Make writes of commands starting with `prefix` fail on `port`.
    pub fn fail_command(&self, port: &str, prefix: &str) {
        if let Some(entry) = self.lock().ports.get_mut(port) {
            entry.fail_commands.push(prefix.to_string());
        }
    }

    /// Every command on every port, in write order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Commands written to `port`, in order.
    pub fn commands(&self, port: &str) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|entry| entry.port == port)
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// Number of commands on `port` starting with `prefix`.
    pub fn count(&self, port: &str, prefix: &str) -> usize {
        self.commands(port)
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    /// Raw payloads handed to the transport, terminators included.
    pub fn raw_writes(&self, port: &str) -> Vec<String> {
        self.lock()
            .ports
            .get(port)
            .map(|entry| entry.raw_writes.clone())
            .unwrap_or_default()
    }

    /// Transports on `port` opened and not yet shut down.
    pub fn open_connections(&self, port: &str) -> usize {
        self.lock().ports.get(port).map_or(0, |entry| entry.open_now)
    }

    /// Successful opens of `port`.
    pub fn open_count(&self, port: &str) -> usize {
        self.lock().ports.get(port).map_or(0, |entry| entry.opens)
    }

    /// Shutdowns of `port`.
    pub fn close_count(&self, port: &str) -> usize {
        self.lock().ports.get(port).map_or(0, |entry| entry.closes)
    }

    /// Forget all journal entries.
    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SerialPortConfig) -> HoloResult<Box<dyn Transport>> {
        let mut state = self.lock();
        let entry = state
            .ports
            .get_mut(&config.port)
            .ok_or_else(|| HoloError::connection(&config.port, "no such port"))?;
        if entry.fail_open {
            return Err(HoloError::connection(&config.port, "injected open failure"));
        }
        entry.opens += 1;
        entry.open_now += 1;

        Ok(Box::new(MockTransport {
            port: config.port.clone(),
            behavior: entry.behavior.clone(),
            state: Arc::clone(&self.state),
            pending: VecDeque::new(),
            partial: String::new(),
            busy_remaining: 0,
            shut_down: false,
        }))
    }
}

struct MockTransport {
    port: String,
    behavior: MockBehavior,
    state: Arc<Mutex<RigState>>,
    pending: VecDeque<u8>,
    partial: String,
    busy_remaining: u32,
    shut_down: bool,
}

impl MockTransport {
    fn handle(&mut self, command: &str) -> std::io::Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.journal.push(JournalEntry {
                port: self.port.clone(),
                command: command.to_string(),
            });
            let failing = state
                .ports
                .get(&self.port)
                .is_some_and(|entry| entry.fail_commands.iter().any(|p| command.starts_with(p.as_str())));
            if failing {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    format!("injected failure for '{command}'"),
                ));
            }
        }

        let reply = match &self.behavior {
            MockBehavior::Silent | MockBehavior::Shutter => None,
            MockBehavior::Stage { busy_polls } => {
                if command.contains("PA") || command.contains("OR") {
                    self.busy_remaining = *busy_polls;
                    None
                } else if command.ends_with("MD?") {
                    if self.busy_remaining > 0 {
                        self.busy_remaining = self.busy_remaining.saturating_sub(1);
                        Some("0\r\n".to_string())
                    } else {
                        Some("1\r\n".to_string())
                    }
                } else {
                    None
                }
            }
            MockBehavior::Laser { head_id, power_mw } => match command {
                "?HID" => Some(format!("?HID\r\n{head_id:.3}\r\n")),
                "?P" => power_mw.map(|p| format!("?P\r\n{p:.3}\r\n")),
                _ => None,
            },
        };
        if let Some(reply) = reply {
            self.pending.extend(reply.into_bytes());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = state.ports.get_mut(&self.port) {
                entry.raw_writes.push(text.clone());
            }
        }

        self.partial.push_str(&text);
        while let Some(idx) = self.partial.find('\r') {
            let command: String = self.partial.drain(..=idx).collect();
            self.handle(command.trim_end_matches('\r'))?;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            // Nothing queued: behave like a quiet line until the caller's timeout fires.
            return std::future::pending().await;
        }
        let count = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.ports.get_mut(&self.port) {
            entry.closes += 1;
            entry.open_now = entry.open_now.saturating_sub(1);
        }
        Ok(())
    }
}
