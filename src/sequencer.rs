//! Raster-scan state machine.
//!
//! Walks the grid row by row, left to right. For every pixel with a non-zero
//! exposure it moves the stage, adjusts laser power when the pixel needs a
//! noticeably different power than the last exposed one, and pulses the
//! shutter. Pixels with zero exposure cost no device I/O at all.
//!
//! Per pixel the device order is always move, then power, then expose.
//!
//! The sequencer borrows the three drivers for the duration of [`ScanSequencer::run`]
//! and never opens or closes them; acquisition and release belong to
//! [`crate::session::Session`].

use crate::control::{ControlReceiver, ControlSignal};
use crate::error::{HoloError, HoloResult};
use crate::estimator::{estimate_runtime, RuntimeEstimate};
use crate::exposure::ExposureMap;
use crate::hardware::{Axis, LaserHead, Shutter, StageController};
use crate::raster::{FilmGeometry, PixelGrid, RasterPlan};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Power differences below this are not worth a laser command, in mW.
pub const POWER_TOLERANCE_MW: f64 = 0.05;

/// Default re-check interval while paused.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_secs(1);

/// Lifecycle of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ScanState {
    /// Not started.
    #[default]
    Idle,
    /// Rig acquired, laser being primed.
    Initializing,
    /// Working through pixels.
    Scanning,
    /// Holding between pixels.
    Paused,
    /// Abort seen, rig being released.
    Aborting,
    /// Every pixel exposed.
    Completed,
    /// Stopped on a device or setup failure.
    Faulted,
    /// Stopped by the operator.
    Aborted,
}

impl ScanState {
    /// No further transitions happen from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Faulted | ScanState::Aborted)
    }
}

/// Progress published while scanning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanEvent {
    /// The scan entered a new state.
    StateChanged(ScanState),
    /// The stage reached a row that has exposed pixels.
    RowStarted {
        /// Grid row
        row: usize,
        /// Y stage position
        y_position: f64,
    },
    /// Laser power changed between exposures.
    PowerChanged {
        /// Previous power, mW
        from_mw: f64,
        /// New power, mW
        to_mw: f64,
    },
    /// One pixel was exposed.
    Exposed {
        /// Grid column
        col: usize,
        /// Grid row
        row: usize,
        /// Grid value at the pixel
        intensity: u8,
        /// Shutter open time
        seconds: f64,
        /// Laser power during the exposure
        power_mw: f64,
        /// Exposures done so far, this one included
        exposed: u64,
        /// Pixels the whole scan will expose
        total_exposures: usize,
        /// Time since scanning started
        elapsed: Duration,
    },
}

/// Tally of a scan, filled in as it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    /// Pixels exposed
    pub exposures: u64,
    /// Power commands sent while scanning
    pub power_changes: u64,
    /// Row moves
    pub y_moves: u64,
    /// Column moves
    pub x_moves: u64,
    /// Time spent scanning
    pub elapsed: Duration,
    /// Latest state; terminal once the session is over
    pub final_state: ScanState,
    /// Last pixel the sequencer started working on, as `(col, row)`
    pub last_pixel: Option<(usize, usize)>,
    /// Failures hit while releasing devices; logged, never raised
    pub release_errors: Vec<String>,
}

/// Timing knobs for the scan loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencerSettings {
    /// Extra wait after each confirmed move
    pub settle_delay: Duration,
    /// Re-check interval while paused
    pub pause_poll: Duration,
    /// Stage feed used for the runtime estimate
    pub unit_rate: f64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            pause_poll: DEFAULT_PAUSE_POLL,
            unit_rate: crate::estimator::DEFAULT_UNIT_RATE,
        }
    }
}

/// The drivers a scan needs, already open and configured.
pub struct ScanDevices<'a> {
    /// Two-axis stage
    pub stage: &'a mut StageController,
    /// Exposure shutter
    pub shutter: &'a mut Shutter,
    /// Laser head
    pub laser: &'a mut LaserHead,
}

/// Drives one scan of a grid over borrowed devices.
pub struct ScanSequencer {
    grid: Arc<PixelGrid>,
    map: Arc<ExposureMap>,
    plan: RasterPlan,
    settings: SequencerSettings,
    estimate: RuntimeEstimate,
    events: broadcast::Sender<ScanEvent>,
    report: ScanReport,
}

impl ScanSequencer {
    /// Prepare a scan; the runtime estimate is computed up front.
    pub fn new(
        grid: Arc<PixelGrid>,
        map: Arc<ExposureMap>,
        geometry: FilmGeometry,
        settings: SequencerSettings,
        events: broadcast::Sender<ScanEvent>,
    ) -> Self {
        let plan = RasterPlan::new(&grid, geometry);
        let estimate = estimate_runtime(&grid, &map.exposure, geometry, settings.unit_rate);
        Self {
            grid,
            map,
            plan,
            settings,
            estimate,
            events,
            report: ScanReport::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.report.final_state
    }

    /// Tally so far.
    pub fn report(&self) -> &ScanReport {
        &self.report
    }

    /// Hand the report over, leaving an empty one behind.
    pub fn take_report(&mut self) -> ScanReport {
        std::mem::take(&mut self.report)
    }

    /// Predicted runtime for this grid.
    pub fn estimate(&self) -> &RuntimeEstimate {
        &self.estimate
    }

    /// Pixel to stage position mapping.
    pub fn plan(&self) -> &RasterPlan {
        &self.plan
    }

    /// Move to `next`, logging and publishing the change.
    pub fn transition(&mut self, next: ScanState) {
        let previous = self.report.final_state;
        if previous == next {
            return;
        }
        info!(?previous, ?next, "scan state");
        self.report.final_state = next;
        self.emit(ScanEvent::StateChanged(next));
    }

    /// Prime the laser, then scan the whole grid.
    ///
    /// Ends in `Completed` on success and `Aborting` on a user abort. Any
    /// other failure leaves the state where it was for the session to
    /// finalise after cleanup.
    pub async fn run(&mut self, devices: ScanDevices<'_>, control: &mut ControlReceiver) -> HoloResult<()> {
        let started = Instant::now();
        let result = self.scan(devices, control, started).await;
        self.report.elapsed = started.elapsed();

        match &result {
            Ok(()) => {
                info!(
                    exposures = self.report.exposures,
                    power_changes = self.report.power_changes,
                    elapsed = ?self.report.elapsed,
                    "scan complete"
                );
                self.transition(ScanState::Completed);
            }
            Err(e) if e.is_user_abort() => {
                warn!(pixel = ?self.report.last_pixel, "scan aborted by operator");
                self.transition(ScanState::Aborting);
            }
            Err(e) => warn!(pixel = ?self.report.last_pixel, error = %e, "scan failed"),
        }
        result
    }

    async fn scan(
        &mut self,
        devices: ScanDevices<'_>,
        control: &mut ControlReceiver,
        started: Instant,
    ) -> HoloResult<()> {
        let ScanDevices { stage, shutter, laser } = devices;

        self.transition(ScanState::Initializing);
        control.check_abort()?;
        let mut previous_power = self.prime(laser).await?;
        self.transition(ScanState::Scanning);

        let total_exposures = self.estimate.exposed_pixels;
        for row in 0..self.grid.y_pix() {
            let mut row_started = false;
            for col in 0..self.grid.x_pix() {
                self.checkpoint(control).await?;

                let intensity = self.grid.get(col, row);
                let seconds = self.map.exposure_for(intensity);
                if seconds == 0.0 {
                    continue;
                }
                self.report.last_pixel = Some((col, row));

                if !row_started {
                    let y_position = self.plan.y_position(row);
                    race_abort(stage, Axis::Y, y_position, self.settings.settle_delay, control).await?;
                    self.report.y_moves += 1;
                    row_started = true;
                    debug!(row, y_position, "row started");
                    self.emit(ScanEvent::RowStarted { row, y_position });
                }
                race_abort(stage, Axis::X, self.plan.x_position(col), self.settings.settle_delay, control)
                    .await?;
                self.report.x_moves += 1;

                let power_mw = self.map.power_for(intensity);
                if let Some(from_mw) = previous_power {
                    if (power_mw - from_mw).abs() >= POWER_TOLERANCE_MW {
                        laser.set_power(power_mw).await?;
                        self.report.power_changes += 1;
                        self.emit(ScanEvent::PowerChanged {
                            from_mw,
                            to_mw: power_mw,
                        });
                    }
                }

                shutter.toggle_exposure(seconds).await?;
                previous_power = Some(power_mw);
                self.report.exposures += 1;
                self.emit(ScanEvent::Exposed {
                    col,
                    row,
                    intensity,
                    seconds,
                    power_mw,
                    exposed: self.report.exposures,
                    total_exposures,
                    elapsed: started.elapsed(),
                });
            }
        }
        Ok(())
    }

    /// Set the laser to the first exposed pixel's power and switch it on.
    ///
    /// Returns that power, or `None` when nothing in the grid is exposed, in
    /// which case the laser is left untouched.
    async fn prime(&mut self, laser: &mut LaserHead) -> HoloResult<Option<f64>> {
        let first = (0..self.grid.y_pix())
            .flat_map(|row| (0..self.grid.x_pix()).map(move |col| (col, row)))
            .map(|(col, row)| self.grid.get(col, row))
            .find(|&intensity| self.map.is_exposed(intensity));

        let Some(intensity) = first else {
            info!("no exposed pixels, nothing to do");
            return Ok(None);
        };
        let power_mw = self.map.power_for(intensity);
        let applied = laser.set_power(power_mw).await?;
        if applied > 0.0 {
            laser.turn_on().await?;
        }
        info!(power_mw = applied, "laser primed");
        Ok(Some(power_mw))
    }

    /// Honour the control signal before the next pixel.
    async fn checkpoint(&mut self, control: &mut ControlReceiver) -> HoloResult<()> {
        match control.current() {
            ControlSignal::Run => Ok(()),
            ControlSignal::Abort => Err(HoloError::UserAborted),
            ControlSignal::Pause => {
                self.transition(ScanState::Paused);
                control.wait_while_paused(self.settings.pause_poll).await?;
                self.transition(ScanState::Scanning);
                Ok(())
            }
        }
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Move `axis`, giving up early if the operator aborts while the stage is moving.
async fn race_abort(
    stage: &mut StageController,
    axis: Axis,
    position: f64,
    settle_delay: Duration,
    control: &mut ControlReceiver,
) -> HoloResult<()> {
    tokio::select! {
        result = stage.move_absolute(axis, position, settle_delay) => result,
        () = control.aborted() => {
            warn!(%axis, position, "abort during motion");
            Err(HoloError::UserAborted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::control_channel;
    use crate::hardware::mock::{MockConnector, MOCK_LASER_PORT, MOCK_SHUTTER_PORT, MOCK_STAGE_PORT};
    use crate::hardware::{LaserSettings, SerialDevice, SerialPortConfig, StageSettings};

    struct Rig {
        connector: MockConnector,
        stage: StageController,
        shutter: Shutter,
        laser: LaserHead,
    }

    impl Rig {
        async fn open() -> Self {
            let connector = MockConnector::rig();
            let shared: Arc<dyn crate::hardware::Connector> = Arc::new(connector.clone());
            let mut stage = StageController::new(
                SerialPortConfig::new(MOCK_STAGE_PORT),
                Arc::clone(&shared),
                &StageSettings::default(),
            );
            let mut shutter = Shutter::new(SerialPortConfig::new(MOCK_SHUTTER_PORT), Arc::clone(&shared));
            let mut laser = LaserHead::new(SerialPortConfig::new(MOCK_LASER_PORT), shared, &LaserSettings::default());
            stage.open().await.unwrap();
            shutter.open().await.unwrap();
            laser.open().await.unwrap();
            connector.clear_journal();
            Self {
                connector,
                stage,
                shutter,
                laser,
            }
        }

        fn devices(&mut self) -> ScanDevices<'_> {
            ScanDevices {
                stage: &mut self.stage,
                shutter: &mut self.shutter,
                laser: &mut self.laser,
            }
        }
    }

    fn sequencer(grid: PixelGrid, map: ExposureMap) -> (ScanSequencer, broadcast::Receiver<ScanEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let geometry = FilmGeometry::new(0.002, 0.002).unwrap();
        let sequencer = ScanSequencer::new(Arc::new(grid), Arc::new(map), geometry, SequencerSettings::default(), tx);
        (sequencer, rx)
    }

    fn only_255_exposed() -> ExposureMap {
        ExposureMap::builder(10.0)
            .exposure(["[255,256):1.0"])
            .power(["[0,256):5.0"])
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_exposures_at_the_bright_cells() {
        let mut rig = Rig::open().await;
        // grid[col][row]: (1,0) and (0,1) are bright
        let grid = PixelGrid::from_columns(vec![vec![0, 255], vec![255, 0]]).unwrap();
        let (mut sequencer, _events) = sequencer(grid, only_255_exposed());
        let (_handle, mut control) = control_channel();

        sequencer.run(rig.devices(), &mut control).await.unwrap();

        assert_eq!(sequencer.state(), ScanState::Completed);
        assert_eq!(sequencer.report().exposures, 2);
        assert_eq!(sequencer.report().y_moves, 2);
        assert_eq!(rig.connector.count(MOCK_SHUTTER_PORT, "ens"), 4);

        let moves: Vec<String> = rig
            .connector
            .commands(MOCK_STAGE_PORT)
            .into_iter()
            .filter(|c| c.contains("PA"))
            .collect();
        assert_eq!(moves, vec!["2PA0.0000", "1PA1.0000", "2PA1.0000", "1PA0.0000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_precede_exposure_for_each_pixel() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![255]]).unwrap();
        let (mut sequencer, _events) = sequencer(grid, only_255_exposed());
        let (_handle, mut control) = control_channel();

        sequencer.run(rig.devices(), &mut control).await.unwrap();

        let order: Vec<String> = rig
            .connector
            .journal()
            .into_iter()
            .filter(|e| e.command.contains("PA") || e.command == "ens")
            .map(|e| e.command)
            .collect();
        assert_eq!(order, vec!["2PA0.0000", "1PA0.0000", "ens", "ens"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_grid_touches_no_device() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![0, 0, 0]; 3]).unwrap();
        let (mut sequencer, _events) = sequencer(grid, only_255_exposed());
        let (_handle, mut control) = control_channel();

        sequencer.run(rig.devices(), &mut control).await.unwrap();

        assert_eq!(sequencer.state(), ScanState::Completed);
        assert!(rig.connector.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_power_then_jump_is_one_change() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![10, 11, 12, 13]]).unwrap();
        let map = ExposureMap::builder(10.0)
            .exposure(["[10,14):0.5"])
            .power(["[10,13):5.0", "[13,14):9.0"])
            .build()
            .unwrap();
        let (mut sequencer, _events) = sequencer(grid, map);
        let (_handle, mut control) = control_channel();

        sequencer.run(rig.devices(), &mut control).await.unwrap();

        assert_eq!(sequencer.report().power_changes, 1);
        // prime then the single change before the 9 mW pixel
        assert_eq!(
            rig.connector.commands(MOCK_LASER_PORT),
            vec!["P=5.00", "L=1", "P=9.00"]
        );
        let journal = rig.connector.journal();
        let change = journal.iter().position(|e| e.command == "P=9.00").unwrap();
        let shutter_toggles_before = journal[..change].iter().filter(|e| e.command == "ens").count();
        assert_eq!(shutter_toggles_before, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_power_drift_is_ignored() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![10, 11]]).unwrap();
        let map = ExposureMap::builder(10.0)
            .exposure(["[10,12):0.5"])
            .power(["[10,11):5.0", "[11,12):5.04"])
            .build()
            .unwrap();
        let (mut sequencer, _events) = sequencer(grid, map);
        let (_handle, mut control) = control_channel();

        sequencer.run(rig.devices(), &mut control).await.unwrap();
        assert_eq!(sequencer.report().power_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_start() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![255, 255]]).unwrap();
        let (mut sequencer, _events) = sequencer(grid, only_255_exposed());
        let (handle, mut control) = control_channel();
        handle.abort();

        let err = sequencer.run(rig.devices(), &mut control).await.unwrap_err();
        assert!(err.is_user_abort());
        assert_eq!(sequencer.state(), ScanState::Aborting);
        assert_eq!(rig.connector.count(MOCK_SHUTTER_PORT, "ens"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_then_resumes() {
        let mut rig = Rig::open().await;
        let connector = rig.connector.clone();
        let grid = PixelGrid::from_rows(vec![vec![255, 255, 255]]).unwrap();
        let (mut sequencer, mut events) = sequencer(grid, only_255_exposed());
        let (handle, mut control) = control_channel();

        let supervisor = async {
            loop {
                if let Ok(ScanEvent::Exposed { exposed: 1, .. }) = events.recv().await {
                    break;
                }
            }
            handle.pause();
            tokio::time::sleep(Duration::from_secs(5)).await;
            let held = connector.count(MOCK_SHUTTER_PORT, "ens");
            tokio::time::sleep(Duration::from_secs(25)).await;
            assert_eq!(connector.count(MOCK_SHUTTER_PORT, "ens"), held);
            handle.run();
        };

        let (result, ()) = tokio::join!(sequencer.run(rig.devices(), &mut control), supervisor);
        result.unwrap();
        assert_eq!(sequencer.report().exposures, 3);
        assert!(sequencer.report().elapsed >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_motion_stops_within_a_poll() {
        let mut rig = Rig::open().await;
        let grid = PixelGrid::from_rows(vec![vec![255; 4]; 4]).unwrap();
        let (mut sequencer, mut events) = sequencer(grid, only_255_exposed());
        let (handle, mut control) = control_channel();

        let supervisor = async {
            loop {
                if let Ok(ScanEvent::Exposed { exposed: 2, .. }) = events.recv().await {
                    break;
                }
            }
            handle.abort();
        };

        let (result, ()) = tokio::join!(sequencer.run(rig.devices(), &mut control), supervisor);
        assert!(result.unwrap_err().is_user_abort());
        assert_eq!(sequencer.report().exposures, 2);
        // every opened shutter was closed again
        assert_eq!(rig.connector.count(MOCK_SHUTTER_PORT, "ens") % 2, 0);
    }
}
