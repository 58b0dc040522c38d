//! One exposure session: acquire the rig, scan, release the rig.
//!
//! Devices are acquired stage, shutter, laser, and released in the reverse
//! order on every exit path. A failure while acquiring stops the session
//! before any further device is touched. Release failures are logged and
//! recorded in the report but never replace the scan's own outcome.

use crate::control::{control_channel, ControlHandle, ControlReceiver};
use crate::error::{HoloError, HoloResult};
use crate::exposure::ExposureMap;
use crate::hardware::{
    Axis, Connector, LaserHead, LaserSettings, SerialDevice, SerialPortConfig, Shutter,
    StageController, StageSettings,
};
use crate::raster::{FilmGeometry, PixelGrid};
use crate::sequencer::{ScanDevices, ScanEvent, ScanReport, ScanSequencer, ScanState, SequencerSettings};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Everything a session needs besides the grid and tables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stage controller port
    pub stage_port: SerialPortConfig,
    /// Shutter port
    pub shutter_port: SerialPortConfig,
    /// Laser head port
    pub laser_port: SerialPortConfig,
    /// Stage motion settings
    pub stage: StageSettings,
    /// Laser limits and timing
    pub laser: LaserSettings,
    /// Scan loop timing
    pub sequencer: SequencerSettings,
    /// Film size
    pub geometry: FilmGeometry,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanOutcome {
    /// Every pixel was exposed.
    Completed(ScanReport),
    /// The operator stopped the scan.
    Aborted(ScanReport),
    /// A device or setup step failed.
    Faulted {
        /// Failing step and its error
        reason: String,
        /// Tally up to the failure
        report: ScanReport,
    },
}

impl ScanOutcome {
    /// The report, whichever way the session ended.
    pub fn report(&self) -> &ScanReport {
        match self {
            ScanOutcome::Completed(report) | ScanOutcome::Aborted(report) => report,
            ScanOutcome::Faulted { report, .. } => report,
        }
    }

    /// True for [`ScanOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, ScanOutcome::Completed(_))
    }
}

/// Drivers as they get acquired; `None` until their turn comes.
#[derive(Default)]
struct Acquired {
    stage: Option<StageController>,
    shutter: Option<Shutter>,
    laser: Option<LaserHead>,
}

/// A configured rig plus the grid and tables to expose.
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    grid: Arc<PixelGrid>,
    map: Arc<ExposureMap>,
}

impl Session {
    /// Bundle the inputs; nothing is opened until [`Session::run`].
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        grid: Arc<PixelGrid>,
        map: Arc<ExposureMap>,
    ) -> Self {
        Self {
            config,
            connector,
            grid,
            map,
        }
    }

    /// Run the session to its end. Never returns an error: failures are
    /// folded into [`ScanOutcome::Faulted`] after the rig has been released.
    #[instrument(skip_all, fields(x_pix = self.grid.x_pix(), y_pix = self.grid.y_pix()))]
    pub async fn run(&self, control: &mut ControlReceiver, events: broadcast::Sender<ScanEvent>) -> ScanOutcome {
        let mut sequencer = ScanSequencer::new(
            Arc::clone(&self.grid),
            Arc::clone(&self.map),
            self.config.geometry,
            self.config.sequencer,
            events,
        );
        info!(
            estimated = ?sequencer.estimate().duration(),
            exposures = sequencer.estimate().exposed_pixels,
            dpi = sequencer.plan().dots_per_inch(),
            "session starting"
        );
        sequencer.transition(ScanState::Initializing);

        let mut acquired = Acquired::default();
        let mut step = "acquiring stage";
        let result = self.acquire_and_scan(&mut acquired, &mut sequencer, control, &mut step).await;

        let mut report = sequencer.take_report();
        if let Err(HoloError::ShutdownFailed(errors)) = release(acquired).await {
            report.release_errors = errors.iter().map(ToString::to_string).collect();
        }

        let outcome = match result {
            Ok(()) => ScanOutcome::Completed(report),
            Err(e) if e.is_user_abort() => {
                report.final_state = ScanState::Aborted;
                ScanOutcome::Aborted(report)
            }
            Err(e) => {
                report.final_state = ScanState::Faulted;
                let reason = match report.last_pixel {
                    Some((col, row)) if step == "scanning" => {
                        format!("{step} pixel ({col},{row}): {e}")
                    }
                    _ => format!("{step}: {e}"),
                };
                error!(%reason, "session faulted");
                ScanOutcome::Faulted { reason, report }
            }
        };
        // Terminal state is published once the rig is released
        sequencer.transition(outcome.report().final_state);
        outcome
    }

    /// Run on a dedicated task, returning the task and the handle that controls it.
    pub fn spawn(self, events: broadcast::Sender<ScanEvent>) -> (JoinHandle<ScanOutcome>, ControlHandle) {
        let (handle, mut control) = control_channel();
        let task = tokio::spawn(async move { self.run(&mut control, events).await });
        (task, handle)
    }

    async fn acquire_and_scan(
        &self,
        acquired: &mut Acquired,
        sequencer: &mut ScanSequencer,
        control: &mut ControlReceiver,
        step: &mut &'static str,
    ) -> HoloResult<()> {
        let connector = &self.connector;
        let config = &self.config;

        *step = "acquiring stage";
        let stage = acquired.stage.insert(StageController::new(
            config.stage_port.clone(),
            Arc::clone(connector),
            &config.stage,
        ));
        stage.open().await?;

        *step = "acquiring shutter";
        let shutter = acquired
            .shutter
            .insert(Shutter::new(config.shutter_port.clone(), Arc::clone(connector)));
        shutter.open().await?;

        *step = "acquiring laser";
        let laser = acquired.laser.insert(LaserHead::new(
            config.laser_port.clone(),
            Arc::clone(connector),
            &config.laser,
        ));
        laser.open().await?;

        *step = "verifying laser head";
        laser.identify().await?;
        *step = "switching laser to standby";
        laser.ensure_inactive().await?;
        *step = "configuring laser";
        laser.configure(config.laser.max_power_mw, config.laser.power_change_pause)?;

        for (axis, label) in [(Axis::X, "configuring X axis"), (Axis::Y, "configuring Y axis")] {
            control.check_abort()?;
            *step = label;
            stage
                .configure(axis, config.stage.velocity, config.stage.acceleration, false)
                .await?;
            if config.stage.home_on_start {
                home_racing_abort(stage, axis, control).await?;
            }
        }

        *step = "scanning";
        sequencer
            .run(ScanDevices { stage, shutter, laser }, control)
            .await
    }
}

/// Home `axis`, giving up as soon as the operator aborts.
async fn home_racing_abort(
    stage: &mut StageController,
    axis: Axis,
    control: &mut ControlReceiver,
) -> HoloResult<()> {
    tokio::select! {
        result = stage.home(axis) => result,
        () = control.aborted() => {
            warn!(%axis, "abort during homing");
            Err(HoloError::UserAborted)
        }
    }
}

/// Release in reverse acquisition order, each device exactly once.
///
/// Every device is attempted even after a failure; the failures come back
/// together as [`HoloError::ShutdownFailed`].
async fn release(acquired: Acquired) -> HoloResult<()> {
    let mut errors = Vec::new();

    if let Some(mut laser) = acquired.laser {
        if laser.is_open() {
            if let Err(e) = laser.turn_off().await {
                warn!(error = %e, "failed to switch laser off during release");
                errors.push(e);
            }
        }
        if let Err(e) = laser.close().await {
            warn!(error = %e, "failed to close laser");
            errors.push(e);
        }
    }
    if let Some(mut shutter) = acquired.shutter {
        if let Err(e) = shutter.close().await {
            warn!(error = %e, "failed to close shutter");
            errors.push(e);
        }
    }
    if let Some(mut stage) = acquired.stage {
        if let Err(e) = stage.close().await {
            warn!(error = %e, "failed to close stage");
            errors.push(e);
        }
    }

    if errors.is_empty() {
        info!("rig released");
        Ok(())
    } else {
        let failure = HoloError::ShutdownFailed(errors);
        error!(error = %failure, "rig released with errors");
        Err(failure)
    }
}
