//! Scan duration prediction.
//!
//! The estimate is a sum of three terms: every non-zero exposure, a travel
//! term per written row proportional to how far along the row the last
//! exposed pixel sits, and one travel term for the full film height.

use crate::exposure::EffectTable;
use crate::raster::{FilmGeometry, PixelGrid};
use chrono::{DateTime, Local, TimeDelta};
use std::time::Duration;

/// Empirical stage feed, in meters of film per second of scan time.
///
/// Calibrated on the rig; override through `scan.unit_rate` in the
/// configuration when the stage or its velocity changes.
pub const DEFAULT_UNIT_RATE: f64 = 0.001;

/// Result of [`estimate_runtime`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeEstimate {
    /// Predicted scan time in seconds.
    pub seconds: f64,
    /// Pixels that will be exposed.
    pub exposed_pixels: usize,
    /// Rows containing at least one exposed pixel.
    pub exposed_rows: usize,
}

impl RuntimeEstimate {
    /// Predicted scan time.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.seconds).unwrap_or(Duration::MAX)
    }

    /// Wall-clock finish time for a scan starting at `start`.
    pub fn finish_time(&self, start: DateTime<Local>) -> DateTime<Local> {
        #[allow(clippy::cast_possible_truncation)]
        let millis = (self.seconds * 1000.0).round() as i64;
        TimeDelta::try_milliseconds(millis)
            .and_then(|delta| start.checked_add_signed(delta))
            .unwrap_or(start)
    }
}

/// Predict how long scanning `grid` will take.
///
/// Pure: reads `grid` and `exposure` only.
#[allow(clippy::cast_precision_loss)]
pub fn estimate_runtime(
    grid: &PixelGrid,
    exposure: &EffectTable,
    geometry: FilmGeometry,
    unit_rate: f64,
) -> RuntimeEstimate {
    let x_pix = grid.x_pix();
    let mut seconds = 0.0;
    let mut exposed_pixels = 0;
    let mut exposed_rows = 0;

    for row in 0..grid.y_pix() {
        let mut farthest_col = None;
        for col in 0..x_pix {
            let duration = exposure.get(grid.get(col, row));
            if duration != 0.0 {
                seconds += duration;
                exposed_pixels += 1;
                farthest_col = Some(col);
            }
        }
        if let Some(col) = farthest_col {
            exposed_rows += 1;
            seconds += (col as f64 / x_pix as f64) * geometry.width() / unit_rate;
        }
    }
    seconds += geometry.height() / unit_rate;

    RuntimeEstimate {
        seconds,
        exposed_pixels,
        exposed_rows,
    }
}
