//! Pixel grid and film geometry.
//!
//! Indexing contract: a [`PixelGrid`] is addressed `grid[column][row]`
//! everywhere, through [`PixelGrid::get`]. Producers that hand over
//! row-major data go through [`PixelGrid::from_rows`], which transposes once
//! at the boundary.

use crate::error::{HoloError, HoloResult};
use std::io::Read;
use std::path::Path;

/// Stage units per meter of film. The stage controller works in millimeters.
pub const STAGE_UNITS_PER_METER: f64 = 1000.0;

/// Greyscale raster, `x_pix` columns by `y_pix` rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    x_pix: usize,
    y_pix: usize,
    /// Column-major: `data[col * y_pix + row]`
    data: Vec<u8>,
}

impl PixelGrid {
    /// Build from columns: `columns[col][row]`.
    pub fn from_columns(columns: Vec<Vec<u8>>) -> HoloResult<Self> {
        let x_pix = columns.len();
        let y_pix = columns.first().map_or(0, Vec::len);
        if x_pix == 0 || y_pix == 0 {
            return Err(HoloError::InvalidGrid("grid has no pixels".to_string()));
        }
        if let Some((col, column)) = columns.iter().enumerate().find(|(_, c)| c.len() != y_pix) {
            return Err(HoloError::InvalidGrid(format!(
                "column {col} has {} rows, expected {y_pix}",
                column.len()
            )));
        }
        Ok(Self {
            x_pix,
            y_pix,
            data: columns.into_iter().flatten().collect(),
        })
    }

    /// Build from rows: `rows[row][col]`, as images and CSV files are laid out.
    pub fn from_rows(rows: Vec<Vec<u8>>) -> HoloResult<Self> {
        let y_pix = rows.len();
        let x_pix = rows.first().map_or(0, Vec::len);
        if x_pix == 0 || y_pix == 0 {
            return Err(HoloError::InvalidGrid("grid has no pixels".to_string()));
        }
        if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != x_pix) {
            return Err(HoloError::InvalidGrid(format!(
                "row {row} has {} columns, expected {x_pix}",
                r.len()
            )));
        }
        let mut data = vec![0u8; x_pix * y_pix];
        for (row, values) in rows.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                data[col * y_pix + row] = *value;
            }
        }
        Ok(Self { x_pix, y_pix, data })
    }

    /// Read a row-major CSV of intensities, one image row per record.
    pub fn from_csv_reader<R: Read>(reader: R) -> HoloResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (line, record) in csv.records().enumerate() {
            let record = record?;
            let row = record
                .iter()
                .filter(|field| !field.is_empty())
                .map(|field| {
                    field.parse::<u8>().map_err(|_| {
                        HoloError::InvalidGrid(format!(
                            "line {}: '{field}' is not an intensity in 0-255",
                            line + 1
                        ))
                    })
                })
                .collect::<HoloResult<Vec<u8>>>()?;
            if !row.is_empty() {
                rows.push(row);
            }
        }
        Self::from_rows(rows)
    }

    /// Read a row-major CSV file.
    pub fn from_csv_path(path: impl AsRef<Path>) -> HoloResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }

    /// Intensity at `grid[col][row]`.
    ///
    /// # Panics
    /// If `col >= x_pix` or `row >= y_pix`.
    pub fn get(&self, col: usize, row: usize) -> u8 {
        assert!(col < self.x_pix && row < self.y_pix, "pixel ({col},{row}) out of bounds");
        self.data[col * self.y_pix + row]
    }

    /// Columns.
    pub fn x_pix(&self) -> usize {
        self.x_pix
    }

    /// Rows.
    pub fn y_pix(&self) -> usize {
        self.y_pix
    }

    /// Intensities of `row`, left to right.
    pub fn row(&self, row: usize) -> impl Iterator<Item = u8> + '_ {
        (0..self.x_pix).map(move |col| self.get(col, row))
    }
}

/// Physical size of the film the grid is written onto, in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilmGeometry {
    width: f64,
    height: f64,
}

impl FilmGeometry {
    /// Both dimensions must be finite and positive.
    pub fn new(width: f64, height: f64) -> HoloResult<Self> {
        for (name, value) in [("width", width), ("height", height)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(HoloError::InvalidGeometry(format!(
                    "film {name} must be positive, got {value}"
                )));
            }
        }
        Ok(Self { width, height })
    }

    /// Width in meters.
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Height in meters.
    pub fn height(&self) -> f64 {
        self.height
    }
}

/// Stage position of pixel `index` along a dimension of `pixel_count` pixels
/// spanning `dimension` meters.
#[allow(clippy::cast_precision_loss)]
pub fn position_for(index: usize, pixel_count: usize, dimension: f64) -> f64 {
    index as f64 * (dimension / pixel_count as f64) * STAGE_UNITS_PER_METER
}

/// Maps grid indices to stage positions.
#[derive(Debug, Clone, Copy)]
pub struct RasterPlan {
    x_pix: usize,
    y_pix: usize,
    geometry: FilmGeometry,
}

impl RasterPlan {
    /// Plan for `grid` written onto `geometry`.
    pub fn new(grid: &PixelGrid, geometry: FilmGeometry) -> Self {
        Self {
            x_pix: grid.x_pix(),
            y_pix: grid.y_pix(),
            geometry,
        }
    }

    /// X-axis position of column `col`.
    pub fn x_position(&self, col: usize) -> f64 {
        position_for(col, self.x_pix, self.geometry.width)
    }

    /// Y-axis position of row `row`.
    pub fn y_position(&self, row: usize) -> f64 {
        position_for(row, self.y_pix, self.geometry.height)
    }

    /// Horizontal resolution in dots per inch.
    #[allow(clippy::cast_precision_loss)]
    pub fn dots_per_inch(&self) -> f64 {
        self.x_pix as f64 / (39.3 * self.geometry.width)
    }

    /// Film geometry.
    pub fn geometry(&self) -> FilmGeometry {
        self.geometry
    }
}
