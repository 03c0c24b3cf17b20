//! Synthetic raster pointing patterns.

use derive_builder::Builder;
use ndarray::Array1;

/// Layout of a synthetic raster scan.
///
/// Rows advance along the scan direction (`angle_deg`, counter-clockwise from
/// the right ascension axis), rows are stacked perpendicular to it, and maps
/// repeat the whole set of rows. All distances are in degrees.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct RasterPattern {
    /// Rows in each map
    #[builder(default = "16")]
    pub num_rows_per_map: usize,
    /// Pointings in each row
    #[builder(default = "10")]
    pub num_points_per_row: usize,
    /// Number of maps
    #[builder(default = "1")]
    pub num_maps: usize,
    /// Distance between pointings along a row
    #[builder(default = "0.1")]
    pub point_interval: f64,
    /// Distance between rows
    #[builder(default = "1.0")]
    pub row_interval: f64,
    /// Scan direction
    #[builder(default = "0.0")]
    pub angle_deg: f64,
    /// Whether every row is scanned in the same direction
    #[builder(default = "true")]
    pub oneway_row: bool,
    /// Whether every map scans its rows in the same order
    #[builder(default = "true")]
    pub oneway_map: bool,
    /// Position of the first pointing
    #[builder(default = "(0.0, 0.0)")]
    pub origin: (f64, f64),
}

impl RasterPatternBuilder {
    fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("num_rows_per_map", self.num_rows_per_map),
            ("num_points_per_row", self.num_points_per_row),
            ("num_maps", self.num_maps),
        ] {
            if value == Some(0) {
                return Err(format!("{name} must be positive"));
            }
        }
        Ok(())
    }
}

impl RasterPattern {
    /// Total number of pointings
    pub fn num_points(&self) -> usize {
        self.num_maps * self.num_rows_per_map * self.num_points_per_row
    }

    /// Right ascension and declination of every pointing, in scan order.
    pub fn generate(&self) -> (Array1<f64>, Array1<f64>) {
        let (sin, cos) = self.angle_deg.to_radians().sin_cos();
        let mut ra = Vec::with_capacity(self.num_points());
        let mut dec = Vec::with_capacity(self.num_points());

        for map in 0..self.num_maps {
            let reverse_map = !self.oneway_map && map % 2 == 1;
            for row in 0..self.num_rows_per_map {
                let row_pos = if reverse_map {
                    self.num_rows_per_map - 1 - row
                } else {
                    row
                };
                let reverse_row =
                    !self.oneway_row && (map * self.num_rows_per_map + row) % 2 == 1;
                for point in 0..self.num_points_per_row {
                    let point_pos = if reverse_row {
                        self.num_points_per_row - 1 - point
                    } else {
                        point
                    };
                    let along = point_pos as f64 * self.point_interval;
                    let across = row_pos as f64 * self.row_interval;
                    ra.push(self.origin.0 + along * cos - across * sin);
                    dec.push(self.origin.1 + along * sin + across * cos);
                }
            }
        }
        (Array1::from(ra), Array1::from(dec))
    }
}
