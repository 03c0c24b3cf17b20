//! Raster scan detection.
//!
//! Groups a single-dish pointing track into rows (runs of pointings along the
//! scan direction) and raster maps (consecutive rows covering the field once).
//!
//! # Examples
//!
//! ```rust
//! use skyreduce::raster::{synthetic::RasterPatternBuilder, RasterScanHeuristic};
//!
//! let pattern = RasterPatternBuilder::default()
//!     .num_maps(2)
//!     .build()
//!     .unwrap();
//! let (ra, dec) = pattern.generate();
//! let (gaptable, gaplist) = RasterScanHeuristic
//!     .calculate(ra.view(), dec.view(), None)
//!     .unwrap();
//! assert_eq!(gaptable.rows.len(), 32);
//! assert_eq!(gaptable.maps.len(), 2);
//! assert_eq!(gaplist.large, vec![160]);
//! ```

pub mod error;
pub mod gaps;
pub mod result;
pub mod synthetic;

pub use error::RasterScanHeuristicsFailure;
pub use result::RasterScanHeuristicsResult;

use itertools::Itertools;
use log::debug;
use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::constants::{RASTER_GAP_THRESHOLD_FACTOR, ROUND_TRIP_RASTER_SCAN_THRESHOLD_FACTOR};
use gaps::{find_angle_gap, find_distance_gap, median, refine_gaps};

/// Index groups of a raster track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapTable {
    /// Pointing indices of each row
    pub rows: Vec<Vec<usize>>,
    /// Pointing indices of each raster map, its rows concatenated
    pub maps: Vec<Vec<usize>>,
}

/// Boundaries of a raster track, as pointing indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapList {
    /// First pointing of every row but the first
    pub small: Vec<usize>,
    /// First pointing of every raster map but the first
    pub large: Vec<usize>,
}

/// Classifies a pointing track as a raster scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterScanHeuristic;

impl RasterScanHeuristic {
    /// Split a pointing track into rows and raster maps.
    ///
    /// `label` identifies the track in failure messages.
    ///
    /// # Errors
    ///
    /// Returns a [`RasterScanHeuristicsFailure`] when the track is not a
    /// supported raster scan.
    pub fn calculate(
        &self,
        ra: ArrayView1<f64>,
        dec: ArrayView1<f64>,
        label: Option<&str>,
    ) -> Result<(GapTable, GapList), RasterScanHeuristicsFailure> {
        let label = label.unwrap_or_default();
        let row_gaps = find_raster_row(ra, dec).map_err(|e| e.labelled(label))?;
        let rows = split(&row_gaps);
        let map_gaps = find_raster_gap(ra, dec, &rows).map_err(|e| e.labelled(label))?;
        let maps = map_gaps
            .windows(2)
            .map(|pair| rows[pair[0]..pair[1]].concat())
            .collect_vec();
        debug!(
            "{}: {} pointings, {} rows, {} raster maps",
            label,
            ra.len(),
            rows.len(),
            maps.len()
        );

        let small = row_gaps[1..row_gaps.len() - 1].to_vec();
        let large = map_gaps[1..map_gaps.len() - 1]
            .iter()
            .map(|&row_idx| rows[row_idx][0])
            .collect();
        Ok((GapTable { rows, maps }, GapList { small, large }))
    }
}

fn split(bounds: &[usize]) -> Vec<Vec<usize>> {
    bounds
        .windows(2)
        .map(|pair| (pair[0]..pair[1]).collect())
        .collect()
}

fn diff(values: ArrayView1<f64>) -> Array1<f64> {
    &values.slice(s![1..]) - &values.slice(s![..-1])
}

fn check_coordinates(
    ra: ArrayView1<f64>,
    dec: ArrayView1<f64>,
) -> Result<(), RasterScanHeuristicsFailure> {
    if ra.len() != dec.len() {
        return Err(RasterScanHeuristicsFailure::InconsistentCoordinates {
            label: String::new(),
            num_ra: ra.len(),
            num_dec: dec.len(),
        });
    }
    Ok(())
}

/// Find row boundaries: the union of direction and step length gaps, merged
/// by [`refine_gaps`].
///
/// The result starts at 0 and ends at the number of pointings.
///
/// # Errors
///
/// Fails if the track is empty, the coordinates are inconsistent, or the scan
/// directions are not those of a raster.
pub fn find_raster_row(
    ra: ArrayView1<f64>,
    dec: ArrayView1<f64>,
) -> Result<Vec<usize>, RasterScanHeuristicsFailure> {
    check_coordinates(ra, dec)?;
    let num_data = ra.len();
    match num_data {
        0 => {
            return Err(RasterScanHeuristicsFailure::EmptyRows {
                label: String::new(),
            })
        }
        1 => return Ok(vec![0, 1]),
        _ => {}
    }

    let delta_ra = diff(ra);
    let delta_dec = diff(dec);
    let angle_gaps = find_angle_gap(delta_ra.view(), delta_dec.view())?;
    let distance_gaps = find_distance_gap(delta_ra.view(), delta_dec.view());

    let gaps = angle_gaps
        .into_iter()
        .chain(distance_gaps.gaps.into_iter().map(|idx| idx + 1))
        .sorted()
        .dedup()
        .collect_vec();
    Ok(refine_gaps(&gaps, num_data))
}

/// Find raster map boundaries, as row indices.
///
/// A row whose centroid moves back towards the first row's centroid (its
/// distance grows by less than [`RASTER_GAP_THRESHOLD_FACTOR`] of the median
/// growth) starts a new map. The result starts at 0 and ends at the number of
/// rows.
///
/// # Errors
///
/// Fails if there are no rows, or if at least
/// [`ROUND_TRIP_RASTER_SCAN_THRESHOLD_FACTOR`] of the maps hold a single row.
pub fn find_raster_gap(
    ra: ArrayView1<f64>,
    dec: ArrayView1<f64>,
    rows: &[Vec<usize>],
) -> Result<Vec<usize>, RasterScanHeuristicsFailure> {
    check_coordinates(ra, dec)?;
    if rows.is_empty() || rows.iter().any(Vec::is_empty) {
        return Err(RasterScanHeuristicsFailure::EmptyRows {
            label: String::new(),
        });
    }

    let centroids = rows
        .iter()
        .map(|row| {
            let num = row.len() as f64;
            let ra_sum: f64 = row.iter().map(|&idx| ra[idx]).sum();
            let dec_sum: f64 = row.iter().map(|&idx| dec[idx]).sum();
            (ra_sum / num, dec_sum / num)
        })
        .collect_vec();
    let (ra0, dec0) = centroids[0];
    let distances = centroids
        .iter()
        .map(|&(ra, dec)| (ra - ra0).hypot(dec - dec0))
        .collect_vec();
    let delta = distances
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .collect_vec();

    let num_rows = rows.len();
    let mut gaps = vec![0];
    if let Some(centre) = median(&delta) {
        let threshold = RASTER_GAP_THRESHOLD_FACTOR * centre;
        gaps.extend(delta.iter().positions(|&step| step < threshold).map(|idx| idx + 1));
    }
    gaps.push(num_rows);

    if num_rows > 1 {
        let num_maps = gaps.len() - 1;
        let num_single = gaps.windows(2).filter(|pair| pair[1] - pair[0] == 1).count();
        let fraction = num_single as f64 / num_maps as f64;
        if fraction >= ROUND_TRIP_RASTER_SCAN_THRESHOLD_FACTOR {
            return Err(RasterScanHeuristicsFailure::RoundTripRasterMap {
                label: String::new(),
                fraction,
                num_maps,
            });
        }
    }
    Ok(gaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::synthetic::RasterPatternBuilder;
    use ndarray::Array1;

    #[test]
    fn test_calculate_one_way_two_maps() {
        let (ra, dec) = RasterPatternBuilder::default()
            .num_maps(2)
            .build()
            .unwrap()
            .generate();
        let (gaptable, gaplist) = RasterScanHeuristic
            .calculate(ra.view(), dec.view(), None)
            .unwrap();
        assert_eq!(gaplist.small, (10..320).step_by(10).collect_vec());
        assert_eq!(gaplist.large, vec![160]);
        assert_eq!(gaptable.rows.len(), 32);
        assert!(gaptable.rows.iter().all(|row| row.len() == 10));
        assert_eq!(gaptable.maps, vec![(0..160).collect_vec(), (160..320).collect_vec()]);
    }

    #[test]
    fn test_calculate_round_trip_rows() {
        let (ra, dec) = RasterPatternBuilder::default()
            .num_maps(2)
            .oneway_row(false)
            .build()
            .unwrap()
            .generate();
        let (_, gaplist) = RasterScanHeuristic
            .calculate(ra.view(), dec.view(), None)
            .unwrap();
        assert_eq!(gaplist.small, (10..320).step_by(10).collect_vec());
        assert_eq!(gaplist.large, vec![160]);
    }

    #[test]
    fn test_calculate_rotated_pattern() {
        let (ra, dec) = RasterPatternBuilder::default()
            .num_maps(3)
            .angle_deg(30.0)
            .origin((150.0, -30.0))
            .build()
            .unwrap()
            .generate();
        let (gaptable, gaplist) = RasterScanHeuristic
            .calculate(ra.view(), dec.view(), None)
            .unwrap();
        assert_eq!(gaptable.rows.len(), 48);
        assert_eq!(gaplist.large, vec![160, 320]);
    }

    #[test]
    fn test_calculate_round_trip_map_fails() {
        let (ra, dec) = RasterPatternBuilder::default()
            .num_maps(2)
            .oneway_map(false)
            .build()
            .unwrap()
            .generate();
        let failure = RasterScanHeuristic
            .calculate(ra.view(), dec.view(), Some("a.ms DV01 spw 17 field 1"))
            .unwrap_err();
        assert!(matches!(
            failure,
            RasterScanHeuristicsFailure::RoundTripRasterMap { .. }
        ));
        assert!(failure.to_string().starts_with("[a.ms DV01 spw 17 field 1] "));
    }

    #[test]
    fn test_find_raster_row_degenerate() {
        let empty = Array1::<f64>::zeros(0);
        assert!(matches!(
            find_raster_row(empty.view(), empty.view()),
            Err(RasterScanHeuristicsFailure::EmptyRows { .. })
        ));
        let single = Array1::from(vec![1.0]);
        assert_eq!(
            find_raster_row(single.view(), single.view()).unwrap(),
            vec![0, 1]
        );
        let short = Array1::from(vec![1.0, 2.0]);
        assert!(matches!(
            find_raster_row(short.view(), single.view()),
            Err(RasterScanHeuristicsFailure::InconsistentCoordinates {
                num_ra: 2,
                num_dec: 1,
                ..
            })
        ));
    }

    /// A raster with pointing jitter, a few long steps inside rows and an
    /// incomplete last row.
    fn irregular_track(angle_deg: f64, oneway_row: bool) -> (Array1<f64>, Array1<f64>) {
        let (ra, dec) = RasterPatternBuilder::default()
            .num_maps(2)
            .angle_deg(angle_deg)
            .oneway_row(oneway_row)
            .build()
            .unwrap()
            .generate();
        let num_points = ra.len() - 3;
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let mut ra = ra.slice(s![..num_points]).to_owned();
        let mut dec = dec.slice(s![..num_points]).to_owned();
        for (idx, (ra_i, dec_i)) in ra.iter_mut().zip(dec.iter_mut()).enumerate() {
            let phase = idx as f64 * 1.7;
            *ra_i += 0.002 * phase.sin();
            *dec_i += 0.002 * (phase * 0.6).cos();
        }
        for start in [45, 123, 204] {
            ra.slice_mut(s![start..]).mapv_inplace(|v| v + 0.4 * cos);
            dec.slice_mut(s![start..]).mapv_inplace(|v| v + 0.4 * sin);
        }
        (ra, dec)
    }

    #[test]
    fn test_find_raster_row_partitions_irregular_tracks() {
        for (angle_deg, oneway_row) in [(0.0, true), (30.0, true), (-150.0, true), (60.0, false)] {
            let (ra, dec) = irregular_track(angle_deg, oneway_row);
            let gaps = find_raster_row(ra.view(), dec.view()).unwrap();
            assert_eq!(gaps.first(), Some(&0), "angle {angle_deg}");
            assert_eq!(gaps.last(), Some(&ra.len()), "angle {angle_deg}");
            assert!(
                gaps.windows(2).all(|pair| pair[0] < pair[1]),
                "angle {angle_deg}: {gaps:?}"
            );
            let rows = split(&gaps);
            assert!(rows.iter().all(|row| !row.is_empty()));
            assert_eq!(rows.iter().map(Vec::len).sum::<usize>(), ra.len());
        }
    }

    #[test]
    fn test_find_raster_gap_three_maps() {
        let pattern = RasterPatternBuilder::default()
            .num_maps(3)
            .num_rows_per_map(8)
            .build()
            .unwrap();
        let (ra, dec) = pattern.generate();
        let rows = (0..24)
            .map(|row| (row * 10..(row + 1) * 10).collect_vec())
            .collect_vec();
        assert_eq!(
            find_raster_gap(ra.view(), dec.view(), &rows).unwrap(),
            vec![0, 8, 16, 24]
        );
        assert!(find_raster_gap(ra.view(), dec.view(), &[]).is_err());
    }
}
