//! Geometric gap detection on pointing sequences.
//!
//! A raster row advances in a constant direction with a constant step length.
//! A gap is a step that breaks either regularity: its direction falls outside
//! every dominant scan direction, or its length is an outlier.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, trace};
use ndarray::{Array1, ArrayView1, Zip};

use super::error::RasterScanHeuristicsFailure;
use crate::constants::{
    ANGLE_BIN_WIDTH_DEG, ANGLE_SHIFT_DEG, ANGLE_THRESHOLD_DEG, DISTANCE_THRESHOLD_FACTOR,
    DISTANCE_THRESHOLD_FLOOR, MAX_CLAIMED_BIN_FRACTION, MAX_DISTANCE_GAP_PASSES,
    PEAK_UNCLAIMED_FRACTION, TURNAROUND_ANGLE_TOLERANCE_DEG,
};

/// A histogram with regularly spaced bins.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// Number of values in each bin
    pub counts: Vec<usize>,
    /// Bin edges, one more than the number of bins
    pub edges: Vec<f64>,
}

impl Histogram {
    /// Number of bins
    pub fn num_bins(&self) -> usize {
        self.counts.len()
    }

    /// Centre of bin `idx`
    pub fn bin_centre(&self, idx: usize) -> f64 {
        0.5 * (self.edges[idx] + self.edges[idx + 1])
    }

    /// Total number of values held by the histogram
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Histogram `data` over `[left_edge, right_edge]` with bins of `bin_width`.
///
/// Values outside the range (and NaNs) are ignored. A value on the right edge
/// belongs to the last bin.
pub fn generate_histogram(
    data: ArrayView1<f64>,
    bin_width: f64,
    left_edge: f64,
    right_edge: f64,
) -> Histogram {
    let num_bins = ((right_edge - left_edge) / bin_width).ceil().max(1.0) as usize;
    let edges: Vec<f64> = (0..=num_bins)
        .map(|idx| left_edge + idx as f64 * bin_width)
        .collect();
    let last_edge = edges[num_bins];
    let mut counts = vec![0; num_bins];
    for &value in data.iter() {
        if !(left_edge..=last_edge).contains(&value) {
            continue;
        }
        let bin = (((value - left_edge) / bin_width).floor() as usize).min(num_bins - 1);
        counts[bin] += 1;
    }
    Histogram { counts, edges }
}

/// A contiguous run of non-empty histogram bins around a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramPeak {
    /// Sum of the counts in `left_idx..=right_idx`
    pub total: usize,
    /// Index of the maximum bin
    pub peak_idx: usize,
    /// Index of the first bin of the run
    pub left_idx: usize,
    /// Index of the last bin of the run
    pub right_idx: usize,
}

/// Find the highest unmasked bin of `counts` and grow it over the adjacent
/// non-empty, unmasked bins.
///
/// `mask[i] == true` excludes bin `i`. Ties go to the lowest index. Returns
/// `None` when no unmasked bin holds any counts.
pub fn detect_peak(counts: &[usize], mask: Option<&[bool]>) -> Option<HistogramPeak> {
    let available = |idx: usize| mask.map_or(true, |mask| !mask[idx]);

    let mut peak: Option<(usize, usize)> = None;
    for (idx, &count) in counts.iter().enumerate() {
        if !available(idx) {
            continue;
        }
        match peak {
            Some((_, best)) if best >= count => {}
            _ => peak = Some((idx, count)),
        }
    }
    let (peak_idx, peak_count) = peak?;
    if peak_count == 0 {
        return None;
    }

    let mut left_idx = peak_idx;
    while left_idx > 0 && available(left_idx - 1) && counts[left_idx - 1] > 0 {
        left_idx -= 1;
    }
    let mut right_idx = peak_idx;
    while right_idx + 1 < counts.len() && available(right_idx + 1) && counts[right_idx + 1] > 0 {
        right_idx += 1;
    }

    Some(HistogramPeak {
        total: counts[left_idx..=right_idx].iter().sum(),
        peak_idx,
        left_idx,
        right_idx,
    })
}

/// Find the dominant peaks of a histogram, returning their bin centres in the
/// order they were found.
///
/// Peaks are extracted one at a time, masking out each run of bins, until the
/// counts not yet claimed by a peak drop below [`PEAK_UNCLAIMED_FRACTION`] of
/// the total.
///
/// # Errors
///
/// Returns [`RasterScanHeuristicsFailure::DispersedAngles`] when the peaks claim
/// more than [`MAX_CLAIMED_BIN_FRACTION`] of the bins.
pub fn find_histogram_peak(
    histogram: &Histogram,
) -> Result<Vec<f64>, RasterScanHeuristicsFailure> {
    let total = histogram.total();
    let num_bins = histogram.num_bins();
    let mut mask = vec![false; num_bins];
    let mut claimed = 0;
    let mut peaks = vec![];

    if total == 0 {
        return Ok(peaks);
    }

    while let Some(peak) = detect_peak(&histogram.counts, Some(mask.as_slice())) {
        mask[peak.left_idx..=peak.right_idx].fill(true);
        claimed += peak.total;
        peaks.push(histogram.bin_centre(peak.peak_idx));
        trace!(
            "peak at {} covering bins {}..={} ({} counts)",
            histogram.bin_centre(peak.peak_idx),
            peak.left_idx,
            peak.right_idx,
            peak.total
        );

        let num_claimed = mask.iter().filter(|&&masked| masked).count();
        if num_claimed as f64 > MAX_CLAIMED_BIN_FRACTION * num_bins as f64 {
            return Err(RasterScanHeuristicsFailure::DispersedAngles {
                label: String::new(),
                num_claimed,
                num_bins,
            });
        }

        let unclaimed = (total - claimed) as f64 / total as f64;
        if unclaimed < PEAK_UNCLAIMED_FRACTION {
            break;
        }
    }
    Ok(peaks)
}

/// The angular interval `peak ± deviation` in degrees, split in two where it
/// crosses ±180.
pub fn create_range(peak: f64, deviation: f64) -> Vec<(f64, f64)> {
    let lower = peak - deviation;
    let upper = peak + deviation;
    if lower < -180.0 {
        vec![(lower + 360.0, 180.0), (-180.0, upper)]
    } else if upper > 180.0 {
        vec![(lower, 180.0), (-180.0, upper - 360.0)]
    } else {
        vec![(lower, upper)]
    }
}

/// Wrap an angle in degrees into `[-180, 180]`.
fn wrap_angle(angle: f64) -> f64 {
    if angle > 180.0 {
        angle - 360.0
    } else if angle < -180.0 {
        angle + 360.0
    } else {
        angle
    }
}

fn angle_peaks(angles: &Array1<f64>) -> Result<Vec<f64>, RasterScanHeuristicsFailure> {
    let histogram = generate_histogram(angles.view(), ANGLE_BIN_WIDTH_DEG, -180.0, 180.0);
    find_histogram_peak(&histogram)
}

/// Find the steps whose direction is outside every dominant scan direction.
///
/// A one-way raster has a single dominant direction, a round-trip raster two
/// that are roughly 180 degrees apart. A direction near ±180 degrees shows up
/// as two histogram peaks, so when three peaks are found every angle is
/// rotated by [`ANGLE_SHIFT_DEG`] and the search repeated.
///
/// Returns `i + 1` for every offending step `i`, i.e. the index of the first
/// pointing after the gap.
///
/// # Errors
///
/// Fails if the directions are dispersed, or the peaks match neither pattern.
pub fn find_angle_gap(
    delta_ra: ArrayView1<f64>,
    delta_dec: ArrayView1<f64>,
) -> Result<Vec<usize>, RasterScanHeuristicsFailure> {
    let mut angles =
        Zip::from(&delta_dec)
            .and(&delta_ra)
            .map_collect(|&ddec, &dra| ddec.atan2(dra).to_degrees());

    let mut peaks = angle_peaks(&angles)?;
    if peaks.len() == 3 {
        debug!(
            "found three scan direction peaks {:?}, rotating by {} degrees",
            peaks, ANGLE_SHIFT_DEG
        );
        angles.mapv_inplace(|angle| wrap_angle(angle + ANGLE_SHIFT_DEG));
        peaks = angle_peaks(&angles)?;
    }

    let is_raster = match peaks.as_slice() {
        [_] => true,
        [first, second] => {
            ((first - second).abs() - 180.0).abs() <= TURNAROUND_ANGLE_TOLERANCE_DEG
        }
        _ => false,
    };
    if !is_raster {
        return Err(RasterScanHeuristicsFailure::UnexpectedPeaks {
            label: String::new(),
            peaks,
        });
    }

    let ranges = peaks
        .iter()
        .flat_map(|&peak| create_range(peak, ANGLE_THRESHOLD_DEG))
        .collect_vec();
    Ok(angles
        .iter()
        .positions(|&angle| {
            !ranges
                .iter()
                .any(|&(lower, upper)| lower <= angle && angle <= upper)
        })
        .map(|idx| idx + 1)
        .collect())
}

/// Result of [`find_distance_gap`].
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceGaps {
    /// Length of every step
    pub distances: Array1<f64>,
    /// Indices of the steps whose length is an outlier
    pub gaps: Vec<usize>,
    /// Deviation from the median beyond which a step is an outlier
    pub threshold: f64,
}

/// Median of `values`, averaging the middle pair for even lengths.
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = values.iter().copied().sorted_by(f64::total_cmp).collect_vec();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}

/// Find the steps whose length is an outlier.
///
/// The median and median absolute deviation (MAD) of the step lengths are
/// recomputed over the steps not yet flagged, up to
/// [`MAX_DISTANCE_GAP_PASSES`] times or until the flagged set stops changing.
/// A step is flagged when it deviates from the median by more than
/// [`DISTANCE_THRESHOLD_FACTOR`] MADs. The threshold never drops below
/// [`DISTANCE_THRESHOLD_FLOOR`] times the median, so a perfectly regular
/// pattern (MAD of zero) doesn't report rounding noise as gaps.
///
/// Unlike [`find_angle_gap`], the returned gaps are raw step indices.
pub fn find_distance_gap(delta_ra: ArrayView1<f64>, delta_dec: ArrayView1<f64>) -> DistanceGaps {
    let distances = Zip::from(&delta_ra)
        .and(&delta_dec)
        .map_collect(|&dra, &ddec| dra.hypot(ddec));
    let mut flags = vec![false; distances.len()];
    let mut num_flagged = 0;
    let mut threshold = 0.0;

    for pass in 0..MAX_DISTANCE_GAP_PASSES {
        let kept = distances
            .iter()
            .zip(flags.iter())
            .filter(|(_, &flagged)| !flagged)
            .map(|(&distance, _)| distance)
            .collect_vec();
        let Some(centre) = median(&kept) else {
            break;
        };
        let deviations = kept.iter().map(|d| (d - centre).abs()).collect_vec();
        let mad = median(&deviations).unwrap_or(0.0);
        threshold = (DISTANCE_THRESHOLD_FACTOR * mad).max(DISTANCE_THRESHOLD_FLOOR * centre.abs());

        flags = distances
            .iter()
            .map(|d| (d - centre).abs() > threshold)
            .collect();
        let count = flags.iter().filter(|&&flagged| flagged).count();
        trace!(
            "distance pass {}: median {}, mad {}, threshold {}, {} flagged",
            pass,
            centre,
            mad,
            threshold,
            count
        );
        if count == num_flagged {
            break;
        }
        num_flagged = count;
    }

    DistanceGaps {
        gaps: flags.iter().positions(|&flagged| flagged).collect(),
        distances,
        threshold,
    }
}

/// Merge over-segmented rows.
///
/// `gaps` are row boundaries over `num_data` pointings; `0` and `num_data` are
/// added if missing. Consecutive segment lengths are accumulated until they
/// reach the most common segment length (the smallest one on ties), then a
/// boundary is emitted. A remaining tail becomes the last row.
pub fn refine_gaps(gaps: &[usize], num_data: usize) -> Vec<usize> {
    let bounds = std::iter::once(0)
        .chain(gaps.iter().copied().filter(|&gap| gap < num_data))
        .chain(std::iter::once(num_data))
        .sorted()
        .dedup()
        .collect_vec();
    let lengths = bounds.windows(2).map(|pair| pair[1] - pair[0]).collect_vec();

    let mut occurrences: BTreeMap<usize, usize> = BTreeMap::new();
    for &length in &lengths {
        *occurrences.entry(length).or_default() += 1;
    }
    let mut mode = 0;
    let mut best = 0;
    for (&length, &count) in &occurrences {
        if count > best {
            best = count;
            mode = length;
        }
    }

    let mut refined = vec![0];
    let mut position = 0;
    let mut accumulated = 0;
    for length in lengths {
        position += length;
        accumulated += length;
        if accumulated >= mode {
            refined.push(position);
            accumulated = 0;
        }
    }
    if accumulated > 0 {
        refined.push(num_data);
    }
    refined
}
