//! Useful constants.
//!
//! The raster scan thresholds were tuned against real single-dish observations.
//! Changing any of them changes which datasets are classified as raster scans.

/// Half width of the accepted scan direction window around each angle
/// histogram peak, in degrees.
pub const ANGLE_THRESHOLD_DEG: f64 = 45.0;

/// Multiple of the median absolute deviation of the step lengths beyond which a
/// step is treated as a gap.
pub const DISTANCE_THRESHOLD_FACTOR: f64 = 75.0;

/// Lower bound of the step length threshold, relative to the median step length.
///
/// Perfectly regular patterns have a median absolute deviation of zero, this
/// keeps rounding noise from being reported as gaps.
pub const DISTANCE_THRESHOLD_FLOOR: f64 = 1e-6;

/// Maximum number of median / MAD passes of the step length gap search.
pub const MAX_DISTANCE_GAP_PASSES: usize = 3;

/// Fraction of raster maps holding a single row at or above which the map
/// direction is considered round-trip.
pub const ROUND_TRIP_RASTER_SCAN_THRESHOLD_FACTOR: f64 = 0.6;

/// Allowed deviation from 180 degrees between the two peaks of a round-trip
/// raster, in degrees.
pub const TURNAROUND_ANGLE_TOLERANCE_DEG: f64 = 10.0;

/// Fraction of the median row centroid step below which a row starts a new
/// raster map.
pub const RASTER_GAP_THRESHOLD_FACTOR: f64 = 0.05;

/// Width of the scan direction histogram bins, in degrees.
pub const ANGLE_BIN_WIDTH_DEG: f64 = 1.0;

/// Peak search stops once the fraction of histogram counts not yet claimed by a
/// peak drops below this.
pub const PEAK_UNCLAIMED_FRACTION: f64 = 0.3;

/// Maximum fraction of histogram bins that peaks may claim before the scan
/// directions are considered dispersed.
pub const MAX_CLAIMED_BIN_FRACTION: f64 = 0.5;

/// Rotation applied to all scan directions when a direction straddles ±180
/// degrees and shows up as two separate peaks, in degrees.
pub const ANGLE_SHIFT_DEG: f64 = 70.0;

/// QA score of a raster inspection where some antennas could not be classified.
pub const RASTER_FAILURE_QA_SCORE: f64 = 0.8;

/// Directory below the output directory holding pickled stage results.
pub const SAVED_STATE_DIR: &str = "saved_state";

/// Extension of a pickled pipeline context.
pub const CONTEXT_FILE_EXTENSION: &str = "context";

/// Name of the external command log below the output directory.
pub const COMMAND_LOG_FILENAME: &str = "commands.log";

/// Default number of Tier0 worker threads.
pub const DEFAULT_TIER0_WORKERS: usize = 4;
