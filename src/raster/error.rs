//! Errors that can occur while classifying raster scans

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Ways in which a pointing pattern fails to be recognised as a raster scan.
///
/// Every variant carries a `label` prefix identifying the dataset, antenna,
/// spectral window and field being analysed. It is empty until
/// [`RasterScanHeuristicsFailure::labelled`] is called.
pub enum RasterScanHeuristicsFailure {
    /// Histogram peaks claim too many bins, the scan has no dominant direction.
    #[error("{label}scan directions are too dispersed: peaks claim {num_claimed} of {num_bins} histogram bins")]
    DispersedAngles {
        /// Diagnostic prefix
        label: String,
        /// Number of histogram bins claimed by peaks
        num_claimed: usize,
        /// Total number of histogram bins
        num_bins: usize,
    },

    /// The scan direction peaks match neither a one-way nor a round-trip raster.
    #[error("{label}found {} scan direction peaks at {peaks:?} degrees, expected one, or two about 180 degrees apart", .peaks.len())]
    UnexpectedPeaks {
        /// Diagnostic prefix
        label: String,
        /// Centres of the peaks that were found, in degrees
        peaks: Vec<f64>,
    },

    /// Most raster maps hold a single row, which means the map itself
    /// alternates direction.
    #[error("{label}raster maps are round-trip ({fraction:.2} of {num_maps} maps hold a single row), which is not supported")]
    RoundTripRasterMap {
        /// Diagnostic prefix
        label: String,
        /// Fraction of maps holding a single row
        fraction: f64,
        /// Number of maps found
        num_maps: usize,
    },

    /// No rows could be formed from the pointings.
    #[error("{label}no raster rows were found")]
    EmptyRows {
        /// Diagnostic prefix
        label: String,
    },

    /// The coordinate arrays don't line up.
    #[error("{label}right ascension and declination lengths differ ({num_ra} != {num_dec})")]
    InconsistentCoordinates {
        /// Diagnostic prefix
        label: String,
        /// Number of right ascension values
        num_ra: usize,
        /// Number of declination values
        num_dec: usize,
    },
}

impl RasterScanHeuristicsFailure {
    /// Attach a diagnostic label to the failure message.
    pub fn labelled(mut self, label: &str) -> Self {
        let prefix = if label.is_empty() {
            String::new()
        } else {
            format!("[{label}] ")
        };
        match &mut self {
            Self::DispersedAngles { label, .. }
            | Self::UnexpectedPeaks { label, .. }
            | Self::RoundTripRasterMap { label, .. }
            | Self::EmptyRows { label }
            | Self::InconsistentCoordinates { label, .. } => *label = prefix,
        }
        self
    }
}
