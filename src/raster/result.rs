//! Per-dataset record of which pointing tracks were classified as raster scans.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::MeasurementSet;

/// The (antenna, spectral window, field) tracks of one dataset that could not
/// be classified as raster scans. Only failures are recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterScanHeuristicsResult {
    /// Dataset name
    pub vis: String,
    antenna_names: BTreeMap<usize, String>,
    failed: BTreeMap<usize, BTreeMap<usize, BTreeSet<usize>>>,
}

impl RasterScanHeuristicsResult {
    /// Start an empty record for `ms`, remembering its antenna names.
    pub fn new(ms: &MeasurementSet) -> Self {
        Self {
            vis: ms.name.clone(),
            antenna_names: ms
                .antennas
                .iter()
                .map(|antenna| (antenna.id, antenna.name.clone()))
                .collect(),
            failed: BTreeMap::new(),
        }
    }

    /// Record a failed classification.
    pub fn set_result_fail(&mut self, antenna_id: usize, spw_id: usize, field_id: usize) {
        self.failed
            .entry(antenna_id)
            .or_default()
            .entry(spw_id)
            .or_default()
            .insert(field_id);
    }

    /// Whether a failure was recorded for the track
    pub fn is_failed(&self, antenna_id: usize, spw_id: usize, field_id: usize) -> bool {
        self.failed
            .get(&antenna_id)
            .and_then(|spws| spws.get(&spw_id))
            .map_or(false, |fields| fields.contains(&field_id))
    }

    /// Number of tracks that failed classification
    pub fn num_failed(&self) -> usize {
        self.failed
            .values()
            .flat_map(|spws| spws.values())
            .map(BTreeSet::len)
            .sum()
    }

    /// Names of the antennas with at least one failed track, ordered by id.
    ///
    /// Antennas missing from the antenna table are reported by id.
    pub fn antennas_rasterscan_failed(&self) -> Vec<String> {
        self.failed
            .keys()
            .map(|id| {
                self.antenna_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("antenna{id}"))
            })
            .collect()
    }
}
