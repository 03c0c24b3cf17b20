//! The slice of the observing run the pipeline needs: datasets, their antennas
//! and per antenna / spectral window / field pointing tracks.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// An antenna of a dataset's antenna table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Antenna {
    /// Row index in the antenna table
    pub id: usize,
    /// Station name, e.g. `DV01`
    pub name: String,
}

/// Pointing directions of one antenna while observing one field in one
/// spectral window, in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointingSeries {
    /// Antenna id
    pub antenna_id: usize,
    /// Spectral window id
    pub spw_id: usize,
    /// Field id
    pub field_id: usize,
    /// Right ascension of each pointing
    pub ra: Array1<f64>,
    /// Declination of each pointing
    pub dec: Array1<f64>,
}

/// A measurement set registered with the observing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSet {
    /// Dataset name, also used as its key
    pub name: String,
    /// Antenna table
    pub antennas: Vec<Antenna>,
    /// Pointing tracks
    pub pointings: Vec<PointingSeries>,
}

impl MeasurementSet {
    /// Create an empty dataset called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add an antenna to the antenna table.
    pub fn with_antenna(mut self, id: usize, name: impl Into<String>) -> Self {
        self.antennas.push(Antenna {
            id,
            name: name.into(),
        });
        self
    }

    /// Add a pointing track.
    pub fn with_pointing(mut self, pointing: PointingSeries) -> Self {
        self.pointings.push(pointing);
        self
    }

    /// Station name of antenna `id`
    pub fn antenna_name(&self, id: usize) -> Option<&str> {
        self.antennas
            .iter()
            .find(|antenna| antenna.id == id)
            .map(|antenna| antenna.name.as_str())
    }
}

/// All datasets of an observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservingRun {
    /// Registered datasets, in registration order
    pub measurement_sets: Vec<MeasurementSet>,
}

impl ObservingRun {
    /// Register a dataset, replacing any dataset of the same name.
    pub fn add_measurement_set(&mut self, ms: MeasurementSet) {
        match self.measurement_sets.iter_mut().find(|m| m.name == ms.name) {
            Some(existing) => *existing = ms,
            None => self.measurement_sets.push(ms),
        }
    }

    /// Look up a dataset by name.
    pub fn get_ms(&self, name: &str) -> Option<&MeasurementSet> {
        self.measurement_sets.iter().find(|ms| ms.name == name)
    }

    /// Names of all registered datasets
    pub fn ms_names(&self) -> Vec<String> {
        self.measurement_sets
            .iter()
            .map(|ms| ms.name.clone())
            .collect()
    }

    /// A copy of the run restricted to the named datasets.
    pub fn subset(&self, names: &[String]) -> Self {
        Self {
            measurement_sets: self
                .measurement_sets
                .iter()
                .filter(|ms| names.contains(&ms.name))
                .cloned()
                .collect(),
        }
    }
}
