//! The shared, persistent pipeline state.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::ObservingRun,
    io::{context_path, error::IOError, read_context, write_context},
    raster::RasterScanHeuristicsResult,
};

/// What the context remembers of an accepted result. The full result lives in
/// the artifact store under `stage_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultProxy {
    /// Stage the result belongs to
    pub stage_number: usize,
    /// Task that produced it
    pub task_name: String,
    /// Id of the results list followed by the ids of its items
    pub uuids: Vec<Uuid>,
    /// Datasets the result covers
    pub vis: Vec<String>,
    /// Whether any item failed
    pub failed: bool,
    /// Lowest QA score over all items
    pub qa_score: Option<f64>,
    /// Where the artifact store put the full result
    pub location: String,
    /// When the result was accepted
    pub accepted_at: DateTime<Utc>,
}

/// Pipeline state shared by every stage of a run.
///
/// Only top-level results mutate it, through
/// [`ResultsList::accept`](crate::results::ResultsList::accept).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    /// Name of the run, also the stem of the context file
    pub name: String,
    /// Where products and saved state go
    pub output_dir: PathBuf,
    /// Registered datasets
    pub observing_run: ObservingRun,
    /// Accepted results, in acceptance order
    pub results: Vec<ResultProxy>,
    /// Number of top-level tasks executed so far
    pub task_counter: usize,
    /// Number of sub-tasks run by the current top-level task
    pub subtask_counter: usize,
    /// Raster scan classification per dataset
    pub raster_scan: BTreeMap<String, RasterScanHeuristicsResult>,
    callibrary: BTreeMap<String, Vec<String>>,
    merged_uuids: BTreeSet<Uuid>,
}

impl Context {
    /// An empty context called `name`, writing below `output_dir`.
    pub fn new(name: impl Into<String>, output_dir: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            output_dir: output_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Whether a result id has been accepted before.
    pub fn is_merged(&self, uuid: &Uuid) -> bool {
        self.merged_uuids.contains(uuid)
    }

    pub(crate) fn register_merged(&mut self, uuids: impl IntoIterator<Item = Uuid>) {
        self.merged_uuids.extend(uuids);
    }

    /// Add a calibration table to apply to `vis`. Re-registering a table is a
    /// no-op.
    pub fn register_caltable(&mut self, vis: &str, caltable: &str) {
        let tables = self.callibrary.entry(vis.to_string()).or_default();
        if !tables.iter().any(|table| table == caltable) {
            tables.push(caltable.to_string());
        }
    }

    /// Calibration tables registered for `vis`, in registration order
    pub fn caltables(&self, vis: &str) -> &[String] {
        self.callibrary
            .get(vis)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The most recently accepted result
    pub fn last_result(&self) -> Option<&ResultProxy> {
        self.results.last()
    }

    /// Where [`Context::save`] writes
    pub fn path(&self) -> PathBuf {
        context_path(&self.output_dir, &self.name)
    }

    /// Pickle the context to `<output_dir>/<name>.context`.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be written.
    pub fn save(&self) -> Result<PathBuf, IOError> {
        let path = self.path();
        write_context(self, &path)?;
        Ok(path)
    }

    /// Load a context saved by [`Context::save`].
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or isn't a context.
    pub fn load(path: &Path) -> Result<Self, IOError> {
        read_context(path)
    }

    /// What a worker needs to run a task on `vis` without sharing this context.
    pub fn snapshot(&self, vis: &[String]) -> ContextSnapshot {
        ContextSnapshot {
            name: self.name.clone(),
            output_dir: self.output_dir.clone(),
            task_counter: self.task_counter,
            observing_run: self.observing_run.subset(vis),
            raster_scan: self
                .raster_scan
                .iter()
                .filter(|(name, _)| vis.contains(name))
                .map(|(name, result)| (name.clone(), result.clone()))
                .collect(),
            callibrary: self
                .callibrary
                .iter()
                .filter(|(name, _)| vis.contains(name))
                .map(|(name, tables)| (name.clone(), tables.clone()))
                .collect(),
        }
    }
}

/// A read-only copy of the parts of a [`Context`] relevant to some datasets,
/// shipped with sub-tasks to Tier0 workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Name of the run
    pub name: String,
    /// Output directory of the run
    pub output_dir: PathBuf,
    /// Stage the snapshot was taken in
    pub task_counter: usize,
    /// The selected datasets
    pub observing_run: ObservingRun,
    /// Raster classification of the selected datasets
    pub raster_scan: BTreeMap<String, RasterScanHeuristicsResult>,
    /// Calibration tables of the selected datasets
    pub callibrary: BTreeMap<String, Vec<String>>,
}

impl From<ContextSnapshot> for Context {
    fn from(snapshot: ContextSnapshot) -> Self {
        Self {
            name: snapshot.name,
            output_dir: snapshot.output_dir,
            observing_run: snapshot.observing_run,
            task_counter: snapshot.task_counter,
            raster_scan: snapshot.raster_scan,
            callibrary: snapshot.callibrary,
            ..Default::default()
        }
    }
}
