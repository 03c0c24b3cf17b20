//! Raster scan inspection of registered datasets.
//!
//! Every (antenna, spectral window, field) pointing track of a dataset is run
//! through [`RasterScanHeuristic`], optionally on Tier0 workers. A track that
//! doesn't look like a supported raster scan is logged and recorded as failed;
//! it never stops the inspection.

use derive_builder::Builder;
use log::{debug, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::{
    constants::RASTER_FAILURE_QA_SCORE,
    context::Context,
    error::TaskError,
    executor::Executor,
    raster::{
        GapList, GapTable, RasterScanHeuristic, RasterScanHeuristicsFailure,
        RasterScanHeuristicsResult,
    },
    results::{Payload, QaScore},
    task::{StandardTask, TaskInputs},
    tier0::{Tier0Env, Tier0Work},
};

/// Inputs of [`InspectRasterScan`].
///
/// # Examples
///
/// ```rust
/// use skyreduce::inspection::InspectRasterInputsBuilder;
///
/// let inputs = InspectRasterInputsBuilder::default()
///     .vis(vec!["uid___A002_X1.ms".to_string()])
///     .parallel(true)
///     .build()
///     .unwrap();
/// assert!(inputs.parallel);
/// ```
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct InspectRasterInputs {
    /// Datasets to inspect
    pub vis: Vec<String>,

    /// Whether tracks are classified on Tier0 workers, when the run has them
    #[builder(default = "false")]
    pub parallel: bool,
}

impl InspectRasterInputsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(vis) = &self.vis {
            if vis.is_empty() {
                return Err("no datasets to inspect".into());
            }
            if let Some(name) = vis
                .iter()
                .enumerate()
                .find(|(idx, name)| vis[..*idx].contains(name))
                .map(|(_, name)| name)
            {
                return Err(format!("dataset {name} is listed twice"));
            }
        }
        Ok(())
    }
}

impl TaskInputs for InspectRasterInputs {
    fn vis(&self) -> &[String] {
        &self.vis
    }

    fn for_vis(&self, vis: &str) -> Self {
        Self {
            vis: vec![vis.to_string()],
            parallel: self.parallel,
        }
    }
}

/// One pointing track to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterAnalysisRequest {
    /// Dataset the track belongs to
    pub vis: String,
    /// Antenna id
    pub antenna_id: usize,
    /// Spectral window id
    pub spw_id: usize,
    /// Field id
    pub field_id: usize,
    /// Prefix of failure messages
    pub label: String,
    /// Right ascension, degrees
    pub ra: Array1<f64>,
    /// Declination, degrees
    pub dec: Array1<f64>,
}

/// Row and map grouping of a track recognised as a raster scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterGrouping {
    /// Antenna id
    pub antenna_id: usize,
    /// Spectral window id
    pub spw_id: usize,
    /// Field id
    pub field_id: usize,
    /// Pointing indices per row and per raster map
    pub gaptable: GapTable,
    /// Row and map boundaries
    pub gaplist: GapList,
}

impl Tier0Work for RasterAnalysisRequest {
    type Output = Result<RasterGrouping, RasterScanHeuristicsFailure>;

    fn run(self, _env: &Tier0Env) -> Self::Output {
        let (gaptable, gaplist) =
            RasterScanHeuristic.calculate(self.ra.view(), self.dec.view(), Some(&self.label))?;
        Ok(RasterGrouping {
            antenna_id: self.antenna_id,
            spw_id: self.spw_id,
            field_id: self.field_id,
            gaptable,
            gaplist,
        })
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// What the inspection found in one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectRasterResults {
    /// The dataset
    pub vis: String,
    /// Outcome of every track
    pub raster_result: RasterScanHeuristicsResult,
    /// Groupings of the tracks recognised as raster scans
    pub groupings: Vec<RasterGrouping>,
}

impl Payload for InspectRasterResults {
    fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
        if context.observing_run.get_ms(&self.vis).is_none() {
            return Err(TaskError::UnknownDataset {
                vis: self.vis.clone(),
            });
        }
        context
            .raster_scan
            .insert(self.vis.clone(), self.raster_result.clone());
        Ok(())
    }

    fn qa_scores(&self, _context: &Context) -> Vec<QaScore> {
        let failed = self.raster_result.antennas_rasterscan_failed();
        if failed.is_empty() {
            vec![QaScore::new(
                1.0,
                "Raster scan pattern detected",
                format!("Every pointing track of {} is a raster scan.", self.vis),
            )]
        } else {
            vec![QaScore::new(
                RASTER_FAILURE_QA_SCORE,
                "Raster scan pattern not detected",
                format!(
                    "Raster scan heuristics failed for antennas {} of {}.",
                    failed.join(", "),
                    self.vis
                ),
            )]
        }
    }
}

/// Classifies the pointing tracks of a dataset as raster scans.
pub struct InspectRasterScan {
    inputs: InspectRasterInputs,
}

impl StandardTask for InspectRasterScan {
    type Inputs = InspectRasterInputs;
    type Prepared = InspectRasterResults;
    type Payload = InspectRasterResults;

    const NAME: &'static str = "inspect_rasterscan";

    fn new(inputs: InspectRasterInputs) -> Self {
        Self { inputs }
    }

    fn inputs(&self) -> &InspectRasterInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        context: &Context,
        executor: &mut Executor<'_>,
    ) -> Result<InspectRasterResults, TaskError> {
        let vis = self
            .inputs
            .vis
            .first()
            .ok_or_else(|| TaskError::InvalidInputs {
                task_name: Self::NAME.into(),
                reason: "no dataset to inspect".into(),
            })?;
        let ms = context
            .observing_run
            .get_ms(vis)
            .ok_or_else(|| TaskError::UnknownDataset { vis: vis.clone() })?;

        let mut queue = executor.queue::<RasterAnalysisRequest>(self.inputs.parallel);
        let mut tracks = Vec::with_capacity(ms.pointings.len());
        for pointing in &ms.pointings {
            let antenna_name = ms
                .antenna_name(pointing.antenna_id)
                .map_or_else(|| format!("antenna{}", pointing.antenna_id), String::from);
            queue.add(RasterAnalysisRequest {
                vis: ms.name.clone(),
                antenna_id: pointing.antenna_id,
                spw_id: pointing.spw_id,
                field_id: pointing.field_id,
                label: format!(
                    "{} {} spw {} field {}",
                    ms.name, antenna_name, pointing.spw_id, pointing.field_id
                ),
                ra: pointing.ra.clone(),
                dec: pointing.dec.clone(),
            })?;
            tracks.push((pointing.antenna_id, pointing.spw_id, pointing.field_id));
        }
        debug!(
            "classifying {} tracks of {} ({})",
            tracks.len(),
            ms.name,
            if queue.is_distributed() {
                "distributed"
            } else {
                "sequential"
            }
        );

        let mut raster_result = RasterScanHeuristicsResult::new(ms);
        let mut groupings = vec![];
        for ((antenna_id, spw_id, field_id), output) in tracks.into_iter().zip(queue.get_results()?) {
            match output {
                Ok(grouping) => groupings.push(grouping),
                Err(failure) => {
                    warn!("{}", failure);
                    raster_result.set_result_fail(antenna_id, spw_id, field_id);
                }
            }
        }
        Ok(InspectRasterResults {
            vis: ms.name.clone(),
            raster_result,
            groupings,
        })
    }

    fn analyse(&self, prepared: InspectRasterResults) -> Result<InspectRasterResults, TaskError> {
        Ok(prepared)
    }
}
