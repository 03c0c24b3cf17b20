use lazy_static::lazy_static;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    domain::{MeasurementSet, ObservingRun, PointingSeries},
    error::{JobError, TaskError},
    executor::{Executor, JobOutput, JobRequest, JobRunner},
    raster::synthetic::RasterPatternBuilder,
    results::Payload,
    task::{StandardTask, TaskInputs},
};

lazy_static! {
    /// Two one-way raster maps of 16 rows of 10 pointings.
    pub static ref ONEWAY_TRACK: (Array1<f64>, Array1<f64>) = RasterPatternBuilder::default()
        .num_maps(2)
        .build()
        .unwrap()
        .generate();

    /// Two raster maps, the second scanning its rows in reverse.
    pub static ref ROUNDTRIP_TRACK: (Array1<f64>, Array1<f64>) = RasterPatternBuilder::default()
        .num_maps(2)
        .oneway_map(false)
        .build()
        .unwrap()
        .generate();
}

/// A dataset with antennas `DV01` (one-way raster) and `DV02` (round-trip
/// raster maps unless `dv02_is_raster`) in spw 17, field 0.
pub fn synthetic_ms(name: &str, dv02_is_raster: bool) -> MeasurementSet {
    let (ra, dec) = ONEWAY_TRACK.clone();
    let (bad_ra, bad_dec) = if dv02_is_raster {
        ONEWAY_TRACK.clone()
    } else {
        ROUNDTRIP_TRACK.clone()
    };
    MeasurementSet::new(name)
        .with_antenna(0, "DV01")
        .with_antenna(1, "DV02")
        .with_pointing(PointingSeries {
            antenna_id: 0,
            spw_id: 17,
            field_id: 0,
            ra,
            dec,
        })
        .with_pointing(PointingSeries {
            antenna_id: 1,
            spw_id: 17,
            field_id: 0,
            ra: bad_ra,
            dec: bad_dec,
        })
}

/// An observing run of raster datasets.
pub fn synthetic_run(names: &[&str]) -> ObservingRun {
    let mut run = ObservingRun::default();
    for name in names {
        run.add_measurement_set(synthetic_ms(name, true));
    }
    run
}

/// Echoes a job's name and arguments back, and fails jobs called `fail`.
pub struct EchoRunner;

impl JobRunner for EchoRunner {
    fn run(&self, job: &JobRequest) -> Result<JobOutput, JobError> {
        if job.task == "fail" {
            return Err(JobError::Failed {
                task: job.task.clone(),
                message: "rejected".into(),
            });
        }
        let mut values = vec![("task".to_string(), job.task.clone())];
        values.extend(job.args.iter().cloned());
        Ok(JobOutput { values })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrateInputs {
    pub vis: Vec<String>,
    /// job to run, `gaincal` if empty
    pub job: String,
    pub fail_on: Option<String>,
    pub panic_on: Option<String>,
    pub reject_merge: bool,
    pub nested: bool,
    pub fail_nested: bool,
}

impl TaskInputs for CalibrateInputs {
    fn vis(&self) -> &[String] {
        &self.vis
    }

    fn for_vis(&self, vis: &str) -> Self {
        Self {
            vis: vec![vis.to_string()],
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caltable {
    pub vis: String,
    pub table: String,
    pub reject_merge: bool,
}

impl Payload for Caltable {
    fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
        if self.reject_merge {
            return Err(TaskError::Failed("calibration library is locked".into()));
        }
        context.register_caltable(&self.vis, &self.table);
        Ok(())
    }
}

/// A task that runs one job per dataset and registers a table for it.
pub struct Calibrate {
    inputs: CalibrateInputs,
}

impl StandardTask for Calibrate {
    type Inputs = CalibrateInputs;
    type Prepared = (String, String);
    type Payload = Caltable;

    const NAME: &'static str = "calibrate";

    fn new(inputs: CalibrateInputs) -> Self {
        Self { inputs }
    }

    fn inputs(&self) -> &CalibrateInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        context: &Context,
        executor: &mut Executor<'_>,
    ) -> Result<(String, String), TaskError> {
        let vis = self
            .inputs
            .vis
            .first()
            .ok_or_else(|| TaskError::InvalidInputs {
                task_name: Self::NAME.into(),
                reason: "no dataset".into(),
            })?;
        if context.observing_run.get_ms(vis).is_none() {
            return Err(TaskError::UnknownDataset { vis: vis.clone() });
        }
        if self.inputs.fail_on.as_ref() == Some(vis) {
            return Err(TaskError::Failed(format!("no solutions for {vis}")));
        }
        if self.inputs.panic_on.as_ref() == Some(vis) {
            panic!("solver diverged on {vis}");
        }
        let job = if self.inputs.job.is_empty() {
            "gaincal"
        } else {
            self.inputs.job.as_str()
        };
        executor.execute(&JobRequest::new(job).arg("vis", vis))?;
        if self.inputs.nested {
            let child = CalibrateInputs {
                vis: vec![vis.clone()],
                fail_on: self.inputs.fail_nested.then(|| vis.clone()),
                ..Default::default()
            };
            executor.execute_subtask::<Calibrate>(&child, context)?;
        }
        Ok((vis.clone(), executor.artifact_name(&format!("{vis}.gcal"))))
    }

    fn analyse(&self, (vis, table): (String, String)) -> Result<Caltable, TaskError> {
        Ok(Caltable {
            vis,
            table,
            reject_merge: self.inputs.reject_merge,
        })
    }
}
