use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use skyreduce::{
    context::Context,
    domain::{MeasurementSet, ObservingRun, PointingSeries},
    error::TaskError,
    executor::{Executor, JobOutput, JobRequest, JobRunner},
    inspection::{InspectRasterInputsBuilder, InspectRasterResults, InspectRasterScan},
    raster::synthetic::RasterPatternBuilder,
    ExecutionContext, JobError, Payload, PipelineConfigBuilder, PipelineError, StandardTask,
    TaskInputs,
};
use tempfile::tempdir;

/// A dataset where `DV01` scans two one-way raster maps and `DV02` scans the
/// rows of its second map in reverse.
fn scan_ms(name: &str) -> MeasurementSet {
    let (ra, dec) = RasterPatternBuilder::default()
        .num_maps(2)
        .build()
        .unwrap()
        .generate();
    let (rt_ra, rt_dec) = RasterPatternBuilder::default()
        .num_maps(2)
        .oneway_map(false)
        .build()
        .unwrap()
        .generate();
    MeasurementSet::new(name)
        .with_antenna(0, "DV01")
        .with_antenna(1, "DV02")
        .with_pointing(PointingSeries {
            antenna_id: 0,
            spw_id: 17,
            field_id: 1,
            ra,
            dec,
        })
        .with_pointing(PointingSeries {
            antenna_id: 1,
            spw_id: 17,
            field_id: 1,
            ra: rt_ra,
            dec: rt_dec,
        })
}

fn observing_run(names: &[&str]) -> ObservingRun {
    let mut run = ObservingRun::default();
    for name in names {
        run.add_measurement_set(scan_ms(name));
    }
    run
}

/// Remembers every job it runs.
#[derive(Default)]
struct RecordingRunner {
    jobs: Mutex<Vec<String>>,
}

impl JobRunner for RecordingRunner {
    fn run(&self, job: &JobRequest) -> Result<JobOutput, JobError> {
        let vis = job.get("vis").unwrap_or_default().to_string();
        self.jobs.lock().unwrap().push(format!("{} {}", job.task, vis));
        Ok(JobOutput {
            values: vec![("table".to_string(), format!("{vis}.tsys"))],
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TsysInputs {
    vis: Vec<String>,
    reject_merge: bool,
}

impl TaskInputs for TsysInputs {
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
struct TsysTable {
    vis: String,
    table: String,
    reject_merge: bool,
}

impl Payload for TsysTable {
    fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
        if self.reject_merge {
            return Err(TaskError::Failed(format!("{} is read only", self.table)));
        }
        context.register_caltable(&self.vis, &self.table);
        Ok(())
    }
}

struct Tsyscal {
    inputs: TsysInputs,
}

impl StandardTask for Tsyscal {
    type Inputs = TsysInputs;
    type Prepared = (String, String);
    type Payload = TsysTable;

    const NAME: &'static str = "tsyscal";

    fn new(inputs: TsysInputs) -> Self {
        Self { inputs }
    }

    fn inputs(&self) -> &TsysInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        _context: &Context,
        executor: &mut Executor<'_>,
    ) -> Result<(String, String), TaskError> {
        let vis = self.inputs.vis[0].clone();
        let output = executor.execute(&JobRequest::new("gencal").arg("vis", &vis))?;
        let table = output
            .and_then(|output| output.values.into_iter().find(|(key, _)| key == "table"))
            .map_or_else(|| executor.artifact_name("tsys"), |(_, table)| table);
        Ok((vis, table))
    }

    fn analyse(&self, (vis, table): (String, String)) -> Result<TsysTable, TaskError> {
        Ok(TsysTable {
            vis,
            table,
            reject_merge: self.inputs.reject_merge,
        })
    }
}

fn session(dir: &Path, parallel: bool, runner: Arc<RecordingRunner>) -> ExecutionContext {
    let config = PipelineConfigBuilder::default()
        .context_name("uid___A002_X1")
        .output_dir(dir)
        .parallel(parallel)
        .num_workers(2_usize)
        .build()
        .unwrap();
    ExecutionContext::new(config, observing_run(&["a.ms", "b.ms"]), runner).unwrap()
}

fn tsys_inputs(vis: &[&str]) -> TsysInputs {
    TsysInputs {
        vis: vis.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn test_inspection_stage_is_stored_and_scored() {
    let tmp_dir = tempdir().unwrap();
    let mut session = session(tmp_dir.path(), false, Arc::new(RecordingRunner::default()));
    let inputs = InspectRasterInputsBuilder::default()
        .vis(vec!["a.ms".to_string(), "b.ms".to_string()])
        .build()
        .unwrap();
    let results = session.execute::<InspectRasterScan>(&inputs, false);
    assert!(!results.is_failed());
    results.accept(&mut session).unwrap();

    let proxy = session.context.last_result().unwrap();
    assert_eq!(proxy.stage_number, 1);
    assert_eq!(proxy.task_name, "inspect_rasterscan");
    assert_eq!(proxy.vis, vec!["a.ms", "b.ms"]);
    assert_eq!(proxy.qa_score, Some(0.8));
    assert!(tmp_dir
        .path()
        .join("saved_state")
        .join("result-stage1.pickle")
        .exists());
    assert_eq!(session.stored_stages().unwrap(), vec![1]);

    let stored = session.read_result::<InspectRasterResults>(1).unwrap();
    assert_eq!(stored.uuid, results.uuid);
    assert_eq!(stored.payloads().count(), 2);
    for payload in stored.payloads() {
        assert!(!payload.raster_result.is_failed(0, 17, 1));
        assert!(payload.raster_result.is_failed(1, 17, 1));
    }
    assert_eq!(
        session.context.raster_scan["b.ms"].antennas_rasterscan_failed(),
        vec!["DV02"]
    );

    let command_log = fs::read_to_string(tmp_dir.path().join("commands.log")).unwrap();
    assert!(command_log.starts_with("# stage 1 inspect_rasterscan"));
}

#[test]
fn test_parallel_inspection_matches_sequential() {
    let sequential_dir = tempdir().unwrap();
    let parallel_dir = tempdir().unwrap();
    let mut sequential = session(
        sequential_dir.path(),
        false,
        Arc::new(RecordingRunner::default()),
    );
    let mut parallel = session(parallel_dir.path(), true, Arc::new(RecordingRunner::default()));
    let inputs = InspectRasterInputsBuilder::default()
        .vis(vec!["b.ms".to_string(), "a.ms".to_string()])
        .parallel(true)
        .build()
        .unwrap();

    let expected = sequential.execute::<InspectRasterScan>(&inputs, false);
    let actual = parallel.execute::<InspectRasterScan>(&inputs, false);
    assert_eq!(actual.vis(), vec!["b.ms", "a.ms"]);
    assert_eq!(
        expected.payloads().collect::<Vec<_>>(),
        actual.payloads().collect::<Vec<_>>()
    );

    actual.accept(&mut parallel).unwrap();
    let context = parallel.finish().unwrap();
    assert_eq!(context.raster_scan.len(), 2);
}

#[test]
fn test_jobs_run_in_dataset_order() {
    let tmp_dir = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let mut session = session(tmp_dir.path(), false, runner.clone());

    let results = session.execute::<Tsyscal>(&tsys_inputs(&["b.ms", "a.ms"]), false);
    assert_eq!(*runner.jobs.lock().unwrap(), vec!["gencal b.ms", "gencal a.ms"]);
    assert_eq!(
        results.payloads().map(|p| p.table.as_str()).collect::<Vec<_>>(),
        vec!["b.ms.tsys", "a.ms.tsys"]
    );
    results.accept(&mut session).unwrap();
    assert_eq!(session.context.caltables("a.ms").to_vec(), vec!["a.ms.tsys"]);

    // dry runs only log
    let dry = session.execute::<Tsyscal>(&tsys_inputs(&["a.ms"]), true);
    assert_eq!(runner.jobs.lock().unwrap().len(), 2);
    assert_eq!(dry.payloads().next().unwrap().table, "stage2.tsyscal.tsys");
    let command_log = fs::read_to_string(tmp_dir.path().join("commands.log")).unwrap();
    assert_eq!(
        command_log
            .lines()
            .filter(|line| line.starts_with("gencal"))
            .count(),
        3
    );
}

#[test]
fn test_failed_merge_is_recorded_as_failure() {
    let tmp_dir = tempdir().unwrap();
    let mut session = session(tmp_dir.path(), false, Arc::new(RecordingRunner::default()));
    let mut inputs = tsys_inputs(&["a.ms"]);
    inputs.reject_merge = true;

    let results = session.execute::<Tsyscal>(&inputs, false);
    assert!(!results.is_failed());
    let err = results.accept(&mut session).unwrap_err();
    assert!(matches!(err, PipelineError::Merge { stage_number: 1, .. }));
    assert!(session.context.caltables("a.ms").is_empty());

    let proxy = session.context.last_result().unwrap();
    assert!(proxy.failed);
    assert_eq!(proxy.qa_score, Some(0.0));
    let stored = session.read_result::<TsysTable>(1).unwrap();
    assert!(stored.is_failed());
    assert_eq!(
        stored.items[0].failure_details().unwrap().error,
        "a.ms.tsys is read only"
    );

    assert!(matches!(
        results.accept(&mut session),
        Err(PipelineError::AlreadyMerged { .. })
    ));
    assert_eq!(session.context.results.len(), 1);
}

#[test]
fn test_resumed_run_continues_numbering() {
    let tmp_dir = tempdir().unwrap();
    let mut first = session(tmp_dir.path(), false, Arc::new(RecordingRunner::default()));
    let results = first.execute::<Tsyscal>(&tsys_inputs(&["a.ms"]), false);
    results.accept(&mut first).unwrap();
    first.finish().unwrap();

    let config = PipelineConfigBuilder::default()
        .context_name("uid___A002_X1")
        .output_dir(tmp_dir.path())
        .build()
        .unwrap();
    let mut resumed =
        ExecutionContext::resume(config, Arc::new(RecordingRunner::default())).unwrap();
    assert_eq!(resumed.context.task_counter, 1);
    assert_eq!(resumed.context.caltables("a.ms").to_vec(), vec!["a.ms.tsys"]);
    assert!(matches!(
        results.accept(&mut resumed),
        Err(PipelineError::AlreadyMerged { .. })
    ));

    let next = resumed.execute::<Tsyscal>(&tsys_inputs(&["b.ms"]), false);
    next.accept(&mut resumed).unwrap();
    assert_eq!(resumed.stored_stages().unwrap(), vec![1, 2]);

    let other = PipelineConfigBuilder::default()
        .context_name("uid___A002_X2")
        .output_dir(tmp_dir.path())
        .build()
        .unwrap();
    assert!(ExecutionContext::resume(other, Arc::new(RecordingRunner::default())).is_err());
}
