//! The standard task lifecycle and the session that drives it.
//!
//! A task goes `Created -> Preparing -> Analysing -> Completed`, or ends in
//! `Failed` from either working state. Tasks that handle one dataset at a time
//! are fanned out over the datasets of their inputs, in input order. Errors and
//! panics of a top-level task are turned into failure sentinels by
//! [`ExecutionContext::execute`]. Inside sub-tasks they propagate unchanged.

use std::{
    fmt::{Debug, Display},
    fs,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
};

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    config::PipelineConfig,
    constants::COMMAND_LOG_FILENAME,
    context::{Context, ResultProxy},
    domain::ObservingRun,
    error::{panic_message, PipelineError, TaskError},
    executor::{CommandLog, Executor, JobRunner},
    io::{
        error::IOError,
        from_pickle,
        store::{ArtifactStore, DiskStore, MemoryStore},
    },
    logging::CaptureFrame,
    results::{FailedTask, Payload, ResultsList, TaskResult},
    tier0::{Tier0Env, Tier0Pool},
};

/// Inputs of a task. Cloned before every execution, so a task can't modify
/// its caller's copy.
pub trait TaskInputs: Clone + Debug + Serialize + DeserializeOwned + Send + 'static {
    /// Datasets the inputs refer to
    fn vis(&self) -> &[String];

    /// A copy scoped to the single dataset `vis`.
    fn for_vis(&self, vis: &str) -> Self;
}

/// A pipeline task: a `prepare` step that does the work, followed by an
/// `analyse` step that turns it into a payload.
pub trait StandardTask: Sized + 'static {
    /// Inputs of the task
    type Inputs: TaskInputs;
    /// What `prepare` hands to `analyse`
    type Prepared;
    /// What the task produces
    type Payload: Payload;

    /// Name used in logs, artifact names and the command log
    const NAME: &'static str;

    /// Whether one execution handles all datasets of its inputs at once
    const IS_MULTI_VIS_TASK: bool = false;

    /// A fresh task instance. Instances are single-use.
    fn new(inputs: Self::Inputs) -> Self;

    /// Inputs of this instance
    fn inputs(&self) -> &Self::Inputs;

    /// Do the work: run jobs, sub-tasks or Tier0 queues through `executor`.
    /// `context` is read-only while the task is in flight.
    ///
    /// # Errors
    ///
    /// Anything that stops the task.
    fn prepare(
        &self,
        context: &Context,
        executor: &mut Executor<'_>,
    ) -> Result<Self::Prepared, TaskError>;

    /// Post-process what `prepare` produced.
    ///
    /// # Errors
    ///
    /// Anything that stops the task.
    fn analyse(&self, prepared: Self::Prepared) -> Result<Self::Payload, TaskError>;
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not started
    Created,
    /// Running `prepare`
    Preparing,
    /// Running `analyse`
    Analysing,
    /// Done, with a payload
    Completed,
    /// Stopped by an error or panic
    Failed,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Preparing => "EXECUTING(prepare)",
            Self::Analysing => "EXECUTING(analyse)",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

fn run_lifecycle<T: StandardTask>(
    task: &T,
    context: &Context,
    executor: &mut Executor<'_>,
) -> Result<T::Payload, TaskError> {
    executor.transition(T::NAME, TaskState::Preparing);
    let prepared = task.prepare(context, executor)?;
    executor.transition(T::NAME, TaskState::Analysing);
    let payload = task.analyse(prepared)?;
    executor.transition(T::NAME, TaskState::Completed);
    Ok(payload)
}

/// Run `task` at the executor's current depth: fan out over datasets if the
/// task handles one at a time, otherwise run its lifecycle once.
pub(crate) fn execute_scoped<T: StandardTask>(
    task: T,
    context: &Context,
    executor: &mut Executor<'_>,
) -> Result<ResultsList<T::Payload>, TaskError> {
    let vis = task.inputs().vis().to_vec();
    executor.enter(T::NAME, &vis);

    if !T::IS_MULTI_VIS_TASK && vis.len() > 1 {
        debug!("{} fans out over {} datasets", T::NAME, vis.len());
        let mut items = Vec::with_capacity(vis.len());
        for name in &vis {
            let child = T::new(task.inputs().for_vis(name));
            match executor.descend(|executor| execute_scoped(child, context, executor)) {
                Ok(results) => items.extend(results.items),
                Err(e) => {
                    executor.leave();
                    return Err(e);
                }
            }
        }
        executor.leave();
        return Ok(ResultsList::new(T::NAME, items));
    }

    let outer_state = executor.state();
    let frame = CaptureFrame::start();
    let started = Utc::now();
    let outcome = run_lifecycle(&task, context, executor);
    let log_records = frame.finish();
    let payload = match outcome {
        Ok(payload) => payload,
        Err(e) => {
            executor.note_failure(executor.state());
            executor.transition(T::NAME, TaskState::Failed);
            executor.leave();
            return Err(e);
        }
    };
    executor.restore_state(outer_state);
    executor.leave();

    let mut item = TaskResult::success(T::NAME, vis, payload);
    item.started = Some(started);
    item.ended = Some(Utc::now());
    item.log_records = log_records;
    Ok(ResultsList::new(T::NAME, vec![item]))
}

/// Presentation hook told about every accepted top-level result.
pub trait ResultsObserver {
    /// Called after `proxy` was appended to `context.results`.
    fn on_accept(&mut self, context: &Context, proxy: &ResultProxy);
}

/// One pipeline run: the shared context, where results are stored, the
/// command log, the job runner and, for parallel runs, the Tier0 pool.
pub struct ExecutionContext {
    /// Settings of the run
    pub config: PipelineConfig,
    /// The shared pipeline state
    pub context: Context,
    pub(crate) store: Box<dyn ArtifactStore>,
    observers: Vec<Box<dyn ResultsObserver>>,
    env: Tier0Env,
    command_log: CommandLog,
    pool: Option<Tier0Pool>,
    current_task: Option<String>,
}

impl ExecutionContext {
    /// Start a run over `observing_run`.
    ///
    /// # Errors
    ///
    /// Fails if the output directories can't be created or the Tier0 pool
    /// can't be started.
    pub fn new(
        config: PipelineConfig,
        observing_run: ObservingRun,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self, PipelineError> {
        let mut context = Context::new(config.context_name.clone(), &config.output_dir);
        context.observing_run = observing_run;
        Self::with_context(config, context, runner)
    }

    /// Continue a run from the context file it saved.
    ///
    /// # Errors
    ///
    /// Fails if the context can't be loaded or belongs to another run, and
    /// for the reasons [`ExecutionContext::new`] does.
    pub fn resume(config: PipelineConfig, runner: Arc<dyn JobRunner>) -> Result<Self, PipelineError> {
        let context = Context::load(&config.context_path())?;
        if context.name != config.context_name {
            return Err(PipelineError::Config(format!(
                "{} holds context {}, not {}",
                config.context_path().display(),
                context.name,
                config.context_name
            )));
        }
        info!(
            "resuming {} after stage {}",
            context.name, context.task_counter
        );
        Self::with_context(config, context, runner)
    }

    fn with_context(
        config: PipelineConfig,
        context: Context,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self, PipelineError> {
        for line in config.to_string().lines() {
            info!("{}", line);
        }
        let (store, command_log): (Box<dyn ArtifactStore>, CommandLog) = if config.persist_results {
            fs::create_dir_all(&config.output_dir)
                .map_err(|e| IOError::filesystem(&config.output_dir, e))?;
            (
                Box::new(DiskStore::new(config.saved_state_dir())?),
                CommandLog::new(Some(config.output_dir.join(COMMAND_LOG_FILENAME))),
            )
        } else {
            (Box::new(MemoryStore::default()), CommandLog::default())
        };
        let pool = if config.parallel {
            Some(Tier0Pool::new(config.num_workers, runner.clone())?)
        } else {
            None
        };
        Ok(Self {
            config,
            context,
            store,
            observers: vec![],
            env: Tier0Env::new(runner),
            command_log,
            pool,
            current_task: None,
        })
    }

    /// Register a presentation hook.
    pub fn add_observer(&mut self, observer: Box<dyn ResultsObserver>) {
        self.observers.push(observer);
    }

    /// Execute a top-level task as the next stage.
    ///
    /// Never fails: errors and panics raised while the task runs come back as
    /// a results list holding a single failure sentinel. Nothing is merged
    /// into the context until the result is accepted.
    pub fn execute<T: StandardTask>(
        &mut self,
        inputs: &T::Inputs,
        dry_run: bool,
    ) -> ResultsList<T::Payload> {
        self.context.task_counter += 1;
        self.context.subtask_counter = 0;
        let stage_number = self.context.task_counter;
        self.current_task = Some(T::NAME.to_string());
        let inputs_text = format!("{inputs:?}");
        info!(
            "stage {}: {} [{}]",
            stage_number,
            T::NAME,
            inputs.vis().join(", ")
        );
        if let Err(e) = self
            .command_log
            .record(stage_number, T::NAME, &format!("{} {}", T::NAME, inputs_text))
        {
            warn!("could not write the command log: {}", e);
        }

        let task = T::new(inputs.clone());
        let mut executor = Executor::new(&self.env, &mut self.command_log, stage_number)
            .with_pool(self.pool.as_ref())
            .with_dry_run(dry_run)
            .with_progress(self.config.draw_progress);
        let context = &self.context;
        let frame = CaptureFrame::start();
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| execute_scoped(task, context, &mut executor)));
        let log_records = frame.finish();

        let failure = match outcome {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => {
                let (frames, state) = executor
                    .failure_trace()
                    .map(|(frames, state)| (frames.clone(), Some(*state)))
                    .unwrap_or_else(|| (executor.frames().to_vec(), None));
                Err(FailedTask::from_error(T::NAME, inputs.vis(), &e, state, frames))
            }
            Err(payload) => {
                let e = TaskError::Panic {
                    task_name: T::NAME.to_string(),
                    message: panic_message(payload.as_ref()),
                };
                let frames = executor.frames().to_vec();
                Err(FailedTask::from_error(
                    T::NAME,
                    inputs.vis(),
                    &e,
                    Some(executor.state()),
                    frames,
                ))
            }
        };
        let subtask_counter = executor.subtask_counter();

        let mut results = match failure {
            Ok(results) => results,
            Err(failed) => {
                error!(
                    "stage {}: {} failed in {}: {}",
                    stage_number,
                    T::NAME,
                    failed
                        .failed_in
                        .map_or_else(|| "unknown state".to_string(), |state| state.to_string()),
                    failed.error
                );
                let mut sentinel = ResultsList::failed(failed);
                for item in &mut sentinel.items {
                    item.log_records = log_records.clone();
                }
                sentinel
            }
        };
        self.context.subtask_counter = subtask_counter;
        results.set_stage_number(stage_number);
        for item in &mut results.items {
            item.inputs = Some(inputs_text.clone());
        }
        results
    }

    /// Name of the top-level task executed last
    pub fn current_task_name(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    /// A product filename namespaced by the current stage and task.
    pub fn artifact_name(&self, suffix: &str) -> String {
        format!(
            "stage{}.{}.{}",
            self.context.task_counter,
            self.current_task.as_deref().unwrap_or("pipeline"),
            suffix
        )
    }

    /// Every task invocation and job of this run
    pub fn command_log(&self) -> &CommandLog {
        &self.command_log
    }

    /// Whether Tier0 work goes to a worker pool
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Fetch the full result of an accepted stage back from the store.
    ///
    /// # Errors
    ///
    /// Fails if the stage has no stored result, or it holds another payload.
    pub fn read_result<P: Payload>(&self, stage_number: usize) -> Result<ResultsList<P>, IOError> {
        from_pickle(&self.store.get(stage_number)?)
    }

    /// Stages with a stored result
    ///
    /// # Errors
    ///
    /// Fails if the store can't be listed.
    pub fn stored_stages(&self) -> Result<Vec<usize>, IOError> {
        self.store.stages()
    }

    /// Write the context file.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be written.
    pub fn save_context(&self) -> Result<PathBuf, IOError> {
        self.context.save()
    }

    /// End the run: save the context if results persist, stop the Tier0
    /// workers, and hand back the final context.
    ///
    /// # Errors
    ///
    /// Fails if the context can't be saved.
    pub fn finish(self) -> Result<Context, PipelineError> {
        if self.config.persist_results {
            let path = self.save_context()?;
            info!("context saved to {}", path.display());
        }
        let Self { context, pool, .. } = self;
        drop(pool);
        Ok(context)
    }

    pub(crate) fn notify_observers(&mut self) {
        if self.config.disable_weblog {
            return;
        }
        if let Some(proxy) = self.context.results.last() {
            trace!("notifying {} observers of stage {}", self.observers.len(), proxy.stage_number);
            for observer in &mut self.observers {
                observer.on_accept(&self.context, proxy);
            }
        }
    }
}

impl Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("config", &self.config)
            .field("context", &self.context.name)
            .field("stage", &self.context.task_counter)
            .field("parallel", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}
