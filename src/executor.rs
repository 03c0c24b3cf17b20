//! Execution of external jobs and sub-tasks on behalf of a running task.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    error::{JobError, TaskError},
    io::error::IOError,
    results::ResultsList,
    task::{execute_scoped, StandardTask, TaskInputs, TaskState},
    tier0::{Tier0Env, Tier0Pool, Tier0TaskRequest, Tier0Work, TaskQueue},
};

/// A named external job with ordered keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job name
    pub task: String,
    /// Keyword arguments, in the order they were given
    pub args: Vec<(String, String)>,
}

impl JobRequest {
    /// A job with no arguments.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: vec![],
        }
    }

    /// Add a keyword argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }

    /// Value of keyword argument `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The job as a shell-quoted command line.
    ///
    /// # Errors
    ///
    /// Fails if an argument holds a nul byte.
    pub fn command_line(&self) -> Result<String, JobError> {
        let words = std::iter::once(self.task.clone())
            .chain(self.args.iter().map(|(key, value)| format!("{key}={value}")))
            .collect::<Vec<_>>();
        shlex::try_join(words.iter().map(String::as_str)).map_err(|_| JobError::Unquotable {
            task: self.task.clone(),
            argument: words
                .iter()
                .find(|word| word.contains('\0'))
                .cloned()
                .unwrap_or_default(),
        })
    }
}

impl Tier0Work for JobRequest {
    type Output = Result<JobOutput, JobError>;

    fn run(self, env: &Tier0Env) -> Self::Output {
        env.runner.run(&self)
    }

    fn describe(&self) -> String {
        self.task.clone()
    }
}

/// What a job returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Named return values
    pub values: Vec<(String, String)>,
}

/// The external tool that carries out jobs.
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion.
    ///
    /// # Errors
    ///
    /// Any failure reported by the tool.
    fn run(&self, job: &JobRequest) -> Result<JobOutput, JobError>;
}

/// A runner for processes that can't execute jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJobRunner;

impl JobRunner for NoJobRunner {
    fn run(&self, job: &JobRequest) -> Result<JobOutput, JobError> {
        Err(JobError::NoRunner {
            task: job.task.clone(),
        })
    }
}

/// One line of the command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    /// Stage the command was issued in
    pub stage_number: usize,
    /// Task that issued it
    pub task_name: String,
    /// When it was issued
    pub timestamp: DateTime<Utc>,
    /// The command
    pub command: String,
}

/// Every task invocation and job of a run, in issue order, optionally
/// mirrored to a file.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Vec<CommandLogEntry>,
    path: Option<PathBuf>,
}

impl CommandLog {
    /// A log appending to `path`, if given.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: vec![],
            path,
        }
    }

    /// The file the log is mirrored to
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entries so far
    pub fn entries(&self) -> &[CommandLogEntry] {
        &self.entries
    }

    /// Append a command.
    ///
    /// # Errors
    ///
    /// Fails if the mirror file can't be written. The entry is kept anyway.
    pub fn record(
        &mut self,
        stage_number: usize,
        task_name: &str,
        command: &str,
    ) -> Result<(), IOError> {
        let entry = CommandLogEntry {
            stage_number,
            task_name: task_name.to_string(),
            timestamp: Utc::now(),
            command: command.to_string(),
        };
        let mirrored = match &self.path {
            Some(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| {
                    writeln!(
                        file,
                        "# stage {} {} {}\n{}",
                        entry.stage_number,
                        entry.task_name,
                        entry.timestamp.to_rfc3339(),
                        entry.command
                    )
                })
                .map_err(|e| IOError::filesystem(path, e)),
            None => Ok(()),
        };
        self.entries.push(entry);
        mirrored
    }
}

/// Runs jobs and sub-tasks for one top-level task execution.
///
/// Holds the dry-run switch, the execution depth (0 for the top-level task)
/// and the frames of the tasks currently executing.
pub struct Executor<'a> {
    env: &'a Tier0Env,
    command_log: &'a mut CommandLog,
    pool: Option<&'a Tier0Pool>,
    stage_number: usize,
    dry_run: bool,
    draw_progress: bool,
    depth: usize,
    subtask_counter: usize,
    frames: Vec<String>,
    state: TaskState,
    failure_trace: Option<(Vec<String>, TaskState)>,
}

impl<'a> Executor<'a> {
    /// An executor for `stage_number`, without Tier0 pool.
    pub fn new(env: &'a Tier0Env, command_log: &'a mut CommandLog, stage_number: usize) -> Self {
        Self {
            env,
            command_log,
            pool: None,
            stage_number,
            dry_run: false,
            draw_progress: false,
            depth: 0,
            subtask_counter: 0,
            frames: vec![],
            state: TaskState::Created,
            failure_trace: None,
        }
    }

    /// Dispatch queues to `pool` when they ask for parallelism.
    pub fn with_pool(mut self, pool: Option<&'a Tier0Pool>) -> Self {
        self.pool = pool;
        self
    }

    /// Record jobs without running them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Draw progress bars for queues.
    pub fn with_progress(mut self, draw_progress: bool) -> Self {
        self.draw_progress = draw_progress;
        self
    }

    /// Whether jobs are only recorded
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Stage being executed
    pub fn stage_number(&self) -> usize {
        self.stage_number
    }

    /// 0 while running the top-level task, more inside sub-tasks
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Sub-tasks started so far
    pub fn subtask_counter(&self) -> usize {
        self.subtask_counter
    }

    /// Task frames currently executing, outermost first
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    fn current_task(&self) -> &str {
        self.frames
            .last()
            .and_then(|frame| frame.split(' ').next())
            .unwrap_or("pipeline")
    }

    /// A product filename namespaced by stage and top-level task.
    pub fn artifact_name(&self, suffix: &str) -> String {
        let task = self
            .frames
            .first()
            .and_then(|frame| frame.split(' ').next())
            .unwrap_or("pipeline");
        format!("stage{}.{}.{}", self.stage_number, task, suffix)
    }

    /// Record `job` in the command log and, unless this is a dry run, run it.
    ///
    /// # Errors
    ///
    /// Fails if the job can't be quoted or the runner fails it.
    pub fn execute(&mut self, job: &JobRequest) -> Result<Option<JobOutput>, TaskError> {
        let command = job.command_line()?;
        let task_name = self.current_task().to_string();
        self.command_log
            .record(self.stage_number, &task_name, &command)?;
        if self.dry_run {
            info!("dry run: {}", command);
            return Ok(None);
        }
        debug!("running {}", command);
        Ok(Some(self.env.runner.run(job)?))
    }

    /// A queue for independent work. It is distributed to the Tier0 pool only
    /// if `parallel` is set and the run has a pool.
    pub fn queue<W: Tier0Work>(&self, parallel: bool) -> TaskQueue<'a, W> {
        TaskQueue::new(self.pool, self.env.clone(), parallel).with_progress(self.draw_progress)
    }

    /// Record `job` in the command log and add it to `queue`. Dry runs only
    /// record it and return `None`.
    ///
    /// # Errors
    ///
    /// Fails if the job can't be quoted, logged or pickled.
    pub fn submit_job(
        &mut self,
        queue: &mut TaskQueue<'a, JobRequest>,
        job: JobRequest,
    ) -> Result<Option<usize>, TaskError> {
        let command = job.command_line()?;
        let task_name = self.current_task().to_string();
        self.command_log
            .record(self.stage_number, &task_name, &command)?;
        if self.dry_run {
            info!("dry run: {}", command);
            return Ok(None);
        }
        Ok(Some(queue.add(job)?))
    }

    /// Run a child task through the full lifecycle, one level deeper.
    ///
    /// # Errors
    ///
    /// The child's errors propagate unchanged.
    pub fn execute_subtask<T: StandardTask>(
        &mut self,
        inputs: &T::Inputs,
        context: &Context,
    ) -> Result<ResultsList<T::Payload>, TaskError> {
        self.subtask_counter += 1;
        trace!(
            "sub-task {} ({}) at depth {}",
            self.subtask_counter,
            T::NAME,
            self.depth + 1
        );
        let task = T::new(inputs.clone());
        self.descend(|executor| execute_scoped(task, context, executor))
    }

    /// Package a child task for a Tier0 queue, with a snapshot of the parts of
    /// `context` it needs.
    pub fn tier0_subtask<T: StandardTask>(
        &mut self,
        inputs: &T::Inputs,
        context: &Context,
    ) -> Tier0TaskRequest<T> {
        self.subtask_counter += 1;
        Tier0TaskRequest::new(
            inputs.clone(),
            context.snapshot(inputs.vis()),
            self.dry_run,
        )
    }

    pub(crate) fn descend<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    pub(crate) fn enter(&mut self, task_name: &str, vis: &[String]) {
        self.frames.push(format!("{} [{}]", task_name, vis.join(", ")));
    }

    pub(crate) fn leave(&mut self) {
        self.frames.pop();
    }

    /// Lifecycle state of the innermost task running or last run
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn transition(&mut self, task_name: &str, state: TaskState) {
        trace!("{}: {} -> {}", task_name, self.state, state);
        self.state = state;
    }

    pub(crate) fn restore_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn note_failure(&mut self, state: TaskState) {
        if self.failure_trace.is_none() {
            self.failure_trace = Some((self.frames.clone(), state));
        }
    }

    /// Frames and lifecycle state of the innermost failure, if any
    pub(crate) fn failure_trace(&self) -> Option<&(Vec<String>, TaskState)> {
        self.failure_trace.as_ref()
    }
}
