//! Task results and their acceptance into the pipeline context.

use std::{error::Error, fmt::Debug};

use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    context::{Context, ResultProxy},
    error::{PipelineError, TaskError},
    io::to_pickle,
    logging::LogRecord,
    task::{ExecutionContext, TaskState},
};

/// What a task produces on success.
pub trait Payload: Clone + Debug + Serialize + DeserializeOwned + Send + 'static {
    /// Apply this result to the shared pipeline state.
    ///
    /// # Errors
    ///
    /// A failed merge turns the accepted result into a failure.
    fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError>;

    /// QA scores, evaluated when the result is accepted at top level.
    fn qa_scores(&self, _context: &Context) -> Vec<QaScore> {
        vec![]
    }
}

/// A quality assessment of a result, from 0 (bad) to 1 (good).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaScore {
    /// The score, clamped to `[0, 1]`
    pub score: f64,
    /// One line summary
    pub shortmsg: String,
    /// Full explanation
    pub longmsg: String,
}

impl QaScore {
    /// A score with its messages.
    pub fn new(score: f64, shortmsg: impl Into<String>, longmsg: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            shortmsg: shortmsg.into(),
            longmsg: longmsg.into(),
        }
    }
}

/// All QA scores of a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaPool {
    /// Scores in evaluation order
    pub scores: Vec<QaScore>,
}

impl QaPool {
    /// The lowest score
    pub fn representative(&self) -> Option<&QaScore> {
        self.scores
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Record of a task that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    /// Name of the failed task
    pub task_name: String,
    /// Datasets it was working on
    pub vis: Vec<String>,
    /// The error message
    pub error: String,
    /// Lifecycle state the task failed in, if known
    pub failed_in: Option<TaskState>,
    /// Task frames (outermost first) followed by the error's causes
    pub trace: Vec<String>,
}

impl FailedTask {
    /// Describe `error`, raised by `task_name` while working on `vis`.
    pub fn from_error(
        task_name: &str,
        vis: &[String],
        error: &dyn Error,
        failed_in: Option<TaskState>,
        frames: Vec<String>,
    ) -> Self {
        let mut trace = frames;
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            task_name: task_name.to_string(),
            vis: vis.to_vec(),
            error: error.to_string(),
            failed_in,
            trace,
        }
    }
}

/// Success or failure of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome<P> {
    /// The task completed
    Success(P),
    /// The task failed, the error was contained
    Failed(FailedTask),
}

/// The result of one task execution on one dataset (or several, for
/// multi-dataset tasks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult<P> {
    /// Unique id, used to refuse double merges
    pub uuid: Uuid,
    /// Task that produced the result
    pub task_name: String,
    /// Datasets covered
    pub vis: Vec<String>,
    /// Stage, set at top level
    pub stage_number: Option<usize>,
    /// Printable copy of the top-level inputs
    pub inputs: Option<String>,
    /// When the lifecycle started
    pub started: Option<DateTime<Utc>>,
    /// When the lifecycle ended
    pub ended: Option<DateTime<Utc>>,
    /// QA scores, filled in at acceptance
    pub qa: QaPool,
    /// Warnings and errors logged while the task ran
    pub log_records: Vec<LogRecord>,
    /// Payload or failure
    pub outcome: Outcome<P>,
}

impl<P: Payload> TaskResult<P> {
    /// A completed result.
    pub fn success(task_name: &str, vis: Vec<String>, payload: P) -> Self {
        Self::with_outcome(task_name, vis, Outcome::Success(payload))
    }

    /// A failure sentinel.
    pub fn failure(failed: FailedTask) -> Self {
        let task_name = failed.task_name.clone();
        let vis = failed.vis.clone();
        Self::with_outcome(&task_name, vis, Outcome::Failed(failed))
    }

    fn with_outcome(task_name: &str, vis: Vec<String>, outcome: Outcome<P>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            task_name: task_name.to_string(),
            vis,
            stage_number: None,
            inputs: None,
            started: None,
            ended: None,
            qa: QaPool::default(),
            log_records: vec![],
            outcome,
        }
    }

    /// The payload, if the task completed
    pub fn payload(&self) -> Option<&P> {
        match &self.outcome {
            Outcome::Success(payload) => Some(payload),
            Outcome::Failed(_) => None,
        }
    }

    /// The failure, if the task failed
    pub fn failure_details(&self) -> Option<&FailedTask> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failed(failed) => Some(failed),
        }
    }

    fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
        match &self.outcome {
            Outcome::Success(payload) => payload.merge_with_context(context),
            Outcome::Failed(_) => Ok(()),
        }
    }

    fn score(&mut self, context: &Context) {
        match &self.outcome {
            Outcome::Success(payload) => self.qa.scores.extend(payload.qa_scores(context)),
            Outcome::Failed(failed) => self.qa.scores.push(QaScore::new(
                0.0,
                "Task failed",
                format!("{} failed: {}", failed.task_name, failed.error),
            )),
        }
    }
}

/// The results of one task execution: one item per dataset for tasks that fan
/// out, a single item otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsList<P> {
    /// Unique id of the list itself
    pub uuid: Uuid,
    /// Task that produced the results
    pub task_name: String,
    /// Stage, set at top level
    pub stage_number: Option<usize>,
    /// Per-dataset results, in input order
    pub items: Vec<TaskResult<P>>,
}

impl<P: Payload> ResultsList<P> {
    /// Wrap `items` produced by `task_name`.
    pub fn new(task_name: &str, items: Vec<TaskResult<P>>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            task_name: task_name.to_string(),
            stage_number: None,
            items,
        }
    }

    /// A list holding a single failure sentinel.
    pub fn failed(failed: FailedTask) -> Self {
        let task_name = failed.task_name.clone();
        Self::new(&task_name, vec![TaskResult::failure(failed)])
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether any item failed
    pub fn is_failed(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item.outcome, Outcome::Failed(_)))
    }

    /// Payloads of the completed items, in order
    pub fn payloads(&self) -> impl Iterator<Item = &P> {
        self.items.iter().filter_map(TaskResult::payload)
    }

    /// Datasets covered, in item order
    pub fn vis(&self) -> Vec<String> {
        self.items
            .iter()
            .flat_map(|item| item.vis.iter().cloned())
            .collect()
    }

    /// The list's id followed by every item's id
    pub fn uuids(&self) -> Vec<Uuid> {
        std::iter::once(self.uuid)
            .chain(self.items.iter().map(|item| item.uuid))
            .collect()
    }

    pub(crate) fn set_stage_number(&mut self, stage_number: usize) {
        self.stage_number = Some(stage_number);
        for item in &mut self.items {
            item.stage_number = Some(stage_number);
        }
    }

    /// Merge every completed item into `context`, stopping at the first error.
    ///
    /// Sub-task results are merged this way by their parent. Top-level
    /// results go through [`ResultsList::accept`] instead.
    ///
    /// # Errors
    ///
    /// Returns the first merge error.
    pub fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
        self.items
            .iter()
            .try_for_each(|item| item.merge_with_context(context))
    }

    /// Accept this top-level result into the run.
    ///
    /// Refuses results (or items) that were accepted before without touching
    /// the context. Otherwise merges every item into a working copy of the
    /// context, scores QA and stores the full result. The working copy only
    /// replaces the context, and the result ids only count as merged, once the
    /// store write succeeded. If a merge fails, a failure sentinel is stored
    /// and appended in place of this result and the merge error returned. If
    /// the store write fails, the context keeps its previous state, a failed
    /// [`ResultProxy`] with no location is appended and the result may be
    /// accepted again.
    ///
    /// # Errors
    ///
    /// [`PipelineError::AlreadyMerged`] on a repeated accept,
    /// [`PipelineError::Merge`] on a merge failure, or an IO error from the
    /// artifact store.
    pub fn accept(&self, session: &mut ExecutionContext) -> Result<(), PipelineError> {
        if let Some(uuid) = self
            .uuids()
            .into_iter()
            .find(|uuid| session.context.is_merged(uuid))
        {
            return Err(PipelineError::AlreadyMerged {
                uuid,
                context: session.context.name.clone(),
            });
        }

        let stage_number = self.stage_number.unwrap_or(session.context.task_counter);
        let mut working = session.context.clone();
        let (mut accepted, merge_error) = match self.merge_with_context(&mut working) {
            Ok(()) => (self.clone(), None),
            Err(source) => {
                error!(
                    "stage {}: could not merge {} results: {}",
                    stage_number, self.task_name, source
                );
                working = session.context.clone();
                let failed = FailedTask::from_error(
                    &self.task_name,
                    &self.vis(),
                    &source,
                    Some(TaskState::Completed),
                    vec![format!("{} accept", self.task_name)],
                );
                (Self::failed(failed), Some(source))
            }
        };
        accepted.set_stage_number(stage_number);
        for item in &mut accepted.items {
            item.score(&working);
        }

        let stored = to_pickle(&accepted).and_then(|bytes| session.store.put(stage_number, &bytes));
        let location = match stored {
            Ok(location) => location,
            Err(err) => {
                error!(
                    "stage {}: could not store {} results: {}",
                    stage_number, self.task_name, err
                );
                session.context.results.push(ResultProxy {
                    stage_number,
                    task_name: accepted.task_name.clone(),
                    uuids: accepted.uuids(),
                    vis: accepted.vis(),
                    failed: true,
                    qa_score: Some(0.0),
                    location: String::new(),
                    accepted_at: Utc::now(),
                });
                return Err(err.into());
            }
        };
        debug!("stage {} result stored at {}", stage_number, location);

        working.register_merged(self.uuids());
        if merge_error.is_some() {
            working.register_merged(accepted.uuids());
        }
        let proxy = ResultProxy {
            stage_number,
            task_name: accepted.task_name.clone(),
            uuids: accepted.uuids(),
            vis: accepted.vis(),
            failed: accepted.is_failed(),
            qa_score: accepted
                .items
                .iter()
                .filter_map(|item| item.qa.representative())
                .map(|score| score.score)
                .min_by(f64::total_cmp),
            location,
            accepted_at: Utc::now(),
        };
        working.results.push(proxy);
        session.context = working;
        session.notify_observers();

        match merge_error {
            Some(source) => Err(PipelineError::Merge {
                task_name: self.task_name.clone(),
                stage_number,
                source,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note(String);

    impl Payload for Note {
        fn merge_with_context(&self, context: &mut Context) -> Result<(), TaskError> {
            context.register_caltable("a.ms", &self.0);
            Ok(())
        }

        fn qa_scores(&self, _context: &Context) -> Vec<QaScore> {
            vec![
                QaScore::new(0.9, "fine", "fine"),
                QaScore::new(1.4, "clamped", "clamped"),
            ]
        }
    }

    #[test]
    fn test_qa_pool_representative_is_lowest() {
        let mut item = TaskResult::success("note", vec!["a.ms".into()], Note("x".into()));
        item.score(&Context::default());
        assert_eq!(item.qa.scores[1].score, 1.0);
        assert_eq!(item.qa.representative().unwrap().shortmsg, "fine");
        assert!(QaPool::default().representative().is_none());
    }

    #[test]
    fn test_failed_item_scores_zero() {
        let failed = FailedTask {
            task_name: "note".into(),
            vis: vec![],
            error: "bad".into(),
            failed_in: Some(TaskState::Preparing),
            trace: vec![],
        };
        let mut item = TaskResult::<Note>::failure(failed);
        item.score(&Context::default());
        assert_eq!(item.qa.representative().unwrap().score, 0.0);
        assert!(item.payload().is_none());
        assert_eq!(item.failure_details().unwrap().error, "bad");
    }

    #[test]
    fn test_failed_task_trace_walks_sources() {
        let error = crate::error::PipelineError::Merge {
            task_name: "note".into(),
            stage_number: 1,
            source: TaskError::Failed("locked".into()),
        };
        let failed = FailedTask::from_error("note", &[], &error, None, vec!["note [a.ms]".into()]);
        assert_eq!(failed.trace, vec!["note [a.ms]", "caused by: locked"]);
    }

    #[test]
    fn test_merge_with_context_skips_failures() {
        let list = ResultsList::new(
            "note",
            vec![
                TaskResult::success("note", vec!["a.ms".into()], Note("t1".into())),
                TaskResult::failure(FailedTask {
                    task_name: "note".into(),
                    vis: vec!["b.ms".into()],
                    error: "bad".into(),
                    failed_in: None,
                    trace: vec![],
                }),
            ],
        );
        let mut context = Context::default();
        list.merge_with_context(&mut context).unwrap();
        assert_eq!(context.caltables("a.ms").to_vec(), vec!["t1"]);
        assert!(list.is_failed());
        assert_eq!(list.uuids().len(), 3);
        assert_eq!(list.vis(), vec!["a.ms", "b.ms"]);
    }
}
