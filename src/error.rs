//! Errors that can occur in skyreduce

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{io::error::IOError, raster::RasterScanHeuristicsFailure};

#[derive(Error, Debug)]
/// All the errors that can reach the driver of a pipeline run
pub enum PipelineError {
    /// A result, or one of its children, has been accepted before.
    #[error("result {uuid} has already been merged into context {context}")]
    AlreadyMerged {
        /// The offending result id
        uuid: Uuid,
        /// Name of the context
        context: String,
    },

    /// A result failed to apply itself to the context.
    #[error("could not merge results of {task_name} (stage {stage_number}) into the context: {source}")]
    Merge {
        /// Task that produced the result
        task_name: String,
        /// Stage the result belongs to
        stage_number: usize,
        /// Why the merge failed
        source: TaskError,
    },

    /// Invalid run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    /// Error derived from [`IOError`]
    IOError(#[from] IOError),

    #[error("{0}")]
    /// Error derived from [`TaskError`]
    TaskError(#[from] TaskError),

    #[error("{0}")]
    /// Error derived from [`RasterScanHeuristicsFailure`]
    RasterError(#[from] RasterScanHeuristicsFailure),

    #[error("{0}")]
    /// Error derived from [`CLIError`]
    CLIError(#[from] CLIError),

    #[error("{0}")]
    /// Error derived from [`Tier0Error`]
    Tier0Error(#[from] Tier0Error),

    #[cfg(feature = "cli")]
    #[error("{0}")]
    /// Error derived from [`clap::Error`]
    ClapError(#[from] clap::Error),
}

#[derive(Error, Debug)]
/// Errors raised while a task is prepared or analysed
pub enum TaskError {
    /// The inputs name a dataset that isn't in the observing run.
    #[error("dataset {vis} is not registered with the observing run")]
    UnknownDataset {
        /// Dataset name
        vis: String,
    },

    /// Inputs that can't be acted upon.
    #[error("invalid inputs for {task_name}: {reason}")]
    InvalidInputs {
        /// Task name
        task_name: String,
        /// What is wrong with them
        reason: String,
    },

    /// A task or result specific failure.
    #[error("{0}")]
    Failed(String),

    /// The task panicked.
    #[error("{task_name} panicked: {message}")]
    Panic {
        /// Task name
        task_name: String,
        /// Panic payload, if it was a string
        message: String,
    },

    #[error("{0}")]
    /// Error derived from [`JobError`]
    JobError(#[from] JobError),

    #[error("{0}")]
    /// Error derived from [`Tier0Error`]
    Tier0Error(#[from] Tier0Error),

    #[error("{0}")]
    /// Error derived from [`IOError`]
    IOError(#[from] IOError),
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Errors from the external job runner. These cross the Tier0 boundary as data.
pub enum JobError {
    /// No runner can execute jobs in this process.
    #[error("no job runner is available to execute {task}")]
    NoRunner {
        /// Name of the job
        task: String,
    },

    /// The runner rejected or failed the job.
    #[error("{task} failed: {message}")]
    Failed {
        /// Name of the job
        task: String,
        /// Runner diagnostics
        message: String,
    },

    /// A job argument can't be quoted for the command log.
    #[error("argument {argument} of {task} can't be quoted")]
    Unquotable {
        /// Name of the job
        task: String,
        /// The offending argument
        argument: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
/// Errors from Tier0 dispatch
pub enum Tier0Error {
    /// A request or its output could not be pickled or unpickled.
    #[error("could not {action} {what}: {message}")]
    Serialization {
        /// `pickle` or `unpickle`
        action: &'static str,
        /// What was being converted
        what: String,
        /// The underlying serde-pickle error
        message: String,
    },

    /// Work panicked on a worker.
    #[error("request {request_id} panicked on a Tier0 worker: {message}")]
    WorkerPanic {
        /// Queue-assigned request id
        request_id: u64,
        /// Panic payload, if it was a string
        message: String,
    },

    /// All workers have gone away.
    #[error("the Tier0 worker pool has shut down")]
    Disconnected,

    /// A worker thread could not be started.
    #[error("could not start a Tier0 worker: {0}")]
    Spawn(String),
}

#[derive(Error, Debug)]
/// Command line arguments that parse but make no sense
pub enum CLIError {
    /// An argument is out of range.
    #[error("Invalid argument for {option}: expected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The offending option
        option: String,
        /// What was expected
        expected: String,
        /// What was given
        received: String,
    },
}

/// Best effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
