//! Errors that can occur in the io module

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur in file io operations
pub enum IOError {
    /// A filesystem operation failed.
    #[error("{path}: {source}")]
    Filesystem {
        /// The path being accessed
        path: String,
        /// The underlying error
        source: std::io::Error,
    },

    /// No result has been stored for the requested stage.
    #[error("no stored result for stage {stage_number}")]
    MissingStage {
        /// The stage that was requested
        stage_number: usize,
    },

    /// A line of a pointing file could not be parsed.
    #[error("{path}:{line_number}: expected two numbers (ra dec), found \"{content}\"")]
    PointingParse {
        /// The pointing file
        path: String,
        /// 1-based line number
        line_number: usize,
        /// The offending line
        content: String,
    },

    #[error("{0}")]
    /// Error derived from [`serde_pickle::Error`]
    PickleError(#[from] serde_pickle::Error),
}

impl IOError {
    pub(crate) fn filesystem(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
