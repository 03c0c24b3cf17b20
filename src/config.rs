//! Settings of a pipeline run.

use std::{fmt::Display, path::PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{constants::DEFAULT_TIER0_WORKERS, io::context_path};

/// Settings fixed for the lifetime of an
/// [`ExecutionContext`](crate::task::ExecutionContext).
///
/// # Examples
///
/// ```rust
/// use skyreduce::PipelineConfigBuilder;
///
/// let config = PipelineConfigBuilder::default()
///     .context_name("uid___A002_X1")
///     .output_dir("/tmp/reduction")
///     .parallel(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.num_workers, 4);
/// assert!(config.context_path().ends_with("uid___A002_X1.context"));
/// ```
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct PipelineConfig {
    /// Name of the run, the stem of the context file
    #[builder(setter(into), default = "\"pipeline\".to_string()")]
    pub context_name: String,

    /// Where products, the command log and saved state go
    #[builder(setter(into), default = "PathBuf::from(\".\")")]
    pub output_dir: PathBuf,

    /// Whether to start a Tier0 worker pool
    #[builder(default = "false")]
    pub parallel: bool,

    /// Number of Tier0 workers
    #[builder(default = "DEFAULT_TIER0_WORKERS")]
    pub num_workers: usize,

    /// Whether stage results, the command log and the context go to disk
    #[builder(default = "true")]
    pub persist_results: bool,

    /// Whether to skip notifying result observers
    #[builder(default = "false")]
    pub disable_weblog: bool,

    /// Whether to draw progress bars for Tier0 queues
    #[builder(default = "false")]
    pub draw_progress: bool,
}

impl PipelineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.context_name {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(format!("invalid context name {name:?}"));
            }
        }
        if self.parallel == Some(true) && self.num_workers == Some(0) {
            return Err("a parallel run needs at least one Tier0 worker".into());
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// Where the context is saved
    pub fn context_path(&self) -> PathBuf {
        context_path(&self.output_dir, &self.context_name)
    }

    /// Directory holding pickled stage results
    pub fn saved_state_dir(&self) -> PathBuf {
        self.output_dir.join(crate::constants::SAVED_STATE_DIR)
    }
}

impl Display for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will write context {} to {}",
            self.context_name,
            self.output_dir.display()
        )?;
        if self.parallel {
            writeln!(f, "Will dispatch Tier0 work to {} workers", self.num_workers)?;
        } else {
            writeln!(f, "Will run Tier0 work sequentially")?;
        }
        writeln!(
            f,
            "{} persist stage results",
            if self.persist_results { "Will" } else { "Will not" }
        )?;
        writeln!(
            f,
            "{} notify result observers",
            if self.disable_weblog { "Will not" } else { "Will" }
        )?;
        Ok(())
    }
}
