#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! Skyreduce runs single-dish reduction stages as tasks over a shared pipeline
//! context, and classifies antenna pointing tracks as raster scans.
//!
//! # Examples
//!
//! Inspect the pointing patterns of a dataset and accept the result into the
//! context.
//!
//! ```rust
//! use std::sync::Arc;
//! use skyreduce::{
//!     domain::{MeasurementSet, ObservingRun, PointingSeries},
//!     executor::NoJobRunner,
//!     inspection::{InspectRasterInputsBuilder, InspectRasterScan},
//!     raster::synthetic::RasterPatternBuilder,
//!     ExecutionContext, PipelineConfigBuilder,
//! };
//!
//! // two one-way raster maps for antenna DV01
//! let (ra, dec) = RasterPatternBuilder::default()
//!     .num_maps(2)
//!     .build()
//!     .unwrap()
//!     .generate();
//! let mut run = ObservingRun::default();
//! run.add_measurement_set(
//!     MeasurementSet::new("uid___A002_X1.ms")
//!         .with_antenna(0, "DV01")
//!         .with_pointing(PointingSeries { antenna_id: 0, spw_id: 17, field_id: 1, ra, dec }),
//! );
//!
//! // keep everything in memory
//! let config = PipelineConfigBuilder::default()
//!     .persist_results(false)
//!     .build()
//!     .unwrap();
//! let mut session = ExecutionContext::new(config, run, Arc::new(NoJobRunner)).unwrap();
//!
//! let inputs = InspectRasterInputsBuilder::default()
//!     .vis(vec!["uid___A002_X1.ms".to_string()])
//!     .build()
//!     .unwrap();
//! let results = session.execute::<InspectRasterScan>(&inputs, false);
//! results.accept(&mut session).unwrap();
//!
//! assert_eq!(session.context.results.len(), 1);
//! assert_eq!(session.context.raster_scan["uid___A002_X1.ms"].num_failed(), 0);
//! ```
//!
//! # Details
//!
//! Tasks implement [`task::StandardTask`]. [`ExecutionContext::execute`] runs
//! them as numbered stages, fanning out over datasets and containing failures.
//! Results only reach the [`Context`] through [`ResultsList::accept`].
//! Independent work can be spread over Tier0 workers with a
//! [`tier0::TaskQueue`].

pub mod config;
pub mod constants;
pub mod context;
pub mod domain;
pub mod error;
pub mod executor;
pub mod inspection;
pub mod io;
pub mod logging;
pub mod raster;
pub mod results;
pub mod task;
pub mod tier0;

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use context::{Context, ContextSnapshot, ResultProxy};
pub use error::{CLIError, JobError, PipelineError, TaskError, Tier0Error};
pub use executor::{Executor, JobRequest, JobRunner};
pub use raster::{RasterScanHeuristic, RasterScanHeuristicsFailure, RasterScanHeuristicsResult};
pub use results::{FailedTask, Payload, QaScore, ResultsList, TaskResult};
pub use task::{ExecutionContext, StandardTask, TaskInputs, TaskState};

cfg_if::cfg_if! {
    if #[cfg(feature = "cli")] {
        pub mod cli;
        pub use logging::init_logging;
    }
}

#[cfg(test)]
pub(crate) mod test_common;
