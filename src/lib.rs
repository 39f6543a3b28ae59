#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod diagnostics;
mod engine;
mod error;
mod executor;
mod pool;
mod scheduler;
mod utils;

pub use crate::diagnostics::{ErrorReport, ErrorSink, Stage, Subject, TracingSink};
pub use crate::engine::{GroupResults, TaskId};
pub use crate::error::*;
pub use crate::executor::DrainReport;
pub use crate::pool::{Job, RayonPool, WorkerPool};
pub use crate::scheduler::{Scheduler, SchedulerBuilder};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
