//! Mass execution of cooked validation pipelines.
//!
//! A [`MassManager`] owns a batch of jobs, hands each to an [`Executor`]
//! (in-process task or child process) and reports progress. The
//! [`MassQueue`] makes running batches addressable by queue id so
//! out-of-process workers can report results back.

pub mod executor;
pub mod manager;
pub mod queue;
pub mod service;

pub use executor::{
    Executor, InProcessExecutor, JobControl, JobHandle, JobSpec, ProcessExecutor,
    ProcessExecutorConfig, DEFAULT_GRACE_PERIOD,
};
pub use manager::{
    JobTicket, MassFinished, MassJob, MassManager, MassOptions, MassRun, Progress, TIMEOUT_MESSAGE,
};
pub use queue::{MassQueue, UpdateSchemaRequest};
pub use service::{handle_update, merge_schema, submit_request, MassResponse, QueueBinding, ServiceError};
