use std::fmt;

use serde::{Deserialize, Serialize};

pub mod app;
pub mod kv;

mod coordinator;
mod manager;
mod task;
mod worker;

pub use coordinator::Coordinator;
pub use manager::TaskManager;
pub use task::{intermediate_path, output_path, partition, KeyValue, MapFunc, ReduceFunc, Task};
pub use worker::Worker;

/// Frame limit shared by the server listener and the client transports.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[tarpc::service]
pub trait MapReduce {
    /// Lease the next runnable task. Returns `Task::Noop` when nothing is
    /// currently leasable and `Task::Stop` once the whole job is finished.
    async fn get_task() -> Task;

    /// Report a leased task as completed. Duplicate reports for the same
    /// task are absorbed.
    async fn report_task_done(task: Task) -> Result<(), ReportError>;
}

/// Error returned to a client reporting a task the coordinator does not
/// track. Noop/Stop carry no identity and are never marked done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportError {
    NotReportable,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::NotReportable => write!(f, "task variant cannot be reported done"),
        }
    }
}

impl std::error::Error for ReportError {}
