use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{future, prelude::*};
use log::{debug, error, info};
use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};

use crate::{manager::TaskManager, MapReduce, ReportError, Task, MAX_FRAME_LEN};

/// Job coordinator: two task managers, one per phase, and the phase barrier
/// between them. All coordinator state lives in memory; if the coordinator
/// dies the job restarts from scratch.
pub struct Coordinator {
    map_tasks: TaskManager,
    reduce_tasks: TaskManager,
}

impl Coordinator {
    /// Seed one map task per input file and `n_reduce` reduce tasks, each
    /// knowing how many intermediate partitions to expect.
    pub fn new(files: Vec<PathBuf>, n_reduce: usize, timeout: Duration) -> Self {
        let n_map = files.len();
        let map_tasks = files
            .into_iter()
            .enumerate()
            .map(|(id, filename)| Task::Map {
                id,
                filename,
                n_reduce,
            })
            .collect();
        let reduce_tasks = (0..n_reduce).map(|id| Task::Reduce { id, n_map }).collect();
        Coordinator {
            map_tasks: TaskManager::new(map_tasks, timeout),
            reduce_tasks: TaskManager::new(reduce_tasks, timeout),
        }
    }

    /// Lease the next task. Checking `done()` before consulting the next
    /// manager is the whole phase barrier: no reduce task is ever handed out
    /// while a map task remains unfinished.
    pub fn assign(&self) -> Task {
        if !self.map_tasks.done() {
            self.map_tasks.next()
        } else if !self.reduce_tasks.done() {
            self.reduce_tasks.next()
        } else {
            Task::Stop
        }
    }

    /// Record a completion report, dispatching on the task variant.
    pub fn record_done(&self, task: &Task) -> Result<(), ReportError> {
        match task {
            Task::Map { id, .. } => {
                self.map_tasks.mark_done(*id);
                if self.map_tasks.done() {
                    info!("map phase complete");
                }
                Ok(())
            }
            Task::Reduce { id, .. } => {
                self.reduce_tasks.mark_done(*id);
                if self.reduce_tasks.done() {
                    info!("reduce phase complete, job done");
                }
                Ok(())
            }
            Task::Noop | Task::Stop => Err(ReportError::NotReportable),
        }
    }

    /// Whether the whole job is finished. Polled by the driving binary to
    /// decide when the process may exit.
    pub fn done(&self) -> bool {
        self.reduce_tasks.done()
    }

    /// Serve the RPC surface on localhost. Runs until the surrounding task
    /// is dropped; keeps answering `Task::Stop` after the job finishes so
    /// lagging workers still learn to terminate.
    pub async fn serve(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let mut listener = tarpc::serde_transport::tcp::listen(&server_addr, Json::default).await?;
        listener.config_mut().max_frame_length(MAX_FRAME_LEN);
        info!("coordinator listening on {}", server_addr);
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .max_channels_per_key(16, |t| t.transport().peer_addr().unwrap().ip())
            .map(|channel| {
                let handler = CoordinatorServer {
                    coordinator: self.clone(),
                };
                channel.execute(handler.serve())
            })
            .buffer_unordered(64)
            .for_each(|_| async {})
            .await;
        Ok(())
    }
}

#[derive(Clone)]
struct CoordinatorServer {
    coordinator: Arc<Coordinator>,
}

#[tarpc::server]
impl MapReduce for CoordinatorServer {
    async fn get_task(self, _: context::Context) -> Task {
        let task = self.coordinator.assign();
        debug!("get_task -> {:?}", task);
        task
    }

    async fn report_task_done(self, _: context::Context, task: Task) -> Result<(), ReportError> {
        debug!("report_task_done({:?})", task);
        self.coordinator.record_done(&task).map_err(|e| {
            error!("rejecting completion report for {:?}: {}", task, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(n_map: usize, n_reduce: usize) -> Coordinator {
        let files = (0..n_map)
            .map(|i| PathBuf::from(format!("input-{}.txt", i)))
            .collect();
        Coordinator::new(files, n_reduce, Duration::from_secs(10))
    }

    #[test]
    fn no_reduce_task_before_map_phase_done() {
        let c = coordinator(2, 2);
        let t0 = c.assign();
        let t1 = c.assign();
        assert!(matches!(t0, Task::Map { .. }));
        assert!(matches!(t1, Task::Map { .. }));
        // Both map tasks leased but unfinished: idle, never reduce.
        assert_eq!(c.assign(), Task::Noop);

        c.record_done(&t0).unwrap();
        assert_eq!(c.assign(), Task::Noop);

        c.record_done(&t1).unwrap();
        assert!(matches!(c.assign(), Task::Reduce { .. }));
    }

    #[test]
    fn reduce_tasks_carry_the_map_count() {
        let c = coordinator(3, 1);
        for _ in 0..3 {
            let t = c.assign();
            c.record_done(&t).unwrap();
        }
        match c.assign() {
            Task::Reduce { id: 0, n_map } => assert_eq!(n_map, 3),
            other => panic!("expected reduce task, got {:?}", other),
        }
    }

    #[test]
    fn stop_forever_once_both_phases_done() {
        let c = coordinator(1, 2);
        let m = c.assign();
        c.record_done(&m).unwrap();
        for _ in 0..2 {
            let r = c.assign();
            assert!(matches!(r, Task::Reduce { .. }));
            c.record_done(&r).unwrap();
        }
        assert!(c.done());
        for _ in 0..5 {
            assert_eq!(c.assign(), Task::Stop);
        }
    }

    #[test]
    fn noop_and_stop_reports_are_rejected() {
        let c = coordinator(1, 1);
        assert_eq!(c.record_done(&Task::Noop), Err(ReportError::NotReportable));
        assert_eq!(c.record_done(&Task::Stop), Err(ReportError::NotReportable));
        assert!(!c.done());
    }

    #[test]
    fn duplicate_reports_from_racing_executions_are_absorbed() {
        let c = coordinator(2, 1);
        let t0 = c.assign();
        let t1 = c.assign();
        c.record_done(&t0).unwrap();
        // The re-leased twin of t0 also completes and reports.
        c.record_done(&t0).unwrap();
        assert_eq!(c.assign(), Task::Noop);
        c.record_done(&t1).unwrap();
        assert!(matches!(c.assign(), Task::Reduce { .. }));
    }
}
