use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, trace};

use crate::Task;

/// Lease state of one task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Pending,
    Held { expires_at: Instant },
    Done,
}

#[derive(Debug)]
struct Record {
    task: Task,
    state: Lease,
}

#[derive(Debug)]
struct Inner {
    /// Arena of task records, indexed by task id.
    records: Vec<Record>,
    /// Ids ready to be leased, FIFO.
    pending: VecDeque<usize>,
    /// Lease expiries, earliest first. Entries go stale when a task is
    /// finished or re-leased; stale entries are discarded on pop.
    expiries: BinaryHeap<Reverse<(Instant, usize)>>,
    n_done: usize,
}

/// Owns one phase's tasks. Leases are reclaimed lazily: every call to
/// [`TaskManager::next`] first sweeps the expiry heap against the monotonic
/// clock and re-enqueues any task whose lease lapsed without a completion
/// report. There is no timer task per lease and no cancellation of a
/// straggler; an expired lease only makes the task leasable again.
#[derive(Debug)]
pub struct TaskManager {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl TaskManager {
    /// `tasks[i]` must have id `i`; ids index the arena.
    pub fn new(tasks: Vec<Task>, timeout: Duration) -> Self {
        debug_assert!(tasks.iter().enumerate().all(|(i, t)| t.id() == Some(i)));
        let pending = (0..tasks.len()).collect();
        let records = tasks
            .into_iter()
            .map(|task| Record {
                task,
                state: Lease::Pending,
            })
            .collect();
        TaskManager {
            inner: Mutex::new(Inner {
                records,
                pending,
                expiries: BinaryHeap::new(),
                n_done: 0,
            }),
            timeout,
        }
    }

    /// Lease the next pending task, or `Task::Noop` when none is leasable.
    /// Never blocks waiting for work to appear.
    pub fn next(&self) -> Task {
        let mut inner = self.inner.lock().unwrap();
        Self::reclaim_expired(&mut inner, Instant::now());

        while let Some(id) = inner.pending.pop_front() {
            // A task finished after being re-enqueued leaves a stale entry.
            if inner.records[id].state != Lease::Pending {
                continue;
            }
            let expires_at = Instant::now() + self.timeout;
            inner.records[id].state = Lease::Held { expires_at };
            inner.expiries.push(Reverse((expires_at, id)));
            trace!("leased task {}", id);
            return inner.records[id].task.clone();
        }
        Task::Noop
    }

    /// Idempotently record a task id as finished. Returns false for ids this
    /// manager does not track. A duplicate report, e.g. from a straggler
    /// racing its re-leased twin, changes nothing.
    pub fn mark_done(&self, id: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.records.get(id).map(|r| r.state) {
            None => false,
            Some(Lease::Done) => {
                trace!("task {} already finished, duplicate report absorbed", id);
                true
            }
            Some(_) => {
                inner.records[id].state = Lease::Done;
                inner.n_done += 1;
                true
            }
        }
    }

    /// Whether every task of this phase is finished.
    pub fn done(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.n_done == inner.records.len()
    }

    fn reclaim_expired(inner: &mut Inner, now: Instant) {
        while let Some(&Reverse((deadline, id))) = inner.expiries.peek() {
            if deadline > now {
                break;
            }
            inner.expiries.pop();
            // Only reclaim if this entry still describes the current lease.
            if inner.records[id].state == (Lease::Held { expires_at: deadline }) {
                info!("task {} not finished before lease expiry, re-enqueueing", id);
                inner.records[id].state = Lease::Pending;
                inner.pending.push_back(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn manager(n: usize, timeout: Duration) -> TaskManager {
        let tasks = (0..n).map(|id| Task::Reduce { id, n_map: 1 }).collect();
        TaskManager::new(tasks, timeout)
    }

    #[test]
    fn leases_then_idles() {
        let tm = manager(2, Duration::from_secs(10));
        assert_eq!(tm.next().id(), Some(0));
        assert_eq!(tm.next().id(), Some(1));
        assert_eq!(tm.next(), Task::Noop);
    }

    #[test]
    fn eventual_reassignment_after_timeout() {
        let tm = manager(1, Duration::from_millis(10));
        assert_eq!(tm.next().id(), Some(0));
        assert_eq!(tm.next(), Task::Noop);
        sleep(Duration::from_millis(20));
        // Lease lapsed without a report: the same task comes back.
        assert_eq!(tm.next().id(), Some(0));
    }

    #[test]
    fn expired_lease_of_finished_task_is_discarded() {
        let tm = manager(1, Duration::from_millis(10));
        assert_eq!(tm.next().id(), Some(0));
        assert!(tm.mark_done(0));
        sleep(Duration::from_millis(20));
        assert_eq!(tm.next(), Task::Noop);
        assert!(tm.done());
    }

    #[test]
    fn completion_is_monotonic_and_idempotent() {
        let tm = manager(2, Duration::from_secs(10));
        tm.next();
        tm.next();
        assert!(tm.mark_done(0));
        assert!(!tm.done());
        // Duplicate report does not change the finished count.
        assert!(tm.mark_done(0));
        assert!(!tm.done());
        assert!(tm.mark_done(1));
        assert!(tm.done());
        assert!(tm.mark_done(1));
        assert!(tm.done());
    }

    #[test]
    fn finishing_a_reenqueued_task_drops_it_from_the_queue() {
        let tm = manager(1, Duration::from_millis(10));
        assert_eq!(tm.next().id(), Some(0));
        sleep(Duration::from_millis(20));
        // The straggler reports done while the task sits re-enqueued.
        {
            let mut inner = tm.inner.lock().unwrap();
            TaskManager::reclaim_expired(&mut inner, Instant::now());
            assert_eq!(inner.pending.len(), 1);
        }
        assert!(tm.mark_done(0));
        assert_eq!(tm.next(), Task::Noop);
        assert!(tm.done());
    }

    #[test]
    fn unknown_id_is_rejected() {
        let tm = manager(1, Duration::from_secs(10));
        assert!(!tm.mark_done(7));
        assert!(!tm.done());
    }
}
