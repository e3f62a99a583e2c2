use std::cell::RefCell;
use std::collections::VecDeque;

use tokio::sync::Notify;

use crate::server::worker::WorkerId;

/// FIFO queue of workers currently free to accept a task. A worker is
/// enqueued when it registers and every time it reports a finished task,
/// and dequeued when a task is dispatched to it. Entries may outlive the
/// worker itself; consumers must check the id against the worker registry
/// and drop stale entries.
#[derive(Default)]
pub struct WorkerPool {
    free: RefCell<VecDeque<WorkerId>>,
    notify: Notify,
}

impl WorkerPool {
    pub fn return_available(&self, worker: WorkerId) {
        self.free.borrow_mut().push_back(worker);
        self.notify.notify_one();
    }

    #[inline]
    pub fn try_take_available(&self) -> Option<WorkerId> {
        self.free.borrow_mut().pop_front()
    }

    /// Waits until some worker is available and removes it from the
    /// queue. Callers probing for capacity put the id straight back via
    /// `return_available`.
    pub async fn take_available(&self) -> WorkerId {
        loop {
            if let Some(id) = self.try_take_available() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    #[inline]
    pub fn available_count(&self) -> usize {
        self.free.borrow().len()
    }
}
