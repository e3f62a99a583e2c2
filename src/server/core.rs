use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::common::{IdCounter, Map, WrappedRcRefCell};
use crate::protocol::codec::{Packet, Payload};
use crate::protocol::key::TaskKey;
use crate::server::locations::LocationRegistry;
use crate::server::pool::WorkerPool;
use crate::server::replies::ReplyTable;
use crate::server::worker::{WorkerId, WorkerRef};

const DEFAULT_WORKER_WAIT: Duration = Duration::from_secs(15);

/// Process-wide scheduler state: the worker registry with its
/// availability queue, the data location registry, the reply correlation
/// table and the named collection store. Constructed once at startup and
/// shared by every connection.
pub struct Core {
    workers: Map<WorkerId, WorkerRef>,
    worker_addresses: Map<TaskKey, WorkerId>,
    worker_id_counter: IdCounter,

    pub pool: Rc<WorkerPool>,
    pub locations: LocationRegistry,
    pub replies: ReplyTable,
    pub collections: Map<TaskKey, Payload>,

    /// Serializes whole graph submissions; message intake continues
    /// while a submission holds it.
    pub schedule_lock: Rc<Mutex<()>>,
    /// How long a submission waits for the first worker to appear.
    pub worker_wait: Duration,

    scatter_counter: usize,
    stop_sender: Option<UnboundedSender<()>>,
}

pub type CoreRef = WrappedRcRefCell<Core>;

impl Default for Core {
    fn default() -> Self {
        Self {
            workers: Default::default(),
            worker_addresses: Default::default(),
            worker_id_counter: Default::default(),
            pool: Default::default(),
            locations: Default::default(),
            replies: Default::default(),
            collections: Default::default(),
            schedule_lock: Default::default(),
            worker_wait: DEFAULT_WORKER_WAIT,
            scatter_counter: 0,
            stop_sender: None,
        }
    }
}

impl Core {
    /// Upserts a worker under its listen address and marks it available.
    /// A repeated registration for a known address refreshes the
    /// metadata and connection but keeps the worker id, and still counts
    /// as fresh availability.
    pub fn register_worker(
        &mut self,
        address: TaskKey,
        ncpus: u32,
        sender: UnboundedSender<Packet>,
    ) -> WorkerRef {
        if let Some(&id) = self.worker_addresses.get(&address) {
            let worker_ref = self.workers[&id].clone();
            {
                let mut worker = worker_ref.get_mut();
                worker.ncpus = ncpus;
                worker.sender = sender;
            }
            self.pool.return_available(id);
            return worker_ref;
        }
        let id = self.worker_id_counter.next();
        let worker_ref = WorkerRef::new(id, ncpus, sender, address.clone());
        self.workers.insert(id, worker_ref.clone());
        self.worker_addresses.insert(address, id);
        self.pool.return_available(id);
        worker_ref
    }

    /// Removes a departed worker, drops its location entries and wakes
    /// every blocked reply consumer so nothing waits on it forever.
    pub fn unregister_worker(&mut self, worker_id: WorkerId) {
        let worker_ref = match self.workers.remove(&worker_id) {
            Some(w) => w,
            None => {
                log::debug!("Unregistering unknown worker {}", worker_id);
                return;
            }
        };
        self.worker_addresses
            .remove(&worker_ref.get().listen_address);
        let dropped = self.locations.forget_worker(worker_id);
        if !dropped.is_empty() {
            log::debug!(
                "Worker {} left with {} keys resident",
                worker_id,
                dropped.len()
            );
        }
        self.replies.broadcast_worker_lost(worker_id);
    }

    #[inline]
    pub fn get_worker_by_id(&self, id: WorkerId) -> Option<&WorkerRef> {
        self.workers.get(&id)
    }

    #[inline]
    pub fn get_workers(&self) -> Vec<WorkerRef> {
        self.workers.values().cloned().collect()
    }

    #[inline]
    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn get_and_move_scatter_counter(&mut self, size: usize) -> usize {
        let c = self.scatter_counter;
        self.scatter_counter += size;
        c
    }

    pub fn set_stop_sender(&mut self, sender: UnboundedSender<()>) {
        self.stop_sender = Some(sender);
    }

    pub fn stop(&self) {
        match &self.stop_sender {
            Some(sender) => sender
                .send(())
                .unwrap_or_else(|_| log::error!("Sending stop signal failed")),
            None => log::warn!("Stop requested but no stop channel is set"),
        }
    }
}

impl CoreRef {
    pub fn with_worker_wait(worker_wait: Duration) -> Self {
        Self::wrap(Core {
            worker_wait,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::key::to_key;
    use crate::test_util::packet_queue;

    use super::Core;

    #[test]
    fn register_is_idempotent_but_counts_availability() {
        let mut core = Core::default();
        let (tx, _rx) = packet_queue();
        let w1 = core.register_worker(to_key("tcp://w1"), 2, tx.clone());
        let w2 = core.register_worker(to_key("tcp://w1"), 4, tx);

        assert_eq!(core.worker_count(), 1);
        assert_eq!(w1.get().id, w2.get().id);
        assert_eq!(w1.get().ncpus, 4);
        // every registration call adds apparent capacity
        assert_eq!(core.pool.available_count(), 2);
    }

    #[test]
    fn unregister_drops_locations_and_wakes_queues() {
        let mut core = Core::default();
        let (tx, _rx) = packet_queue();
        let worker = core.register_worker(to_key("tcp://w1"), 1, tx);
        let id = worker.get().id;
        core.locations.record(to_key("x"), id);

        let (_qid, mut reply_rx) = core.replies.open();
        core.unregister_worker(id);

        assert!(!core.has_workers());
        assert!(!core.locations.is_resident(&to_key("x")));
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            crate::server::replies::ReplyEvent::WorkerLost { worker } if worker == id
        ));
    }

    #[test]
    fn unregister_unknown_worker_is_harmless() {
        let mut core = Core::default();
        core.unregister_worker(42);
        assert!(!core.has_workers());
    }
}
