use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::common::{IdCounter, Map};
use crate::protocol::codec::Payload;
use crate::protocol::key::TaskKey;
use crate::protocol::RequestId;
use crate::server::worker::WorkerId;

/// Reply routed back to the call site that opened the request id found
/// in the message's `queue` field.
#[derive(Debug)]
pub enum ReplyEvent {
    Finished {
        key: TaskKey,
        worker: WorkerId,
        nbytes: u64,
        duration: f64,
    },
    Failed {
        key: TaskKey,
        exception: Payload,
        traceback: Option<Payload>,
    },
    ScatterPlaced {
        key: TaskKey,
        worker: WorkerId,
        nbytes: u64,
    },
    Value {
        key: TaskKey,
        value: Payload,
    },
    WorkerLost {
        worker: WorkerId,
    },
}

/// Correlates asynchronous worker replies with the blocked call that
/// sent the request. Each entry is owned by exactly one call site, which
/// opens it, drains the expected number of replies from the returned
/// channel and closes it again. Pushes to an id that was never opened or
/// is already closed are expected races and dropped silently.
#[derive(Default)]
pub struct ReplyTable {
    queues: Map<RequestId, UnboundedSender<ReplyEvent>>,
    id_counter: IdCounter,
}

impl ReplyTable {
    pub fn open(&mut self) -> (RequestId, UnboundedReceiver<ReplyEvent>) {
        let id = self.id_counter.next();
        let (tx, rx) = unbounded_channel();
        self.queues.insert(id, tx);
        (id, rx)
    }

    pub fn push(&self, id: RequestId, event: ReplyEvent) -> bool {
        match self.queues.get(&id) {
            Some(queue) => queue.send(event).is_ok(),
            None => {
                log::debug!("Dropping reply for unknown queue {}: {:?}", id, event);
                false
            }
        }
    }

    /// Informs every open queue that a worker went away, so no blocked
    /// call waits forever on a reply that can no longer arrive.
    pub fn broadcast_worker_lost(&self, worker: WorkerId) {
        for queue in self.queues.values() {
            let _ = queue.send(ReplyEvent::WorkerLost { worker });
        }
    }

    pub fn close(&mut self, id: RequestId) {
        self.queues.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::key::to_key;

    use super::{ReplyEvent, ReplyTable};

    fn finished(key: &str) -> ReplyEvent {
        ReplyEvent::Finished {
            key: to_key(key),
            worker: 1,
            nbytes: 0,
            duration: 0.0,
        }
    }

    #[test]
    fn push_routes_to_open_queue() {
        let mut table = ReplyTable::default();
        let (id, mut rx) = table.open();
        assert!(table.push(id, finished("x")));
        match rx.try_recv().unwrap() {
            ReplyEvent::Finished { key, .. } => assert_eq!(key, to_key("x")),
            _ => panic!("Wrong event"),
        }
    }

    #[test]
    fn push_after_close_is_noop() {
        let mut table = ReplyTable::default();
        let (id, _rx) = table.open();
        table.close(id);
        assert!(!table.push(id, finished("x")));
        // the table stays usable
        let (id2, mut rx2) = table.open();
        assert!(table.push(id2, finished("y")));
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn push_unknown_id_is_noop() {
        let table = ReplyTable::default();
        assert!(!table.push(999, finished("x")));
    }

    #[test]
    fn worker_lost_reaches_all_queues() {
        let mut table = ReplyTable::default();
        let (_a, mut rx_a) = table.open();
        let (_b, mut rx_b) = table.open();
        table.broadcast_worker_lost(3);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ReplyEvent::WorkerLost { worker: 3 }
        ));
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ReplyEvent::WorkerLost { worker: 3 }
        ));
    }
}
