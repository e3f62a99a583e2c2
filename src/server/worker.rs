use tokio::sync::mpsc::UnboundedSender;

use crate::common::WrappedRcRefCell;
use crate::protocol::codec::{serialize_single_packet, Packet};
use crate::protocol::key::{TaskKey, TaskKeyRef};
use crate::protocol::workermsg::ToWorkerMessage;

pub type WorkerId = u64;

#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub ncpus: u32,
    pub listen_address: TaskKey,
    pub sender: UnboundedSender<Packet>,
}

impl Worker {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn address(&self) -> &TaskKeyRef {
        &self.listen_address
    }

    /// Queues a packet for this worker's connection. A failed send means
    /// the connection is going away; its cleanup is handled where the
    /// connection future terminates, so the failure is only logged here.
    pub fn send_packet(&self, packet: Packet) {
        self.sender
            .send(packet)
            .unwrap_or_else(|_| log::debug!("Sending to worker {} failed", self.id));
    }

    pub fn send_message(&self, message: ToWorkerMessage) -> crate::Result<()> {
        self.send_packet(serialize_single_packet(message)?);
        Ok(())
    }
}

pub type WorkerRef = WrappedRcRefCell<Worker>;

impl WorkerRef {
    pub fn new(
        id: WorkerId,
        ncpus: u32,
        sender: UnboundedSender<Packet>,
        listen_address: TaskKey,
    ) -> Self {
        Self::wrap(Worker {
            id,
            ncpus,
            sender,
            listen_address,
        })
    }
}
