use std::fmt;

use crate::common::{Set, WrappedRcRefCell};
use crate::protocol::clientmsg::InvocationSpec;
use crate::protocol::codec::Payload;
use crate::protocol::key::TaskKey;
use crate::server::worker::WorkerId;

#[derive(Debug)]
pub struct DataInfo {
    pub size: u64,
}

/// Runtime state of one graph node inside a submission. Leaves start in
/// `Waiting` and jump to `Finished` when their scattered value is
/// acknowledged; invocations walk waiting, ready, running, finished.
/// `Released` marks keys whose data has been evicted from workers.
pub enum TaskRunState {
    Waiting,
    Ready,
    Running(WorkerId),
    Finished(DataInfo),
    Released,
}

impl fmt::Debug for TaskRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::Waiting => 'W',
            Self::Ready => 'Y',
            Self::Running(_) => 'R',
            Self::Finished(_) => 'F',
            Self::Released => 'L',
        };
        write!(f, "{}", n)
    }
}

pub struct Task {
    pub key: TaskKey,
    pub state: TaskRunState,
    /// `None` for leaves whose value is shipped by the client.
    pub spec: Option<InvocationSpec<Payload>>,
    pub dependencies: Vec<TaskKey>,
    pub unfinished_inputs: u32,
    consumers: Set<TaskRef>,
}

pub type TaskRef = WrappedRcRefCell<Task>;

impl Task {
    #[inline]
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, TaskRunState::Waiting)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TaskRunState::Ready)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.state, TaskRunState::Running(_))
    }

    #[inline]
    pub fn is_running_on(&self, worker: WorkerId) -> bool {
        matches!(self.state, TaskRunState::Running(w) if w == worker)
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskRunState::Finished(_))
    }

    #[inline]
    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    #[inline]
    pub fn add_consumer(&mut self, consumer: TaskRef) -> bool {
        self.consumers.insert(consumer)
    }

    #[inline]
    pub fn remove_consumer(&mut self, consumer: &TaskRef) -> bool {
        self.consumers.remove(consumer)
    }

    #[inline]
    pub fn get_consumers(&self) -> &Set<TaskRef> {
        &self.consumers
    }
}

impl TaskRef {
    pub fn new(
        key: TaskKey,
        spec: Option<InvocationSpec<Payload>>,
        dependencies: Vec<TaskKey>,
        unfinished_inputs: u32,
    ) -> Self {
        Self::wrap(Task {
            key,
            spec,
            dependencies,
            unfinished_inputs,
            state: TaskRunState::Waiting,
            consumers: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::key::to_key;

    use super::{TaskRef, TaskRunState};

    fn task(key: &str) -> TaskRef {
        TaskRef::new(to_key(key), None, Vec::new(), 0)
    }

    #[test]
    fn consumer_tracking() {
        let a = task("a");
        let b = task("b");
        assert!(a.get_mut().add_consumer(b.clone()));
        assert!(!a.get_mut().add_consumer(b.clone()));
        assert!(a.get().has_consumers());
        assert!(a.get_mut().remove_consumer(&b));
        assert!(!a.get().has_consumers());
    }

    #[test]
    fn state_predicates() {
        let t = task("t");
        assert!(t.get().is_waiting());
        t.get_mut().state = TaskRunState::Running(4);
        assert!(t.get().is_running_on(4));
        assert!(!t.get().is_running_on(5));
    }
}
