use serde::{Deserialize, Serialize};

use crate::protocol::codec::{
    Frames, FromTransport, MessageBuilder, Payload, PayloadTransport,
};
use crate::protocol::key::TaskKey;
pub use crate::protocol::workermsg::StatusReplyMsg;

/// One argument of a task invocation. A string argument names a
/// dependency if it resolves to another task in the same submission or to
/// data already resident on a worker; otherwise it is passed through to
/// the worker as a literal.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum TaskArg<T = Payload> {
    Key(TaskKey),
    Value(T),
}

impl TaskArg<PayloadTransport> {
    pub fn to_memory(self, frames: &mut Frames) -> TaskArg<Payload> {
        match self {
            TaskArg::Key(key) => TaskArg::Key(key),
            TaskArg::Value(v) => TaskArg::Value(v.to_memory(frames)),
        }
    }
}

impl TaskArg<Payload> {
    pub fn to_transport<T: Serialize>(
        &self,
        builder: &mut MessageBuilder<T>,
    ) -> TaskArg<PayloadTransport> {
        match self {
            TaskArg::Key(key) => TaskArg::Key(key.clone()),
            TaskArg::Value(v) => TaskArg::Value(v.to_transport(builder)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct InvocationSpec<T = Payload> {
    pub function: T,
    pub args: Vec<TaskArg<T>>,
}

/// Definition of one graph node: either a value the client ships inline
/// (a leaf) or an invocation of an opaque callable with arguments.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum TaskSpec<T = Payload> {
    Invocation(InvocationSpec<T>),
    Literal(T),
}

pub fn task_spec_to_memory(spec: TaskSpec<PayloadTransport>, frames: &mut Frames) -> TaskSpec<Payload> {
    match spec {
        TaskSpec::Literal(v) => TaskSpec::Literal(v.to_memory(frames)),
        TaskSpec::Invocation(InvocationSpec { function, args }) => {
            TaskSpec::Invocation(InvocationSpec {
                function: function.to_memory(frames),
                args: args.into_iter().map(|a| a.to_memory(frames)).collect(),
            })
        }
    }
}

/// Requested result keys, nested arbitrarily. The reply mirrors this
/// shape exactly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum KeySelection {
    Key(TaskKey),
    List(Vec<KeySelection>),
}

impl KeySelection {
    pub fn flatten(&self) -> Vec<TaskKey> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<TaskKey>) {
        match self {
            KeySelection::Key(key) => out.push(key.clone()),
            KeySelection::List(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScheduleMsg<T = Payload> {
    #[serde(with = "tuple_vec_map")]
    pub graph: Vec<(TaskKey, TaskSpec<T>)>,
    pub keys: KeySelection,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SetCollectionMsg<T = Payload> {
    pub name: TaskKey,
    pub value: T,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetCollectionMsg {
    pub name: TaskKey,
}

/// Messages arriving on a client connection.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
#[serde(rename_all = "kebab-case")]
pub enum FromClientMessage<T = Payload> {
    Status,
    Schedule(ScheduleMsg<T>),
    SetCollection(SetCollectionMsg<T>),
    GetCollection(GetCollectionMsg),
    CloseWorkers,
    Close,
    CloseStream,
}

impl FromTransport for FromClientMessage<Payload> {
    type Transport = FromClientMessage<PayloadTransport>;

    fn deserialize(source: Self::Transport, frames: &mut Frames) -> Self {
        match source {
            Self::Transport::Status => Self::Status,
            Self::Transport::Schedule(msg) => Self::Schedule(ScheduleMsg {
                graph: msg
                    .graph
                    .into_iter()
                    .map(|(key, spec)| (key, task_spec_to_memory(spec, frames)))
                    .collect(),
                keys: msg.keys,
            }),
            Self::Transport::SetCollection(msg) => Self::SetCollection(SetCollectionMsg {
                name: msg.name,
                value: msg.value.to_memory(frames),
            }),
            Self::Transport::GetCollection(msg) => Self::GetCollection(msg),
            Self::Transport::CloseWorkers => Self::CloseWorkers,
            Self::Transport::Close => Self::Close,
            Self::Transport::CloseStream => Self::CloseStream,
        }
    }
}
crate::to_transport!(test, FromClientMessage<PayloadTransport>);

/// Gathered result values arranged in the shape of the requested keys.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum ResultTree {
    List(Vec<ResultTree>),
    Value(PayloadTransport),
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
pub struct ScheduleAckMsg {
    pub keys: KeySelection,
    pub result: ResultTree,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
pub struct ScheduleErrorMsg {
    pub key: Option<TaskKey>,
    pub error: String,
    pub exception: Option<PayloadTransport>,
    pub traceback: Option<PayloadTransport>,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
pub struct CollectionValueMsg {
    pub name: TaskKey,
    pub value: Option<PayloadTransport>,
}

/// Messages sent by the scheduler to a client.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
#[serde(rename_all = "kebab-case")]
pub enum ToClientMessage {
    StatusReply(StatusReplyMsg),
    ScheduleAck(ScheduleAckMsg),
    ScheduleError(ScheduleErrorMsg),
    CollectionValue(CollectionValueMsg),
}
crate::to_transport!(ToClientMessage);
crate::from_transport!(test, ToClientMessage);
