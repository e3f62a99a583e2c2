use serde::{Deserialize, Serialize};

use crate::protocol::clientmsg::TaskArg;
use crate::protocol::codec::{Frames, FromTransport, Payload, PayloadTransport};
use crate::protocol::key::TaskKey;
use crate::protocol::RequestId;

#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterWorkerMsg {
    pub address: TaskKey,
    pub ncpus: u32,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FinishedTaskMsg {
    pub key: TaskKey,
    pub queue: RequestId,
    pub duration: f64,
    pub nbytes: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TaskFailedMsg<T = Payload> {
    pub key: TaskKey,
    pub queue: RequestId,
    pub exception: T,
    pub traceback: Option<T>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SetItemAckMsg {
    pub key: TaskKey,
    pub queue: RequestId,
    pub nbytes: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetItemAckMsg<T = Payload> {
    pub key: TaskKey,
    pub queue: RequestId,
    pub value: T,
}

/// Messages arriving on a worker connection. The first message of every
/// worker connection must be `Register`.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
#[serde(rename_all = "kebab-case")]
pub enum FromWorkerMessage<T = Payload> {
    Register(RegisterWorkerMsg),
    Status,
    FinishedTask(FinishedTaskMsg),
    TaskFailed(TaskFailedMsg<T>),
    #[serde(rename = "setitem-ack")]
    SetItemAck(SetItemAckMsg),
    #[serde(rename = "getitem-ack")]
    GetItemAck(GetItemAckMsg<T>),
    Unregister,
    CloseStream,
}

impl FromTransport for FromWorkerMessage<Payload> {
    type Transport = FromWorkerMessage<PayloadTransport>;

    fn deserialize(source: Self::Transport, frames: &mut Frames) -> Self {
        match source {
            Self::Transport::Register(msg) => Self::Register(msg),
            Self::Transport::Status => Self::Status,
            Self::Transport::FinishedTask(msg) => Self::FinishedTask(msg),
            Self::Transport::TaskFailed(msg) => Self::TaskFailed(TaskFailedMsg {
                key: msg.key,
                queue: msg.queue,
                exception: msg.exception.to_memory(frames),
                traceback: msg.traceback.map(|t| t.to_memory(frames)),
            }),
            Self::Transport::SetItemAck(msg) => Self::SetItemAck(msg),
            Self::Transport::GetItemAck(msg) => Self::GetItemAck(GetItemAckMsg {
                key: msg.key,
                queue: msg.queue,
                value: msg.value.to_memory(frames),
            }),
            Self::Transport::Unregister => Self::Unregister,
            Self::Transport::CloseStream => Self::CloseStream,
        }
    }
}
crate::to_transport!(test, FromWorkerMessage<PayloadTransport>);

#[derive(Serialize, Deserialize, Debug)]
pub struct ComputeMsg {
    pub key: TaskKey,
    pub function: PayloadTransport,
    pub args: Vec<TaskArg<PayloadTransport>>,
    #[serde(with = "tuple_vec_map")]
    pub locations: Vec<(TaskKey, Vec<TaskKey>)>,
    pub queue: RequestId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DelItemMsg {
    pub key: TaskKey,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SetItemMsg {
    pub key: TaskKey,
    pub value: PayloadTransport,
    pub queue: RequestId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetItemMsg {
    pub key: TaskKey,
    pub queue: RequestId,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct StatusReplyMsg {
    pub status: TaskKey,
}

/// Messages sent by the scheduler to a worker. Evictions (`delitem`) are
/// fire-and-forget; everything else carrying a `queue` field is answered
/// through the reply table.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
#[serde(rename_all = "kebab-case")]
pub enum ToWorkerMessage {
    Compute(ComputeMsg),
    #[serde(rename = "delitem")]
    DelItem(DelItemMsg),
    #[serde(rename = "setitem")]
    SetItem(SetItemMsg),
    #[serde(rename = "getitem")]
    GetItem(GetItemMsg),
    StatusReply(StatusReplyMsg),
    Close,
}
crate::to_transport!(ToWorkerMessage);
crate::from_transport!(test, ToWorkerMessage);
