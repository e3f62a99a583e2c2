#![cfg(test)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Decoder, Encoder};

use crate::common::{Map, WrappedRcRefCell};
use crate::protocol::clientmsg::{InvocationSpec, TaskArg, TaskSpec};
use crate::protocol::codec::{
    deserialize_packet, Batch, FromTransport, Packet, PacketCodec, Payload, PayloadTransport,
};
use crate::protocol::key::{to_key, TaskKey};
use crate::protocol::workermsg::{
    FinishedTaskMsg, FromWorkerMessage, GetItemAckMsg, SetItemAckMsg, TaskFailedMsg,
    ToWorkerMessage,
};
use crate::server::core::CoreRef;
use crate::server::rpc::process_worker_message;
use crate::server::worker::WorkerRef;

/// Memory stream for reading and writing at the same time.
pub struct MemoryStream {
    input: Cursor<Vec<u8>>,
    pub output: WrappedRcRefCell<Vec<u8>>,
}

impl MemoryStream {
    pub fn new(input: Vec<u8>) -> (Self, WrappedRcRefCell<Vec<u8>>) {
        let output = WrappedRcRefCell::wrap(Default::default());
        (
            Self {
                input: Cursor::new(input),
                output: output.clone(),
            },
            output,
        )
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        let pos = this.input.position() as usize;
        let data = this.input.get_ref();
        let n = data.len().saturating_sub(pos).min(buf.remaining());
        if n > 0 {
            buf.put_slice(&data[pos..pos + n]);
        }
        this.input.set_position((pos + n) as u64);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.output.get_mut().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

pub fn dummy_address() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

pub fn packet_queue() -> (UnboundedSender<Packet>, UnboundedReceiver<Packet>) {
    unbounded_channel()
}

pub fn packets_to_bytes(packets: Vec<Packet>) -> crate::Result<Vec<u8>> {
    let mut data = BytesMut::new();
    let mut codec = PacketCodec::default();
    for packet in packets {
        codec.encode(packet, &mut data)?;
    }
    Ok(data.to_vec())
}

pub fn bytes_to_msg<T: FromTransport>(data: &[u8]) -> crate::Result<Batch<T>> {
    let mut bytes = BytesMut::from(data);
    let packet = PacketCodec::default().decode(&mut bytes)?.unwrap();
    deserialize_packet(packet)
}

pub fn inline(value: impl Into<rmpv::Value>) -> Payload {
    Payload::Inline(value.into())
}

pub fn literal(value: i64) -> TaskSpec<Payload> {
    TaskSpec::Literal(inline(value))
}

pub fn invocation(function: &str, args: Vec<TaskArg<Payload>>) -> TaskSpec<Payload> {
    TaskSpec::Invocation(InvocationSpec {
        function: inline(function),
        args,
    })
}

pub fn key_arg(key: &str) -> TaskArg<Payload> {
    TaskArg::Key(to_key(key))
}

pub fn value_arg(value: i64) -> TaskArg<Payload> {
    TaskArg::Value(inline(value))
}

pub type EventLog = WrappedRcRefCell<Vec<String>>;

pub fn event_log() -> EventLog {
    Default::default()
}

pub fn register_test_worker(
    core_ref: &CoreRef,
    address: &str,
    ncpus: u32,
) -> (WorkerRef, UnboundedReceiver<Packet>) {
    let (tx, rx) = packet_queue();
    let worker_ref = core_ref
        .get_mut()
        .register_worker(to_key(address), ncpus, tx);
    (worker_ref, rx)
}

fn transport_value(transport: PayloadTransport) -> rmpv::Value {
    match transport {
        PayloadTransport::Inline(value) => value,
        PayloadTransport::Indexed { .. } => panic!("Test worker only handles inline payloads"),
    }
}

/// Drives one side of the worker protocol in-process: consumes the
/// packets the scheduler queued for this worker and feeds the replies
/// back through the regular message dispatch. Supported functions:
/// "add" sums integer arguments, "boom" fails with an exception value,
/// "die" drops the worker mid-task.
pub async fn emulate_worker(
    core_ref: CoreRef,
    worker_ref: WorkerRef,
    mut rx: UnboundedReceiver<Packet>,
    events: EventLog,
    preload: Vec<(TaskKey, rmpv::Value)>,
) {
    let mut store: Map<TaskKey, rmpv::Value> = preload.into_iter().collect();
    while let Some(packet) = rx.recv().await {
        let batch: Batch<ToWorkerMessage> = deserialize_packet(packet).unwrap();
        for message in batch {
            match message {
                ToWorkerMessage::SetItem(msg) => {
                    events.get_mut().push(format!("setitem {}", msg.key));
                    store.insert(msg.key.clone(), transport_value(msg.value));
                    process_worker_message(
                        &core_ref,
                        &worker_ref,
                        FromWorkerMessage::SetItemAck(SetItemAckMsg {
                            key: msg.key,
                            queue: msg.queue,
                            nbytes: 8,
                        }),
                    );
                }
                ToWorkerMessage::Compute(msg) => {
                    events.get_mut().push(format!("compute {}", msg.key));
                    let function = transport_value(msg.function);
                    match function.as_str().expect("function name must be a string") {
                        "add" => {
                            let mut total = 0i64;
                            for arg in msg.args {
                                total += match arg {
                                    TaskArg::Key(key) => {
                                        store.get(&key).and_then(|v| v.as_i64()).unwrap()
                                    }
                                    TaskArg::Value(value) => {
                                        transport_value(value).as_i64().unwrap()
                                    }
                                };
                            }
                            store.insert(msg.key.clone(), rmpv::Value::from(total));
                            process_worker_message(
                                &core_ref,
                                &worker_ref,
                                FromWorkerMessage::FinishedTask(FinishedTaskMsg {
                                    key: msg.key,
                                    queue: msg.queue,
                                    duration: 0.001,
                                    nbytes: 8,
                                }),
                            );
                        }
                        "boom" => {
                            process_worker_message(
                                &core_ref,
                                &worker_ref,
                                FromWorkerMessage::TaskFailed(TaskFailedMsg {
                                    key: msg.key,
                                    queue: msg.queue,
                                    exception: inline("ValueError('boom')"),
                                    traceback: None,
                                }),
                            );
                        }
                        "die" => {
                            let id = worker_ref.get().id;
                            core_ref.get_mut().unregister_worker(id);
                        }
                        other => panic!("Test worker got unknown function {}", other),
                    }
                }
                ToWorkerMessage::GetItem(msg) => {
                    events.get_mut().push(format!("getitem {}", msg.key));
                    let value = store.get(&msg.key).cloned().unwrap();
                    process_worker_message(
                        &core_ref,
                        &worker_ref,
                        FromWorkerMessage::GetItemAck(GetItemAckMsg {
                            key: msg.key,
                            queue: msg.queue,
                            value: Payload::Inline(value),
                        }),
                    );
                }
                ToWorkerMessage::DelItem(msg) => {
                    events.get_mut().push(format!("delitem {}", msg.key));
                    store.remove(&msg.key);
                }
                ToWorkerMessage::StatusReply(_) => {}
                ToWorkerMessage::Close => {
                    events.get_mut().push("close".into());
                }
            }
        }
    }
}
