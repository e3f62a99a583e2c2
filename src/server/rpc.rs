use futures::{FutureExt, Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::protocol::clientmsg::{
    CollectionValueMsg, FromClientMessage, StatusReplyMsg, ToClientMessage,
};
use crate::protocol::codec::{
    asyncread_to_stream, asyncwrite_to_sink, parse_stream, serialize_single_packet, Batch,
    MessageBuilder, Packet,
};
use crate::protocol::key::to_key;
use crate::protocol::workermsg::{FromWorkerMessage, ToWorkerMessage};
use crate::server::core::CoreRef;
use crate::server::reactor::{schedule, schedule_ack_packet, schedule_error_packet};
use crate::server::replies::ReplyEvent;
use crate::server::worker::WorkerRef;
use crate::util::forward_queue_to_sink;
use crate::TgError;

/// Accept loop for the worker-facing listener. Must run inside a
/// LocalSet.
pub async fn worker_connection_initiator(
    listener: TcpListener,
    core_ref: CoreRef,
) -> crate::Result<()> {
    loop {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let core_ref = core_ref.clone();
        tokio::task::spawn_local(async move {
            log::debug!("New worker connection: {}", address);
            let (reader, writer) = tokio::io::split(socket);
            let reader = parse_stream::<FromWorkerMessage, _>(asyncread_to_stream(reader));
            let writer = asyncwrite_to_sink(writer);
            if let Err(e) = worker_rpc_loop(&core_ref, address, reader, writer).await {
                log::error!("Worker connection {} failed: {}", address, e);
            }
            log::debug!("Worker connection ended: {}", address);
        });
    }
}

/// Accept loop for the client-facing listener. Must run inside a
/// LocalSet.
pub async fn client_connection_initiator(
    listener: TcpListener,
    core_ref: CoreRef,
) -> crate::Result<()> {
    loop {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let core_ref = core_ref.clone();
        tokio::task::spawn_local(async move {
            log::debug!("New client connection: {}", address);
            let (reader, writer) = tokio::io::split(socket);
            let reader = parse_stream::<FromClientMessage, _>(asyncread_to_stream(reader));
            let writer = asyncwrite_to_sink(writer);
            if let Err(e) = client_rpc_loop(&core_ref, address, reader, writer).await {
                log::error!("Client connection {} failed: {}", address, e);
            }
            log::debug!("Client connection ended: {}", address);
        });
    }
}

pub async fn worker_rpc_loop<
    Reader: Stream<Item = crate::Result<Batch<FromWorkerMessage>>> + Unpin,
    Writer: Sink<Packet, Error = TgError> + Unpin,
>(
    core_ref: &CoreRef,
    address: std::net::SocketAddr,
    mut receiver: Reader,
    sender: Writer,
) -> crate::Result<()> {
    let mut first_batch = match receiver.next().await {
        Some(batch) => batch?,
        None => return Ok(()),
    };
    if first_batch.is_empty() {
        return Err(TgError::GenericError(format!(
            "worker connection {} sent an empty batch",
            address
        )));
    }
    let registration = match first_batch.remove(0) {
        FromWorkerMessage::Register(msg) => msg,
        other => {
            return Err(TgError::GenericError(format!(
                "worker connection {} did not start with a registration: {:?}",
                address, other
            )));
        }
    };

    let (queue_sender, queue_receiver) = tokio::sync::mpsc::unbounded_channel::<Packet>();
    let worker_ref = core_ref.get_mut().register_worker(
        registration.address,
        registration.ncpus,
        queue_sender,
    );
    let worker_id = worker_ref.get().id;
    log::info!("Worker {} registered from {}", worker_id, address);

    let snd_loop = forward_queue_to_sink(queue_receiver, sender);

    let core_ref2 = core_ref.clone();
    let recv_loop = async move {
        for message in first_batch {
            if process_worker_message(core_ref, &worker_ref, message) {
                return Ok(());
            }
        }
        'outer: while let Some(messages) = receiver.next().await {
            for message in messages? {
                if process_worker_message(core_ref, &worker_ref, message) {
                    break 'outer;
                }
            }
        }
        Ok(())
    };

    let result = futures::future::select(recv_loop.boxed_local(), snd_loop.boxed_local()).await;
    if let Err(e) = result.factor_first().0 {
        log::error!(
            "Error in worker connection (id={}, connection={}): {}",
            worker_id,
            address,
            e
        );
    }
    log::info!(
        "Worker {} connection closed (connection: {})",
        worker_id,
        address
    );
    core_ref2.get_mut().unregister_worker(worker_id);
    Ok(())
}

/// Handles one decoded worker message. Returns true when the connection
/// should close. Replies tagged with a `queue` id are routed through the
/// reply table; the table drops them silently if the submission that
/// asked has already given up.
pub fn process_worker_message(
    core_ref: &CoreRef,
    worker_ref: &WorkerRef,
    message: FromWorkerMessage,
) -> bool {
    let worker_id = worker_ref.get().id;
    match message {
        FromWorkerMessage::Register(msg) => {
            let sender = worker_ref.get().sender.clone();
            core_ref
                .get_mut()
                .register_worker(msg.address, msg.ncpus, sender);
            false
        }
        FromWorkerMessage::Status => {
            worker_ref
                .get()
                .send_message(ToWorkerMessage::StatusReply(StatusReplyMsg {
                    status: to_key("OK"),
                }))
                .unwrap_or_else(|e| log::error!("Sending status reply failed: {}", e));
            false
        }
        FromWorkerMessage::FinishedTask(msg) => {
            log::debug!("Worker {} finished task {}", worker_id, msg.key);
            let core = core_ref.get_mut();
            core.pool.return_available(worker_id);
            core.replies.push(
                msg.queue,
                ReplyEvent::Finished {
                    key: msg.key,
                    worker: worker_id,
                    nbytes: msg.nbytes,
                    duration: msg.duration,
                },
            );
            false
        }
        FromWorkerMessage::TaskFailed(msg) => {
            log::debug!("Worker {} reported failure of task {}", worker_id, msg.key);
            let core = core_ref.get_mut();
            core.pool.return_available(worker_id);
            core.replies.push(
                msg.queue,
                ReplyEvent::Failed {
                    key: msg.key,
                    exception: msg.exception,
                    traceback: msg.traceback,
                },
            );
            false
        }
        FromWorkerMessage::SetItemAck(msg) => {
            core_ref.get().replies.push(
                msg.queue,
                ReplyEvent::ScatterPlaced {
                    key: msg.key,
                    worker: worker_id,
                    nbytes: msg.nbytes,
                },
            );
            false
        }
        FromWorkerMessage::GetItemAck(msg) => {
            core_ref.get().replies.push(
                msg.queue,
                ReplyEvent::Value {
                    key: msg.key,
                    value: msg.value,
                },
            );
            false
        }
        FromWorkerMessage::Unregister | FromWorkerMessage::CloseStream => true,
    }
}

pub async fn client_rpc_loop<
    Reader: Stream<Item = crate::Result<Batch<FromClientMessage>>> + Unpin,
    Writer: Sink<Packet, Error = TgError> + Unpin,
>(
    core_ref: &CoreRef,
    address: std::net::SocketAddr,
    mut receiver: Reader,
    sender: Writer,
) -> crate::Result<()> {
    let (snd_sender, snd_receiver) = tokio::sync::mpsc::unbounded_channel::<Packet>();
    log::info!("Client connected from {}", address);

    let snd_loop = forward_queue_to_sink(snd_receiver, sender);
    let recv_loop = async {
        'outer: while let Some(messages) = receiver.next().await {
            for message in messages? {
                match message {
                    FromClientMessage::Status => {
                        let packet =
                            serialize_single_packet(ToClientMessage::StatusReply(StatusReplyMsg {
                                status: to_key("OK"),
                            }))?;
                        send_to_client(&snd_sender, packet);
                    }
                    FromClientMessage::Schedule(msg) => {
                        let packet = match schedule(core_ref, msg).await {
                            Ok(outcome) => schedule_ack_packet(outcome)?,
                            Err(e) => {
                                log::error!("Graph submission from {} failed: {}", address, e);
                                schedule_error_packet(e)?
                            }
                        };
                        send_to_client(&snd_sender, packet);
                    }
                    FromClientMessage::SetCollection(msg) => {
                        log::debug!("Storing collection {}", msg.name);
                        core_ref
                            .get_mut()
                            .collections
                            .insert(msg.name, msg.value);
                    }
                    FromClientMessage::GetCollection(msg) => {
                        let mut builder = MessageBuilder::new();
                        let value = {
                            let core = core_ref.get();
                            core.collections
                                .get(&msg.name)
                                .map(|payload| payload.to_transport(&mut builder))
                        };
                        builder.add_message(ToClientMessage::CollectionValue(CollectionValueMsg {
                            name: msg.name,
                            value,
                        }));
                        send_to_client(&snd_sender, builder.build_single()?);
                    }
                    FromClientMessage::CloseWorkers => {
                        log::info!("Client {} requested worker shutdown", address);
                        for worker_ref in core_ref.get().get_workers() {
                            worker_ref
                                .get()
                                .send_message(ToWorkerMessage::Close)
                                .unwrap_or_else(|e| {
                                    log::error!("Sending worker shutdown failed: {}", e)
                                });
                        }
                    }
                    FromClientMessage::Close => {
                        log::info!("Client {} requested scheduler shutdown", address);
                        core_ref.get().stop();
                    }
                    FromClientMessage::CloseStream => break 'outer,
                }
            }
        }
        Ok(())
    };

    let result = futures::future::select(recv_loop.boxed_local(), snd_loop.boxed_local()).await;
    if let Err(e) = result.factor_first().0 {
        log::error!("Error in client connection (connection={}): {}", address, e);
    }
    log::info!("Client connection {} closed", address);
    Ok(())
}

fn send_to_client(sender: &tokio::sync::mpsc::UnboundedSender<Packet>, packet: Packet) {
    sender
        .send(packet)
        .unwrap_or_else(|_| log::debug!("Sending to client failed"));
}

#[cfg(test)]
mod tests {
    use crate::protocol::clientmsg::{FromClientMessage, StatusReplyMsg, ToClientMessage};
    use crate::protocol::codec::{
        asyncread_to_stream, asyncwrite_to_sink, parse_stream, serialize_single_packet, Batch,
        PayloadTransport,
    };
    use crate::protocol::key::to_key;
    use crate::protocol::workermsg::{FromWorkerMessage, RegisterWorkerMsg};
    use crate::server::core::CoreRef;
    use crate::test_util::{bytes_to_msg, dummy_address, packets_to_bytes, MemoryStream};

    use super::{client_rpc_loop, worker_rpc_loop};

    async fn run_worker_loop(core_ref: &CoreRef, input: Vec<u8>) -> crate::Result<Vec<u8>> {
        let (stream, output) = MemoryStream::new(input);
        let (reader, writer) = tokio::io::split(stream);
        let reader = parse_stream::<FromWorkerMessage, _>(asyncread_to_stream(reader));
        let writer = asyncwrite_to_sink(writer);
        worker_rpc_loop(core_ref, dummy_address(), reader, writer).await?;
        let out = output.get().clone();
        Ok(out)
    }

    async fn run_client_loop(core_ref: &CoreRef, input: Vec<u8>) -> crate::Result<Vec<u8>> {
        let (stream, output) = MemoryStream::new(input);
        let (reader, writer) = tokio::io::split(stream);
        let reader = parse_stream::<FromClientMessage, _>(asyncread_to_stream(reader));
        let writer = asyncwrite_to_sink(writer);
        client_rpc_loop(core_ref, dummy_address(), reader, writer).await?;
        let out = output.get().clone();
        Ok(out)
    }

    #[tokio::test]
    async fn worker_register_and_unregister() -> crate::Result<()> {
        let core_ref = CoreRef::default();
        let input = packets_to_bytes(vec![
            serialize_single_packet(FromWorkerMessage::<PayloadTransport>::Register(
                RegisterWorkerMsg {
                    address: to_key("tcp://1.2.3.4:5"),
                    ncpus: 2,
                },
            ))?,
            serialize_single_packet(FromWorkerMessage::<PayloadTransport>::Unregister)?,
        ])?;
        run_worker_loop(&core_ref, input).await?;
        // the worker registered, then the connection cleanup removed it
        assert!(!core_ref.get().has_workers());
        assert_eq!(core_ref.get().pool.available_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn worker_must_register_first() {
        let core_ref = CoreRef::default();
        let input = packets_to_bytes(vec![serialize_single_packet(
            FromWorkerMessage::<PayloadTransport>::Status,
        )
        .unwrap()])
        .unwrap();
        assert!(run_worker_loop(&core_ref, input).await.is_err());
        assert!(!core_ref.get().has_workers());
    }

    #[tokio::test]
    async fn client_status_reply() -> crate::Result<()> {
        let core_ref = CoreRef::default();
        let input = packets_to_bytes(vec![
            serialize_single_packet(FromClientMessage::<PayloadTransport>::Status)?,
            serialize_single_packet(FromClientMessage::<PayloadTransport>::CloseStream)?,
        ])?;
        let out = run_client_loop(&core_ref, input).await?;
        let batch: Batch<ToClientMessage> = bytes_to_msg(&out)?;
        assert_eq!(
            batch[0],
            ToClientMessage::StatusReply(StatusReplyMsg {
                status: to_key("OK")
            })
        );
        Ok(())
    }
}
