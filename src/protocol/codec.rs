use bytes::{Buf, BufMut, Bytes, BytesMut};
use byteorder::{LittleEndian, ReadBytesExt};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::util::{OptionExt, ResultExt};

/// Commonly used types
pub type Frame = Bytes;
pub type Frames = Vec<Frame>;
pub type Batch<T> = SmallVec<[T; 2]>;

type Endianness = LittleEndian;

/// One unit of transfer on a connection: a main frame holding the
/// msgpack-encoded message (or message list) and any number of extra
/// frames holding opaque payload data referenced by index.
#[derive(Debug, Default)]
pub struct Packet {
    pub main_frame: Bytes,
    pub extra_frames: Frames,
}

impl Packet {
    pub fn new(main_frame: Frame, extra_frames: Frames) -> Self {
        Packet {
            main_frame,
            extra_frames,
        }
    }

    pub fn from_wrapper<T: Serialize>(
        message: MessageWrapper<T>,
        extra_frames: Frames,
    ) -> crate::Result<Self> {
        Ok(Packet {
            main_frame: rmp_serde::to_vec_named(&message)?.into(),
            extra_frames,
        })
    }
}

/// Wire framing: a little-endian u64 frame count, one u64 size per frame,
/// then the frames back to back. The first frame is the main frame.
#[derive(Default)]
pub struct PacketCodec {
    sizes: Option<Vec<u64>>,
    frames: Frames,
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = crate::TgError;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Packet>> {
        if self.sizes.is_none() {
            let available = src.len() as u64;
            if available < 8 {
                return Ok(None);
            }
            let mut cursor = std::io::Cursor::new(&src[..]);
            // Reads from a length-checked cursor cannot fail
            let count: u64 = cursor.read_u64::<Endianness>().ensure();
            if count == 0 {
                return Err(crate::TgError::GenericError(
                    "Received packet with no frames".into(),
                ));
            }
            let header_size = (count + 1) * 8;
            if available < header_size {
                return Ok(None);
            }
            let mut sizes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                sizes.push(cursor.read_u64::<Endianness>().ensure());
            }
            self.sizes = Some(sizes);
            src.advance(header_size as usize);
        }

        let sizes = self.sizes.as_ref().ensure();
        for &frame_size in &sizes[self.frames.len()..] {
            if (src.len() as u64) < frame_size {
                return Ok(None);
            }
            self.frames.push(src.split_to(frame_size as usize).freeze());
        }

        self.sizes = None;
        let mut frames = std::mem::take(&mut self.frames);
        let main_frame = frames.remove(0);
        Ok(Some(Packet {
            main_frame,
            extra_frames: frames,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = crate::TgError;

    fn encode(&mut self, data: Packet, dst: &mut BytesMut) -> crate::Result<()> {
        let count = 1 + data.extra_frames.len();
        let n = 8 * (count + 1)
            + data.main_frame.len()
            + data.extra_frames.iter().map(|f| f.len()).sum::<usize>();
        dst.reserve(n);
        dst.put_u64_le(count as u64);
        dst.put_u64_le(data.main_frame.len() as u64);
        for frame in &data.extra_frames {
            dst.put_u64_le(frame.len() as u64);
        }
        dst.extend_from_slice(&data.main_frame);
        for frame in &data.extra_frames {
            dst.extend_from_slice(frame);
        }
        Ok(())
    }
}

/// Wrapper that holds either a single message or a list of messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageWrapper<T> {
    MessageList(Batch<T>),
    Message(T),
}

/// Opaque serialized data as it travels inside a packet: either inline in
/// the main frame or referenced as a range of extra frames.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum PayloadTransport {
    Indexed {
        #[serde(rename = "frame-index")]
        frame_index: u64,
        #[serde(rename = "frame-count")]
        frame_count: u64,
        #[serde(rename = "frame-header")]
        header: rmpv::Value,
    },
    Inline(rmpv::Value),
}

impl PayloadTransport {
    pub fn to_memory(self, frames: &mut Frames) -> Payload {
        match self {
            PayloadTransport::Inline(value) => Payload::Inline(value),
            PayloadTransport::Indexed {
                frame_index,
                frame_count,
                header,
            } => {
                let frames = (frame_index..frame_index + frame_count)
                    .map(|i| frames[i as usize].clone())
                    .collect();
                Payload::Frames { frames, header }
            }
        }
    }
}

/// Opaque serialized data held by the scheduler: the decoded counterpart
/// of [`PayloadTransport`]. The scheduler never interprets it beyond
/// moving it between workers and clients.
#[cfg_attr(test, derive(PartialEq))]
#[derive(Debug)]
pub enum Payload {
    Inline(rmpv::Value),
    Frames { frames: Frames, header: rmpv::Value },
}

impl Payload {
    pub fn to_transport<T: Serialize>(&self, builder: &mut MessageBuilder<T>) -> PayloadTransport {
        builder.add_payload(self)
    }
}

/// Trait which can convert an associated deserializable type into itself,
/// resolving indexed payloads against the packet's extra frames.
pub trait FromTransport {
    type Transport: DeserializeOwned;

    fn deserialize(source: Self::Transport, frames: &mut Frames) -> Self;
}

/// Trait which can convert itself into an associated serializable type,
/// moving payload frames into the builder.
pub trait ToTransport {
    type Transport: Serialize;

    fn to_transport(self, builder: &mut MessageBuilder<Self::Transport>);
}

pub struct MessageBuilder<T> {
    messages: Batch<T>,
    frames: Frames,
}

impl<T: Serialize> Default for MessageBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> MessageBuilder<T> {
    pub fn new() -> Self {
        Self {
            messages: Default::default(),
            frames: Default::default(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Batch::<T>::with_capacity(capacity),
            frames: Default::default(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.frames.is_empty()
    }

    #[inline]
    pub fn add_message(&mut self, message: T) {
        self.messages.push(message);
    }

    pub fn add_payload(&mut self, payload: &Payload) -> PayloadTransport {
        match payload {
            Payload::Inline(value) => PayloadTransport::Inline(value.clone()),
            Payload::Frames { frames, header } => {
                let frame_index = self.frames.len() as u64;
                self.frames.extend_from_slice(frames);
                PayloadTransport::Indexed {
                    frame_index,
                    frame_count: frames.len() as u64,
                    header: header.clone(),
                }
            }
        }
    }

    pub fn build_single(mut self) -> crate::Result<Packet> {
        assert_eq!(self.messages.len(), 1);
        let wrapper = MessageWrapper::Message(self.messages.pop().ensure());
        Packet::from_wrapper(wrapper, self.frames)
    }

    pub fn build_batch(self) -> crate::Result<Packet> {
        assert!(!self.messages.is_empty());
        let wrapper = MessageWrapper::MessageList(self.messages);
        Packet::from_wrapper(wrapper, self.frames)
    }
}

fn parse_packet<T: FromTransport>(packet: crate::Result<Packet>) -> crate::Result<Batch<T>> {
    deserialize_packet(packet?)
}

pub fn deserialize_packet<T: FromTransport>(mut packet: Packet) -> crate::Result<Batch<T>> {
    let message: MessageWrapper<T::Transport> = rmp_serde::from_slice(&packet.main_frame)?;

    Ok(match message {
        MessageWrapper::Message(p) => smallvec!(T::deserialize(p, &mut packet.extra_frames)),
        MessageWrapper::MessageList(v) => v
            .into_iter()
            .map(|p| T::deserialize(p, &mut packet.extra_frames))
            .collect(),
    })
}

pub fn asyncread_to_stream<R: AsyncRead>(stream: R) -> FramedRead<R, PacketCodec> {
    FramedRead::new(stream, PacketCodec::default())
}

pub fn parse_stream<T: FromTransport, R: AsyncRead + Unpin>(
    stream: FramedRead<R, PacketCodec>,
) -> impl Stream<Item = crate::Result<Batch<T>>> + Unpin {
    stream.map(parse_packet)
}

pub fn asyncwrite_to_sink<W: AsyncWrite>(sink: W) -> FramedWrite<W, PacketCodec> {
    FramedWrite::new(sink, Default::default())
}

pub fn serialize_single_packet<T: ToTransport>(item: T) -> crate::Result<Packet> {
    let mut builder: MessageBuilder<T::Transport> = MessageBuilder::new();
    item.to_transport(&mut builder);
    builder.build_single()
}

pub fn serialize_batch_packet<T: ToTransport>(batch: Batch<T>) -> crate::Result<Packet> {
    let mut builder: MessageBuilder<T::Transport> = MessageBuilder::new();
    for item in batch {
        item.to_transport(&mut builder);
    }
    builder.build_batch()
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use serde::{Deserialize, Serialize};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{
        deserialize_packet, serialize_single_packet, Batch, MessageBuilder, Packet, PacketCodec,
        Payload, PayloadTransport,
    };

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Probe {
        name: String,
        value: u64,
    }
    crate::from_transport!(Probe);
    crate::to_transport!(Probe);

    #[test]
    fn parse_packet_simple() {
        let mut buf = BytesMut::default();
        buf.put_u64_le(1);
        buf.put_u64_le(1);
        buf.put_u8(137u8);

        let mut codec = PacketCodec::default();
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.main_frame.to_vec(), vec!(137u8));
        assert!(packet.extra_frames.is_empty());
    }

    #[test]
    fn parse_packet_incremental() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::default();
        buf.put_u64_le(2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_u64_le(1);
        buf.put_u64_le(3);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_u8(7u8);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&[1, 2, 3]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.main_frame.to_vec(), vec!(7u8));
        assert_eq!(packet.extra_frames, vec!(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn parse_packet_multi_frame() {
        let mut buf = BytesMut::default();
        let sizes: Vec<usize> = vec![13, 17, 2, 1];

        buf.put_u64_le((1 + sizes.len()) as u64);
        buf.put_u64_le(1);
        for &size in sizes.iter() {
            buf.put_u64_le(size as u64);
        }
        buf.put_u8(137u8);
        for &size in sizes.iter() {
            buf.put_slice(&vec![size as u8; size]);
        }

        let mut codec = PacketCodec::default();
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.main_frame.to_vec(), vec!(137u8));
        assert_eq!(packet.extra_frames.len(), sizes.len());
        for (size, frame) in sizes.into_iter().zip(packet.extra_frames.into_iter()) {
            assert_eq!(frame.to_vec(), vec![size as u8; size]);
        }
    }

    #[test]
    fn write_packet_roundtrip() {
        let message = Packet::new(
            Bytes::from(vec![1, 2, 3]),
            vec![Bytes::from(vec![4, 5]), Bytes::from(vec![6])],
        );
        let mut data = BytesMut::new();
        let mut codec = PacketCodec::default();
        codec.encode(message, &mut data).unwrap();

        let packet = codec.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.main_frame.to_vec(), vec![1, 2, 3]);
        assert_eq!(packet.extra_frames.len(), 2);
        assert_eq!(packet.extra_frames[1].to_vec(), vec![6]);
    }

    #[test]
    fn message_roundtrip() {
        let packet = serialize_single_packet(Probe {
            name: "x".into(),
            value: 42,
        })
        .unwrap();
        let batch: Batch<Probe> = deserialize_packet(packet).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0],
            Probe {
                name: "x".into(),
                value: 42
            }
        );
    }

    #[test]
    fn indexed_payload_through_builder() {
        let payload = Payload::Frames {
            frames: vec![Bytes::from(vec![9, 9]), Bytes::from(vec![8])],
            header: rmpv::Value::from("raw"),
        };
        let mut builder: MessageBuilder<Probe> = MessageBuilder::new();
        let transport = payload.to_transport(&mut builder);
        match &transport {
            PayloadTransport::Indexed {
                frame_index,
                frame_count,
                ..
            } => {
                assert_eq!(*frame_index, 0);
                assert_eq!(*frame_count, 2);
            }
            _ => panic!("Expected indexed payload"),
        }
        builder.add_message(Probe {
            name: "p".into(),
            value: 1,
        });
        let mut packet = builder.build_single().unwrap();
        assert_eq!(packet.extra_frames.len(), 2);

        let back = transport.to_memory(&mut packet.extra_frames);
        assert_eq!(back, payload);
    }
}
