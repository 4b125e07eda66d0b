//! Tunnel wire format.
//!
//! Every frame on the physical connection is laid out as
//!
//! ```text
//! [16B RequestId][1B PacketType][4B DataLen][4B Offset][4B Total][DataLen bytes Data]
//! ```
//!
//! All integers are big-endian. `Offset` is informational only: frames of one exchange
//! are strictly ordered, so reassembly never depends on it.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::fmt;
use rand::RngCore;
use std::convert::TryFrom;
use tokio_util::codec::{Decoder, Encoder};

pub const REQUEST_ID_LEN: usize = 16;

/// RequestId + PacketType + DataLen + Offset + Total
pub const HEADER_LEN: usize = REQUEST_ID_LEN + 1 + 4 + 4 + 4;

/// Largest data section the decoder accepts. Anything above is treated as a corrupted
/// length field.
pub const MAX_DATA_LEN: usize = 16 * 1024 * 1024;

/// Default size of one body fragment.
pub const DEFAULT_FRAGMENT_SIZE: usize = 512 * 1024;

/// `total` value for bodies of unknown length.
pub const UNKNOWN_TOTAL: i32 = -1;

/// `total` markers on `WebSocketData` frames
pub const WS_TEXT: i32 = 1;
pub const WS_BINARY: i32 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn generate() -> Self {
        let mut id = [0u8; REQUEST_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        RequestId(id)
    }

    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        RequestId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Dumped HTTP request or response head. Always the first frame of a direction.
    SendHeader = 0,
    SendBody = 1,
    /// Last body chunk, possibly empty. Also ends a WebSocket session.
    EndBody = 2,
    /// Reserved for retransmission, never sent.
    ReSendBody = 3,
    WebSocketData = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::SendHeader),
            1 => Ok(PacketType::SendBody),
            2 => Ok(PacketType::EndBody),
            3 => Ok(PacketType::ReSendBody),
            4 => Ok(PacketType::WebSocketData),
            other => Err(other),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub offset: i32,
    pub total: i32,
    pub data: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("packet_type", &self.packet_type)
            .field("offset", &self.offset)
            .field("total", &self.total)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn header(head: impl Into<Bytes>) -> Self {
        let data = head.into();
        Frame {
            packet_type: PacketType::SendHeader,
            offset: 0,
            total: data.len() as i32,
            data,
        }
    }

    pub fn body(data: Bytes, offset: i32, total: i32) -> Self {
        Frame {
            packet_type: PacketType::SendBody,
            offset,
            total,
            data,
        }
    }

    pub fn end_body(data: Bytes, offset: i32, total: i32) -> Self {
        Frame {
            packet_type: PacketType::EndBody,
            offset,
            total,
            data,
        }
    }

    /// Empty terminator, used for body-less messages and to end WebSocket sessions.
    pub fn end() -> Self {
        Frame::end_body(Bytes::new(), 0, 0)
    }

    pub fn ws_text(data: impl Into<Bytes>) -> Self {
        Frame {
            packet_type: PacketType::WebSocketData,
            offset: 0,
            total: WS_TEXT,
            data: data.into(),
        }
    }

    pub fn ws_binary(data: impl Into<Bytes>) -> Self {
        Frame {
            packet_type: PacketType::WebSocketData,
            offset: 0,
            total: WS_BINARY,
            data: data.into(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.packet_type == PacketType::EndBody
    }
}

/// A frame together with the exchange it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub request_id: RequestId,
    pub frame: Frame,
}

impl WireFrame {
    pub fn new(request_id: RequestId, frame: Frame) -> Self {
        WireFrame { request_id, frame }
    }
}

/// Well-delimited frame whose packet type is unknown. The stream is still aligned, so
/// only the exchange it belongs to is affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub request_id: RequestId,
    pub packet_type: u8,
}

pub type Decoded = Result<WireFrame, MalformedFrame>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame header truncated: {0} bytes")]
    ShortHeader(usize),

    #[error("declared data length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("data length {0} exceeds the frame limit")]
    TooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn encode_into(wire: &WireFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
    let data = &wire.frame.data;
    if data.len() > MAX_DATA_LEN {
        return Err(CodecError::TooLarge(data.len()));
    }

    dst.reserve(HEADER_LEN + data.len());
    dst.put_slice(wire.request_id.as_bytes());
    dst.put_u8(wire.frame.packet_type as u8);
    dst.put_u32(data.len() as u32);
    dst.put_i32(wire.frame.offset);
    dst.put_i32(wire.frame.total);
    dst.put_slice(data);

    Ok(())
}

/// Encode one frame as a standalone message (one WebSocket binary message).
pub fn encode(wire: &WireFrame) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + wire.frame.data.len());
    encode_into(wire, &mut buf)?;
    Ok(buf.freeze())
}

struct Head {
    request_id: RequestId,
    packet_type: u8,
    len: usize,
    offset: i32,
    total: i32,
}

fn peek_head(src: &[u8]) -> Result<Head, CodecError> {
    if src.len() < HEADER_LEN {
        return Err(CodecError::ShortHeader(src.len()));
    }

    let mut cursor = src;
    let mut id = [0u8; REQUEST_ID_LEN];
    cursor.copy_to_slice(&mut id);
    let packet_type = cursor.get_u8();
    let len = cursor.get_u32() as usize;
    let offset = cursor.get_i32();
    let total = cursor.get_i32();

    if len > MAX_DATA_LEN {
        return Err(CodecError::TooLarge(len));
    }

    Ok(Head {
        request_id: RequestId(id),
        packet_type,
        len,
        offset,
        total,
    })
}

fn finish(head: Head, data: Bytes) -> Decoded {
    match PacketType::try_from(head.packet_type) {
        Ok(packet_type) => Ok(WireFrame {
            request_id: head.request_id,
            frame: Frame {
                packet_type,
                offset: head.offset,
                total: head.total,
                data,
            },
        }),
        Err(packet_type) => Err(MalformedFrame {
            request_id: head.request_id,
            packet_type,
        }),
    }
}

/// Decode a standalone message. The message must contain exactly one frame.
pub fn decode(mut msg: Bytes) -> Result<Decoded, CodecError> {
    let head = peek_head(&msg)?;
    let actual = msg.len() - HEADER_LEN;
    if actual != head.len {
        return Err(CodecError::LengthMismatch {
            declared: head.len,
            actual,
        });
    }
    msg.advance(HEADER_LEN);
    Ok(finish(head, msg))
}

/// Stream codec for byte-oriented transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelCodec;

impl Decoder for TunnelCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let head = peek_head(&src[..])?;
        let frame_len = HEADER_LEN + head.len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(head.len).freeze();
        Ok(Some(finish(head, data)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::ShortHeader(src.len())),
        }
    }
}

impl Encoder<WireFrame> for TunnelCodec {
    type Error = CodecError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hashbrown::HashSet;

    fn sample() -> WireFrame {
        WireFrame::new(
            RequestId::from_bytes([7u8; REQUEST_ID_LEN]),
            Frame::body(Bytes::from_static(b"hello"), 10, -1),
        )
    }

    #[test]
    fn test_layout() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(&bytes[..16], &[7u8; 16]);
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..21], &[0, 0, 0, 5]);
        assert_eq!(&bytes[21..25], &[0, 0, 0, 10]);
        assert_eq!(&bytes[25..29], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[29..], b"hello");
    }

    #[test]
    fn test_decode_message() {
        let decoded = decode(encode(&sample()).unwrap()).unwrap().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_short_header_is_error() {
        let bytes = encode(&sample()).unwrap();
        assert!(matches!(
            decode(bytes.slice(..20)),
            Err(CodecError::ShortHeader(20))
        ));
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let bytes = encode(&sample()).unwrap();
        let truncated = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            decode(truncated),
            Err(CodecError::LengthMismatch {
                declared: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_oversized_length_is_error() {
        let mut bytes = BytesMut::from(&encode(&sample()).unwrap()[..]);
        bytes[17..21].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            TunnelCodec.decode(&mut bytes),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut bytes = BytesMut::from(&encode(&sample()).unwrap()[..]);
        bytes[16] = 9;
        let decoded = decode(bytes.freeze()).unwrap();
        assert_eq!(
            decoded,
            Err(MalformedFrame {
                request_id: RequestId::from_bytes([7u8; REQUEST_ID_LEN]),
                packet_type: 9
            })
        );
    }

    #[test]
    fn test_stream_decoder_partial_input() {
        let first = encode(&sample()).unwrap();
        let second = encode(&WireFrame::new(RequestId::generate(), Frame::end())).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first[..10]);
        assert!(TunnelCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&first[10..]);
        buf.extend_from_slice(&second[..HEADER_LEN - 1]);
        let decoded = TunnelCodec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(TunnelCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&second[HEADER_LEN - 1..]);
        let decoded = TunnelCodec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(decoded.frame.is_end());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_stream_at_eof() {
        let bytes = encode(&sample()).unwrap();
        let mut buf = BytesMut::from(&bytes[..HEADER_LEN + 2]);
        assert!(TunnelCodec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<RequestId> = (0..10_000).map(|_| RequestId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_request_id_display() {
        let id = RequestId::from_bytes([0xab; REQUEST_ID_LEN]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
