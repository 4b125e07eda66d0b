//! Physical tunnel transports, reduced to a stream and a sink of frames.
use crate::codec::{self, Decoded, TunnelCodec, WireFrame};
use crate::error::Error;
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Decoded, Error>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = Error> + Send>>;

pub struct Transport {
    pub stream: FrameStream,
    pub sink: FrameSink,
}

impl Transport {
    pub fn new<St, Si>(stream: St, sink: Si) -> Self
    where
        St: Stream<Item = Result<Decoded, Error>> + Send + 'static,
        Si: Sink<WireFrame, Error = Error> + Send + 'static,
    {
        Transport {
            stream: Box::pin(stream),
            sink: Box::pin(sink),
        }
    }
}

/// Any byte stream, framed with the tunnel codec.
pub fn framed<T>(io: T) -> Transport
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = Framed::new(io, TunnelCodec).split();

    Transport::new(
        stream.map(|r| r.map_err(Error::from)),
        sink.sink_map_err(Error::from),
    )
}

/// Decode one binary WebSocket message.
pub fn decode_binary(data: Bytes) -> Result<Decoded, Error> {
    Ok(codec::decode(data)?)
}

/// Encode one frame into a binary WebSocket message payload.
pub fn encode_binary(wire: &WireFrame) -> Result<Vec<u8>, Error> {
    Ok(codec::encode(wire)?.to_vec())
}

/// Tunnel over a tokio-tungstenite WebSocket. One binary message carries exactly one
/// frame.
pub fn tungstenite<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Binary(data)) => Some(decode_binary(Bytes::from(data))),
            Ok(Message::Text(_)) => Some(Err(Error::Transport(
                "unexpected text message on tunnel".into(),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(Error::from(e))),
        })
    });

    let sink = sink
        .sink_map_err(Error::from)
        .with(|wire: WireFrame| future::ready(encode_binary(&wire).map(Message::Binary)));

    Transport::new(stream, sink)
}
