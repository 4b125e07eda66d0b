//! WebSocket sessions carried over a tunnel exchange.
use crate::bridge::http::{await_response_head, body_from_frames, reply_status, LocalTarget};
use crate::codec::{Frame, PacketType, RequestId, WS_TEXT};
use crate::connection::{Exchange, IncomingExchange, NodeConnection};
use crate::error::Error;
use crate::head;
use futures::{SinkExt, StreamExt};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Request, Response, StatusCode};
use hyper::Body;
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::Instrument;

pub fn sec_websocket_accept(key: &str) -> String {
    let s = format!("{}258EAFA5-E914-47DA-95CA-C5AB0DC85B11", key);

    let mut m = sha1::Sha1::new();
    m.update(s.as_ref());
    base64::encode(m.digest().bytes().as_ref())
}

pub fn message_to_frame(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(text) => Some(Frame::ws_text(text)),
        Message::Binary(data) => Some(Frame::ws_binary(data)),
        _ => None,
    }
}

pub fn frame_to_message(frame: Frame) -> Message {
    if frame.total == WS_TEXT {
        match String::from_utf8(frame.data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        }
    } else {
        Message::Binary(frame.data.to_vec())
    }
}

enum Ended {
    Local(Result<(), Error>),
    Tunnel(Result<(), Error>),
}

/// Pump messages between a WebSocket and a tunnel exchange until either side closes.
///
/// An `EndBody` coming from the tunnel closes the WebSocket. Any other ending, a local
/// close or a failure on either side, is forwarded to the peer as an empty `EndBody`.
pub async fn pump<S>(
    ws: WebSocketStream<S>,
    conn: &NodeConnection,
    request_id: RequestId,
    mut frames: Exchange,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = conn.cancellation();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let ended = {
        let local_to_tunnel = async {
            while let Some(msg) = ws_rx.next().await {
                match msg? {
                    Message::Close(_) => break,
                    msg => {
                        if let Some(frame) = message_to_frame(msg) {
                            conn.send(request_id, frame).await?;
                        }
                    }
                }
            }
            Ok::<_, Error>(())
        };

        let tunnel_to_local = async {
            loop {
                let frame = frames.next_frame_unbounded().await?;
                match frame.packet_type {
                    PacketType::WebSocketData => ws_tx.send(frame_to_message(frame)).await?,
                    PacketType::EndBody => return Ok(()),
                    other => {
                        return Err(Error::malformed(format!(
                            "unexpected {:?} in websocket session",
                            other
                        )))
                    }
                }
            }
        };

        tokio::select! {
            r = local_to_tunnel => Ended::Local(r),
            r = tunnel_to_local => Ended::Tunnel(r),
            _ = cancel.cancelled() => Ended::Tunnel(Err(Error::NodeDisconnected)),
        }
    };

    let frame_timeout = conn.settings().frame_timeout;
    let (peer_ended, result) = match ended {
        Ended::Local(r) => (false, r),
        Ended::Tunnel(r) => (r.is_ok(), r),
    };

    if !peer_ended && !conn.is_closed() {
        if let Err(e) = conn.send(request_id, Frame::end()).await {
            debug!("could not signal websocket close to peer: {}", e);
        }
    }

    let _ = timeout(frame_timeout, ws_tx.close()).await;

    result
}

/// Relay side: forward a WebSocket upgrade over the tunnel. On success the edge
/// connection is upgraded and pumped in a background task.
pub async fn forward_upgrade(
    conn: &NodeConnection,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let settings = conn.settings().clone();

    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| Error::malformed("websocket upgrade without key"))?;

    let request_id = RequestId::generate();
    let mut frames = conn.register(request_id)?;

    let (parts, body) = req.into_parts();
    let request_head = head::dump_request_head(&parts);

    let mut response_head = timeout(settings.exchange_timeout, async {
        conn.send(request_id, Frame::header(request_head)).await?;
        await_response_head(&mut frames).await
    })
    .await??;

    if response_head.status != StatusCode::SWITCHING_PROTOCOLS {
        info!(
            "node refused websocket upgrade with {}",
            response_head.status
        );
        head::strip_hop_by_hop(&mut response_head.headers);
        return Ok(Response::from_parts(
            response_head,
            body_from_frames(frames, settings.frame_timeout),
        ));
    }

    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    res.headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    res.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    res.headers_mut().insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&sec_websocket_accept(&key)).map_err(http::Error::from)?,
    );
    if let Some(protocol) = response_head.headers.get(SEC_WEBSOCKET_PROTOCOL) {
        res.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    let edge_req = Request::from_parts(parts, body);
    let cancel = conn.cancellation();
    let session = conn.clone();

    conn.spawn_task(
        async move {
            let upgrade = timeout(settings.exchange_timeout, hyper::upgrade::on(edge_req));
            let upgraded = tokio::select! {
                upgraded = upgrade => upgraded,
                _ = cancel.cancelled() => return,
            };

            let upgraded = match upgraded {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(e)) => {
                    warn!("error upgrading edge connection: {}", e);
                    let _ = session.send(request_id, Frame::end()).await;
                    return;
                }
                Err(_) => {
                    warn!("timeout upgrading edge connection");
                    let _ = session.send(request_id, Frame::end()).await;
                    return;
                }
            };

            let edge_ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;

            match pump(edge_ws, &session, request_id, frames).await {
                Ok(()) => debug!("websocket session finished"),
                Err(e) => info!("websocket session closed: {}", e),
            }
        }
        .instrument(info_span!("websocket", request_id = %request_id)),
    );

    Ok(res)
}

lazy_static! {
    /// Headers the WebSocket client generates itself.
    static ref HANDSHAKE_HEADERS: [HeaderName; 6] = [
        HOST,
        UPGRADE,
        SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION,
        SEC_WEBSOCKET_EXTENSIONS,
        SEC_WEBSOCKET_ACCEPT,
    ];
}

/// Node side: open the WebSocket on the local service and pump the session.
pub async fn serve_local(
    conn: NodeConnection,
    exchange: IncomingExchange,
    target: &LocalTarget,
) -> Result<(), Error> {
    let settings = conn.settings().clone();
    let IncomingExchange {
        request_id,
        head: request_head,
        frames,
    } = exchange;

    let parts = match head::parse_request_head(&request_head) {
        Ok(parts) => parts,
        Err(e) => {
            reply_status(&conn, request_id, StatusCode::BAD_REQUEST).await?;
            return Err(e);
        }
    };

    let mut local_req = Request::builder()
        .uri(target.websocket_uri(&parts.uri)?)
        .body(())?;
    for (name, value) in parts.headers.iter() {
        if HANDSHAKE_HEADERS.contains(name) || head::HOP_BY_HOP_HEADERS.contains(name) {
            continue;
        }
        local_req.headers_mut().append(name, value.clone());
    }

    let (local_ws, handshake) = match timeout(
        settings.exchange_timeout,
        tokio_tungstenite::connect_async(local_req),
    )
    .await
    {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            warn!("local websocket handshake failed: {}", e);
            return reply_status(&conn, request_id, StatusCode::BAD_GATEWAY).await;
        }
        Err(_) => {
            warn!("local websocket handshake timed out");
            return reply_status(&conn, request_id, StatusCode::GATEWAY_TIMEOUT).await;
        }
    };

    let (mut response_head, ()) = Response::new(()).into_parts();
    response_head.status = handshake.status();
    response_head.headers = handshake.headers().clone();

    conn.send(
        request_id,
        Frame::header(head::dump_response_head(&response_head)),
    )
    .await?;

    pump(local_ws, &conn, request_id, frames).await
}
