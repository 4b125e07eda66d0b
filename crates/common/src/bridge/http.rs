//! Turning tunnel frames into HTTP messages and back.
use crate::codec::{Frame, PacketType, RequestId, UNKNOWN_TOTAL};
use crate::connection::{Exchange, IncomingExchange, NodeConnection};
use crate::error::Error;
use crate::head;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{request, Request, Response, StatusCode, Uri};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::Body;
use std::convert::TryFrom;
use std::time::Duration;
use tokio::time::timeout;

pub type LocalClient = hyper::Client<HttpConnector, Body>;

fn clamp(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Stream `body` to the peer as `SendBody` fragments. The last fragment is always tagged
/// `EndBody`, and an empty body still produces one empty `EndBody`.
///
/// Returns the number of body bytes sent.
pub async fn send_body(
    conn: &NodeConnection,
    request_id: RequestId,
    mut body: Body,
    known_len: Option<u64>,
) -> Result<u64, Error> {
    let fragment_size = conn.settings().fragment_size.max(1);
    let frame_timeout = conn.settings().frame_timeout;
    let total = known_len.map(clamp).unwrap_or(UNKNOWN_TOTAL);

    let mut offset = 0u64;
    let mut held: Option<Bytes> = None;

    while let Some(chunk) = timeout(frame_timeout, body.data()).await? {
        let mut chunk = chunk?;
        while !chunk.is_empty() {
            let piece = chunk.split_to(fragment_size.min(chunk.len()));
            if let Some(prev) = held.replace(piece) {
                let len = prev.len() as u64;
                conn.send(request_id, Frame::body(prev, clamp(offset), total))
                    .await?;
                offset += len;
            }
        }
    }

    let last = held.unwrap_or_default();
    let len = last.len() as u64;
    conn.send(request_id, Frame::end_body(last, clamp(offset), total))
        .await?;

    Ok(offset + len)
}

/// Body pulling fragments off the exchange on demand, ending at `EndBody`.
pub fn body_from_frames(frames: Exchange, frame_timeout: Duration) -> Body {
    let stream = futures::stream::unfold(Some(frames), move |state| async move {
        let mut frames = state?;

        loop {
            match frames.next_frame(frame_timeout).await {
                Ok(frame) => match frame.packet_type {
                    PacketType::SendBody if frame.data.is_empty() => continue,
                    PacketType::SendBody => return Some((Ok(frame.data), Some(frames))),
                    PacketType::EndBody if frame.data.is_empty() => return None,
                    PacketType::EndBody => return Some((Ok(frame.data), None)),
                    other => {
                        let e = Error::malformed(format!("unexpected {:?} inside body", other));
                        return Some((Err(e), None));
                    }
                },
                Err(e) => {
                    warn!("body of exchange {} interrupted: {}", frames.id(), e);
                    return Some((Err(e), None));
                }
            }
        }
    });

    Body::wrap_stream(stream)
}

/// Wait for the peer's response head.
pub(crate) async fn await_response_head(
    frames: &mut Exchange,
) -> Result<http::response::Parts, Error> {
    let frame = frames.next_frame_unbounded().await?;
    match frame.packet_type {
        PacketType::SendHeader => head::parse_response_head(&frame.data),
        other => Err(Error::malformed(format!(
            "expected response head, got {:?}",
            other
        ))),
    }
}

/// Relay side: forward an edge request over the tunnel and return the node's response
/// with a streamed body.
pub async fn forward_request(
    conn: &NodeConnection,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let settings = conn.settings().clone();
    let request_id = RequestId::generate();
    let mut frames = conn.register(request_id)?;

    let (parts, body) = req.into_parts();
    let known_len = head::content_length(&parts.headers);
    let request_head = head::dump_request_head(&parts);

    debug!("forward {} {} as {}", parts.method, parts.uri, request_id);

    let mut response_head = timeout(settings.exchange_timeout, async {
        conn.send(request_id, Frame::header(request_head)).await?;
        send_body(conn, request_id, body, known_len).await?;
        await_response_head(&mut frames).await
    })
    .await??;

    head::strip_hop_by_hop(&mut response_head.headers);

    Ok(Response::from_parts(
        response_head,
        body_from_frames(frames, settings.frame_timeout),
    ))
}

/// Where the node forwards tunnelled traffic.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    scheme: Scheme,
    authority: Authority,
}

impl LocalTarget {
    pub fn new(base: &Uri) -> Result<Self, Error> {
        let scheme = base.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = base
            .authority()
            .cloned()
            .ok_or_else(|| Error::malformed(format!("no authority in local URL {}", base)))?;

        Ok(LocalTarget { scheme, authority })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    fn uri_with(&self, scheme: Scheme, original: &Uri) -> Result<Uri, Error> {
        let path_and_query = original
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Ok(Uri::builder()
            .scheme(scheme)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?)
    }

    /// Point the request at the local service, keeping path and query.
    pub fn rewrite(&self, parts: &mut request::Parts) -> Result<(), Error> {
        parts.uri = self.uri_with(self.scheme.clone(), &parts.uri)?;
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(self.authority.as_str()).map_err(http::Error::from)?,
        );
        Ok(())
    }

    /// WebSocket URL on the local service for the tunnelled request target.
    pub fn websocket_uri(&self, original: &Uri) -> Result<Uri, Error> {
        let scheme = if self.scheme == Scheme::HTTPS {
            "wss"
        } else {
            "ws"
        };
        self.uri_with(
            scheme.parse::<Scheme>().map_err(http::Error::from)?,
            original,
        )
    }
}

/// Answer an exchange with a body-less status response.
pub async fn reply_status(
    conn: &NodeConnection,
    request_id: RequestId,
    status: StatusCode,
) -> Result<(), Error> {
    conn.send(request_id, Frame::header(head::status_head(status)))
        .await?;
    conn.send(request_id, Frame::end()).await
}

/// Node side: replay a tunnelled request against the local service and stream its
/// response back.
pub async fn serve_local(
    conn: NodeConnection,
    exchange: IncomingExchange,
    client: &LocalClient,
    target: &LocalTarget,
) -> Result<(), Error> {
    let settings = conn.settings().clone();
    let IncomingExchange {
        request_id,
        head: request_head,
        frames,
    } = exchange;

    let mut parts = match head::parse_request_head(&request_head) {
        Ok(parts) => parts,
        Err(e) => {
            reply_status(&conn, request_id, StatusCode::BAD_REQUEST).await?;
            return Err(e);
        }
    };

    let with_body = head::has_body(&parts.headers);
    head::strip_hop_by_hop(&mut parts.headers);
    target.rewrite(&mut parts)?;

    // without a body the relay still sends a bare EndBody, keep the exchange registered
    // so it is consumed quietly
    let (body, _unused_frames) = if with_body {
        (body_from_frames(frames, settings.frame_timeout), None)
    } else {
        (Body::empty(), Some(frames))
    };

    debug!("{} {} -> local", parts.method, parts.uri);

    let response = match timeout(
        settings.exchange_timeout,
        client.request(Request::from_parts(parts, body)),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!("local service request failed: {}", e);
            return reply_status(&conn, request_id, StatusCode::BAD_GATEWAY).await;
        }
        Err(_) => {
            warn!("local service did not answer in time");
            return reply_status(&conn, request_id, StatusCode::GATEWAY_TIMEOUT).await;
        }
    };

    let (parts, body) = response.into_parts();
    let known_len = head::content_length(&parts.headers);

    conn.send(request_id, Frame::header(head::dump_response_head(&parts)))
        .await?;
    let sent = send_body(&conn, request_id, body, known_len).await?;

    debug!("response {} streamed, {} body bytes", parts.status, sent);

    Ok(())
}
