//! Tunnel registration endpoint: nodes dial `GET /api/v1/tunnel?node_id=<id>` and upgrade
//! to a WebSocket which then carries the tunnel frames.
use crate::hub::RelayHub;
use crate::statistics;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use relaytun_common::transport::{decode_binary, encode_binary};
use relaytun_common::{Error, Transport, WireFrame};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::ws::{Message, WebSocket};
use warp::Filter;

pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;
pub const BAD_NODE_ID_CLOSE_CODE: u16 = 4000;

/// Decides whether a node may register. Token issuance lives elsewhere.
pub trait NodeAuthenticator: Send + Sync + 'static {
    fn authenticate(&self, node_id: &str, authorization: Option<&str>) -> bool;
}

pub struct AllowAll;

impl NodeAuthenticator for AllowAll {
    fn authenticate(&self, _node_id: &str, _authorization: Option<&str>) -> bool {
        true
    }
}

/// Every node presents the same `Bearer` token.
pub struct SharedToken {
    token: String,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        SharedToken {
            token: token.into(),
        }
    }
}

impl NodeAuthenticator for SharedToken {
    fn authenticate(&self, _node_id: &str, authorization: Option<&str>) -> bool {
        authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim() == self.token)
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationParams {
    node_id: String,
}

fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.is_empty()
        && node_id.len() <= 63
        && node_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Tunnel over a warp server-side WebSocket, one binary message per frame.
pub fn transport(ws: WebSocket) -> Transport {
    let (sink, stream) = ws.split();

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) if msg.is_binary() => {
                Some(decode_binary(Bytes::copy_from_slice(msg.as_bytes())))
            }
            Ok(msg) if msg.is_text() => Some(Err(Error::Transport(
                "unexpected text message on tunnel".into(),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(Error::Transport(e.to_string()))),
        })
    });

    let sink = sink
        .sink_map_err(|e| Error::Transport(e.to_string()))
        .with(|wire: WireFrame| future::ready(encode_binary(&wire).map(Message::binary)));

    Transport::new(stream, sink)
}

async fn accept(
    hub: RelayHub,
    authenticator: Arc<dyn NodeAuthenticator>,
    node_id: String,
    authorization: Option<String>,
    mut websocket: WebSocket,
) {
    if !is_valid_node_id(&node_id) {
        info!("refusing registration with bad node id {:?}", node_id);
        statistics::REGISTRATIONS_REJECTED.inc();
        let _ = websocket
            .send(Message::close_with(BAD_NODE_ID_CLOSE_CODE, "bad node id"))
            .await;
        return;
    }

    if !authenticator.authenticate(&node_id, authorization.as_deref()) {
        info!("closing tunnel of {} with unauthorized message", node_id);
        statistics::REGISTRATIONS_REJECTED.inc();
        let _ = websocket
            .send(Message::close_with(UNAUTHORIZED_CLOSE_CODE, "unauthorized"))
            .await;
        return;
    }

    hub.register(node_id, transport(websocket));
}

pub fn filter(
    hub: RelayHub,
    authenticator: Arc<dyn NodeAuthenticator>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("api" / "v1" / "tunnel")
        .and(warp::query::<RegistrationParams>())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::ws())
        .map(
            move |params: RegistrationParams, authorization: Option<String>, ws: warp::ws::Ws| {
                shadow_clone!(hub);
                shadow_clone!(authenticator);

                ws.on_upgrade(move |websocket| {
                    accept(hub, authenticator, params.node_id, authorization, websocket)
                })
            },
        )
}

pub fn bind(
    addr: SocketAddr,
    hub: RelayHub,
    authenticator: Arc<dyn NodeAuthenticator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    warp::serve(filter(hub, authenticator)).try_bind_with_graceful_shutdown(addr, shutdown)
}
