use crate::statistics;
use hashbrown::HashMap;
use hyper::{Body, Request, Response};
use parking_lot::RwLock;
use relaytun_common::bridge;
use relaytun_common::{Error, NodeConnection, Role, Transport, TunnelSettings};
use std::sync::{Arc, Weak};
use tracing::Instrument;

struct Inner {
    nodes: RwLock<HashMap<String, NodeConnection>>,
    settings: TunnelSettings,
}

impl Inner {
    /// Forget `conn` unless it was already replaced by a newer registration.
    fn deregister(&self, node_id: &str, conn: &NodeConnection) {
        let mut nodes = self.nodes.write();
        let is_current = nodes
            .get(node_id)
            .map(|current| current.same_connection(conn))
            .unwrap_or(false);

        if is_current {
            nodes.remove(node_id);
            statistics::CONNECTED_NODES.dec();
            info!("node {} disconnected", node_id);
        }
    }
}

/// Registry of live node tunnels, routing edge traffic onto them.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<Inner>,
}

impl RelayHub {
    pub fn new(settings: TunnelSettings) -> Self {
        RelayHub {
            inner: Arc::new(Inner {
                nodes: Default::default(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    /// Install a tunnel for `node_id`. A live tunnel already registered under the same id
    /// is closed, failing whatever was in flight on it.
    pub fn register(&self, node_id: impl Into<String>, transport: Transport) -> NodeConnection {
        let node_id = node_id.into();
        let (conn, _) = NodeConnection::spawn(
            node_id.clone(),
            transport,
            self.inner.settings.clone(),
            Role::Relay,
        );

        let previous = self
            .inner
            .nodes
            .write()
            .insert(node_id.clone(), conn.clone());

        statistics::REGISTRATIONS.inc();
        match previous {
            Some(old) => {
                info!("node {} registered again, closing previous tunnel", node_id);
                statistics::REGISTRATIONS_REPLACED.inc();
                old.close();
            }
            None => {
                info!("node {} registered", node_id);
                statistics::CONNECTED_NODES.inc();
            }
        }

        let hub = Arc::downgrade(&self.inner);
        tokio::spawn(watch(hub, node_id, conn.clone()));

        conn
    }

    fn connection(&self, node_id: &str) -> Result<NodeConnection, Error> {
        self.inner
            .nodes
            .read()
            .get(node_id)
            .filter(|conn| !conn.is_closed())
            .cloned()
            .ok_or_else(|| Error::NodeNotConnected(node_id.to_string()))
    }

    /// Forward an HTTP request to the node. The response body keeps streaming after this
    /// returns.
    pub async fn route_http(
        &self,
        node_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        let result = match self.connection(node_id) {
            Ok(conn) => {
                let span = info_span!("http", node_id = %node_id, path = %req.uri().path());
                let timer = statistics::RESPONSE_HEAD_TIME.start_timer();
                let result = bridge::http::forward_request(&conn, req)
                    .instrument(span)
                    .await;
                timer.observe_duration();
                close_on_connection_error(&conn, &result);
                result
            }
            Err(e) => Err(e),
        };

        statistics::record_exchange("http", &result);
        result
    }

    /// Forward a WebSocket upgrade to the node. On success the returned `101` response
    /// upgrades the edge connection and the session is pumped in the background.
    pub async fn route_ws(
        &self,
        node_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        let result = match self.connection(node_id) {
            Ok(conn) => {
                let span = info_span!("ws", node_id = %node_id, path = %req.uri().path());
                let result = bridge::ws::forward_upgrade(&conn, req)
                    .instrument(span)
                    .await;
                close_on_connection_error(&conn, &result);
                result
            }
            Err(e) => Err(e),
        };

        statistics::record_exchange("ws", &result);
        result
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .inner
            .nodes
            .read()
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(node_id, _)| node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connection(node_id).is_ok()
    }

    /// Close every tunnel and wait until their tasks are gone.
    pub async fn shutdown(&self) {
        let conns: Vec<_> = self
            .inner
            .nodes
            .write()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        statistics::CONNECTED_NODES.sub(conns.len() as i64);
        info!("shutting down {} tunnels", conns.len());

        for conn in conns {
            conn.shutdown().await;
        }
    }
}

fn close_on_connection_error<T>(conn: &NodeConnection, result: &Result<T, Error>) {
    if let Err(e) = result {
        if e.is_connection_level() {
            warn!("closing tunnel of {}: {}", conn.node_id(), e);
            conn.close();
        }
    }
}

async fn watch(hub: Weak<Inner>, node_id: String, conn: NodeConnection) {
    conn.closed().await;
    if let Some(inner) = hub.upgrade() {
        inner.deregister(&node_id, &conn);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use relaytun_common::bridge::http::send_body;
    use relaytun_common::head;
    use relaytun_common::transport;
    use relaytun_common::IncomingExchange;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn settings() -> TunnelSettings {
        TunnelSettings {
            frame_timeout: Duration::from_secs(2),
            exchange_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn connect(
        hub: &RelayHub,
        node_id: &str,
    ) -> (
        NodeConnection,
        NodeConnection,
        mpsc::Receiver<IncomingExchange>,
    ) {
        let (relay_io, node_io) = tokio::io::duplex(64 * 1024);
        let relay = hub.register(node_id, transport::framed(relay_io));
        let (node, incoming) =
            NodeConnection::spawn(node_id, transport::framed(node_io), settings(), Role::Node);
        (relay, node, incoming)
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(format!("http://node.example.com{}", path))
            .body(Body::empty())
            .unwrap()
    }

    async fn wait_disconnected(hub: &RelayHub, node_id: &str) {
        for _ in 0..100 {
            if !hub.is_connected(node_id) && hub.connected_nodes().is_empty() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("node {} still registered", node_id);
    }

    #[tokio::test]
    async fn test_missing_node_fails_fast() {
        let hub = RelayHub::new(settings());

        let res = timeout(Duration::from_millis(100), hub.route_http("ghost", get("/")))
            .await
            .unwrap();
        assert!(matches!(res, Err(Error::NodeNotConnected(ref id)) if id == "ghost"));

        let res = timeout(Duration::from_millis(100), hub.route_ws("ghost", get("/")))
            .await
            .unwrap();
        assert!(matches!(res, Err(Error::NodeNotConnected(_))));
    }

    #[tokio::test]
    async fn test_route_http() {
        let hub = RelayHub::new(settings());
        let (_relay, node, mut incoming) = connect(&hub, "node1");

        tokio::spawn(async move {
            let exchange = incoming.recv().await.unwrap();
            let parts = head::parse_request_head(&exchange.head).unwrap();
            assert_eq!(parts.uri, "/hello");

            let (res, ()) = Response::builder()
                .status(201)
                .header("content-length", "5")
                .body(())
                .unwrap()
                .into_parts();
            node.send(
                exchange.request_id,
                relaytun_common::Frame::header(head::dump_response_head(&res)),
            )
            .await
            .unwrap();
            send_body(&node, exchange.request_id, Body::from("hello"), Some(5))
                .await
                .unwrap();
            let _keep = exchange.frames;
            sleep(Duration::from_secs(1)).await;
        });

        let res = hub.route_http("node1", get("/hello")).await.unwrap();
        assert_eq!(res.status(), 201);
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_register_replaces_and_closes_previous() {
        let hub = RelayHub::new(settings());

        let (first, _first_node, _first_incoming) = connect(&hub, "node1");
        let (second, _second_node, _second_incoming) = connect(&hub, "node1");

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(hub.connected_nodes(), vec!["node1".to_string()]);

        // the watcher of the replaced tunnel must not evict its successor
        sleep(Duration::from_millis(100)).await;
        assert!(hub.is_connected("node1"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_exchange() {
        let hub = RelayHub::new(settings());
        let (_relay, node, mut incoming) = connect(&hub, "node1");

        let pending = tokio::spawn({
            let hub = hub.clone();
            async move { hub.route_http("node1", get("/slow")).await }
        });

        let _exchange = incoming.recv().await.unwrap();
        node.shutdown().await;

        let res = timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(Error::NodeDisconnected)));

        wait_disconnected(&hub, "node1").await;
        assert!(matches!(
            hub.route_http("node1", get("/")).await,
            Err(Error::NodeNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let hub = RelayHub::new(settings());
        let (a, _a_node, _a_incoming) = connect(&hub, "a");
        let (b, _b_node, _b_incoming) = connect(&hub, "b");
        assert_eq!(hub.connected_nodes(), vec!["a".to_string(), "b".to_string()]);

        hub.shutdown().await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(hub.connected_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let hub = RelayHub::new(TunnelSettings {
            exchange_timeout: Duration::from_millis(300),
            ..settings()
        });
        let (relay, _node, mut incoming) = connect(&hub, "node1");

        let held = tokio::spawn(async move {
            let exchange = incoming.recv().await.unwrap();
            sleep(Duration::from_secs(2)).await;
            exchange
        });

        let res = timeout(Duration::from_secs(2), hub.route_http("node1", get("/silent")))
            .await
            .unwrap();
        let err = res.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(err.status_code(), hyper::StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(relay.pending_exchanges(), 0);
        assert!(hub.is_connected("node1"));

        held.abort();
    }
}
