use crate::config::ClientConfig;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use http::header::{HeaderValue, AUTHORIZATION};
use http::Request;
use relaytun_common::bridge::http::{LocalClient, LocalTarget};
use relaytun_common::bridge::{http as http_bridge, ws as ws_bridge};
use relaytun_common::{head, transport};
use relaytun_common::{Error, IncomingExchange, NodeConnection, Role};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Node side of the tunnel.
///
/// `start` dials the hub and serves tunnelled exchanges until the tunnel drops or `stop` is
/// called. Redialing is left to the caller; a stopped client stays stopped.
#[derive(Clone)]
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    cancel: CancellationToken,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        TunnelClient {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once `stop` is called.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Serve one tunnel session.
    ///
    /// Returns `Ok(())` once stopped and `Err` when the tunnel could not be established or
    /// was lost.
    pub async fn start(&self, auth_token: &str) -> Result<(), Error> {
        if self.is_stopped() {
            return Ok(());
        }

        let config = &self.config;
        let settings = config.settings.clone();
        let target = Arc::new(LocalTarget::new(&config.local_url)?);
        let url = config.tunnel_url()?;

        let mut request = Request::get(url.as_str()).body(())?;
        if !auth_token.is_empty() {
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", auth_token))
                    .map_err(http::Error::from)?,
            );
        }

        let connect = timeout(
            settings.exchange_timeout,
            tokio_tungstenite::connect_async(request),
        );
        let (ws, _) = tokio::select! {
            connected = connect => connected??,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        info!("tunnel established to {}", url);

        let (conn, mut incoming) = NodeConnection::spawn(
            config.node_id.clone(),
            transport::tungstenite(ws),
            settings,
            Role::Node,
        );

        let local_client = LocalClient::new();
        let mut running = FuturesUnordered::new();

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = conn.closed() => break Err(Error::NodeDisconnected),
                exchange = incoming.recv() => match exchange {
                    Some(exchange) => {
                        let span = info_span!("exchange", request_id = %exchange.request_id);
                        running.push(tokio::spawn(
                            serve(conn.clone(), exchange, local_client.clone(), target.clone())
                                .instrument(span),
                        ));
                    }
                    None => break Err(Error::NodeDisconnected),
                },
                Some(_) = running.next(), if !running.is_empty() => {}
            }
        };

        match &outcome {
            Ok(()) => info!("tunnel client stopped"),
            Err(e) => warn!("tunnel to {} lost: {}", url, e),
        }

        conn.shutdown().await;
        for task in running.iter() {
            task.abort();
        }
        while running.next().await.is_some() {}

        outcome
    }
}

async fn serve(
    conn: NodeConnection,
    exchange: IncomingExchange,
    client: LocalClient,
    target: Arc<LocalTarget>,
) {
    let is_websocket = head::parse_request_head(&exchange.head)
        .map(|parts| head::is_websocket_upgrade(&parts.headers))
        .unwrap_or(false);

    let result = if is_websocket {
        ws_bridge::serve_local(conn, exchange, &target).await
    } else {
        http_bridge::serve_local(conn, exchange, &client, &target).await
    };

    match result {
        Ok(()) => debug!("exchange finished"),
        Err(e) if e.is_connection_level() => warn!("exchange failed: {}", e),
        Err(e) => info!("exchange failed: {}", e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use relaytun_common::TunnelSettings;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(relay: String) -> ClientConfig {
        let mut config = ClientConfig::new(
            relay.parse().unwrap(),
            "node1",
            "http://127.0.0.1:1".parse().unwrap(),
        );
        config.settings = TunnelSettings {
            exchange_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        config
    }

    #[tokio::test]
    async fn test_start_fails_without_hub() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TunnelClient::new(config(format!("ws://{}", addr)));
        assert!(client.start("").await.is_err());
        assert!(!client.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_client_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TunnelClient::new(config(format!("ws://{}", addr)));
        let running = tokio::spawn({
            let client = client.clone();
            async move { client.start("token").await }
        });

        // the listener accepts but never answers the handshake
        let _socket = listener.accept().await.unwrap();
        client.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(client.start("token").await.is_ok());
    }
}
