use futures::{SinkExt, StreamExt};
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};
use relaytun_client::{ClientConfig, TunnelClient};
use relaytun_common::bridge::ws::sec_websocket_accept;
use relaytun_common::{head, TunnelSettings};
use relaytun_hub::{AllowAll, NodeResolver, RelayHub};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const TEST_RESPONSE: &str = r#"{"message":"test response"}"#;
const CHUNKS: [&str; 4] = ["first chunk,", "second chunk,", "", "last chunk"];

fn settings() -> TunnelSettings {
    TunnelSettings {
        frame_timeout: Duration::from_secs(3),
        exchange_timeout: Duration::from_secs(5),
        fragment_size: 1024,
        ..Default::default()
    }
}

fn websocket_echo_handler(req: Request<Body>) -> Response<Body> {
    let key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(sec_websocket_accept)
        .unwrap();

    tokio::spawn(async move {
        let upgraded = hyper::upgrade::on(req).await.unwrap();
        let mut ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_text() || msg.is_binary() {
                ws.send(msg).await.unwrap();
            } else if msg.is_close() {
                break;
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, key)
        .body(Body::empty())
        .unwrap()
}

async fn local_service(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if head::is_websocket_upgrade(req.headers()) {
        return Ok(websocket_echo_handler(req));
    }

    let res = match req.uri().path() {
        "/test" => Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(TEST_RESPONSE)),
        "/empty" => Response::builder()
            .header(CONTENT_LENGTH, "0")
            .body(Body::empty()),
        "/chunked" => {
            let chunks = CHUNKS.iter().map(|c| Ok::<_, Infallible>(*c));
            Response::builder().body(Body::wrap_stream(futures::stream::iter(chunks)))
        }
        "/echo" => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            Response::builder().body(Body::from(body))
        }
        "/hang" => {
            sleep(Duration::from_secs(30)).await;
            Response::builder().body(Body::empty())
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty()),
    };

    Ok(res.unwrap())
}

fn spawn_local_service() -> SocketAddr {
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(local_service))
    }));
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

struct Fixture {
    hub: RelayHub,
    edge_addr: SocketAddr,
    client: TunnelClient,
    client_task: Option<JoinHandle<Result<(), relaytun_common::Error>>>,
}

impl Fixture {
    async fn new(connect_client: bool) -> Self {
        let local_addr = spawn_local_service();
        let hub = RelayHub::new(settings());

        let (tunnel_addr, tunnel_server) = relaytun_hub::registration::bind(
            "127.0.0.1:0".parse().unwrap(),
            hub.clone(),
            Arc::new(AllowAll),
            futures::future::pending(),
        )
        .unwrap();
        tokio::spawn(tunnel_server);

        let resolver: Arc<dyn NodeResolver> =
            Arc::new(|_: &Request<Body>| Some("node1".to_string()));
        let (edge_addr, edge_server) = relaytun_hub::edge::bind(
            "127.0.0.1:0".parse().unwrap(),
            hub.clone(),
            resolver,
            futures::future::pending(),
        )
        .unwrap();
        tokio::spawn(edge_server);

        let mut config = ClientConfig::new(
            format!("ws://{}", tunnel_addr).parse().unwrap(),
            "node1",
            format!("http://{}", local_addr).parse().unwrap(),
        );
        config.settings = settings();
        let client = TunnelClient::new(config);

        let client_task = if connect_client {
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.start("").await }
            });

            for _ in 0..100 {
                if hub.is_connected("node1") {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
            assert!(hub.is_connected("node1"), "node did not register");
            Some(task)
        } else {
            None
        };

        Fixture {
            hub,
            edge_addr,
            client,
            client_task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.edge_addr, path)
    }
}

#[tokio::test]
async fn round_trip() {
    let fixture = Fixture::new(true).await;

    let res = Client::new()
        .get(fixture.url("/test").parse().unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    assert_eq!(&body[..], TEST_RESPONSE.as_bytes());
}

#[tokio::test]
async fn concurrent_exchanges_do_not_interleave() {
    let fixture = Fixture::new(true).await;
    let client = Client::new();

    let requests = (0..32usize).map(|i| {
        let client = client.clone();
        let url = fixture.url("/echo");
        async move {
            let payload: Vec<u8> = (0..(i * 317 + 1)).map(|b| (b * 7 + i) as u8).collect();
            let req = Request::post(url)
                .body(Body::from(payload.clone()))
                .unwrap();
            let res = client.request(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
            assert_eq!(&body[..], &payload[..], "payload {} corrupted", i);
        }
    });

    timeout(Duration::from_secs(10), futures::future::join_all(requests))
        .await
        .unwrap();
}

#[tokio::test]
async fn zero_length_body_completes() {
    let fixture = Fixture::new(true).await;

    let res = timeout(
        Duration::from_secs(3),
        Client::new().get(fixture.url("/empty").parse().unwrap()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[CONTENT_LENGTH], "0");

    let body = timeout(Duration::from_secs(3), hyper::body::to_bytes(res.into_body()))
        .await
        .unwrap()
        .unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn unknown_length_body_streams() {
    let fixture = Fixture::new(true).await;

    let res = Client::new()
        .get(fixture.url("/chunked").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get(CONTENT_LENGTH).is_none());

    let body = timeout(Duration::from_secs(3), hyper::body::to_bytes(res.into_body()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&body[..], CHUNKS.concat().as_bytes());
}

#[tokio::test]
async fn chunked_request_body_reaches_local_service() {
    let fixture = Fixture::new(true).await;

    let chunks: Vec<Result<Vec<u8>, Infallible>> =
        (0..10u8).map(|i| Ok(vec![i; 700])).collect();
    let expected: Vec<u8> = (0..10u8).flat_map(|i| vec![i; 700]).collect();

    let req = Request::post(fixture.url("/echo"))
        .body(Body::wrap_stream(futures::stream::iter(chunks)))
        .unwrap();
    let res = Client::new().request(req).await.unwrap();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    assert_eq!(&body[..], &expected[..]);
}

#[tokio::test]
async fn websocket_echo() {
    let fixture = Fixture::new(true).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", fixture.edge_addr))
        .await
        .unwrap();

    ws.send(Message::Text("hello over the tunnel".into()))
        .await
        .unwrap();
    let echoed = timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Text("hello over the tunnel".into()));

    let binary = vec![0u8, 1, 2, 127, 128, 254, 255];
    ws.send(Message::Binary(binary.clone())).await.unwrap();
    let echoed = timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Binary(binary));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn missing_node_is_bad_gateway() {
    let fixture = Fixture::new(false).await;

    let res = timeout(
        Duration::from_secs(1),
        Client::new().get(fixture.url("/test").parse().unwrap()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    let ws = tokio_tungstenite::connect_async(format!("ws://{}/ws", fixture.edge_addr)).await;
    assert!(ws.is_err());
}

#[tokio::test]
async fn disconnect_fails_in_flight_exchange() {
    let mut fixture = Fixture::new(true).await;

    let pending = tokio::spawn(
        Client::new().get(fixture.url("/hang").parse().unwrap()),
    );
    sleep(Duration::from_millis(200)).await;

    fixture.client.stop();
    let stopped = fixture.client_task.take().unwrap().await.unwrap();
    assert!(stopped.is_ok());

    let res = timeout(Duration::from_secs(3), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    for _ in 0..100 {
        if !fixture.hub.is_connected("node1") {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(!fixture.hub.is_connected("node1"));
}
