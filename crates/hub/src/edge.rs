//! Public edge server: resolves each request to a node and routes it through the hub.
use crate::hub::RelayHub;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use relaytun_common::head;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Picks the node an edge request is meant for.
pub trait NodeResolver: Send + Sync + 'static {
    fn resolve(&self, req: &Request<Body>) -> Option<String>;
}

impl<F> NodeResolver for F
where
    F: Fn(&Request<Body>) -> Option<String> + Send + Sync + 'static,
{
    fn resolve(&self, req: &Request<Body>) -> Option<String> {
        self(req)
    }
}

/// `<node>.<base-domain>` hosts.
#[derive(Debug, Clone)]
pub struct SubdomainResolver {
    suffix: String,
}

impl SubdomainResolver {
    pub fn new(base_domain: &str) -> Self {
        SubdomainResolver {
            suffix: format!(".{}", base_domain.trim_matches('.').to_lowercase()),
        }
    }

    pub fn node_id(&self, host: &str) -> Option<String> {
        let host = host.to_lowercase();
        let host = match host.rfind(':') {
            Some(idx) if !host.ends_with(']') => &host[..idx],
            _ => &host[..],
        };

        let node_id = host.strip_suffix(self.suffix.as_str())?;
        if node_id.is_empty() || node_id.contains('.') {
            return None;
        }
        Some(node_id.to_string())
    }
}

impl NodeResolver for SubdomainResolver {
    fn resolve(&self, req: &Request<Body>) -> Option<String> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())?;
        self.node_id(host)
    }
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    let mut res = Response::new(Body::from(message));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    res
}

pub async fn handle(
    hub: RelayHub,
    resolver: Arc<dyn NodeResolver>,
    req: Request<Body>,
) -> Response<Body> {
    let node_id = match resolver.resolve(&req) {
        Some(node_id) => node_id,
        None => return error_response(StatusCode::NOT_FOUND, "unknown node\n".into()),
    };

    let result = if head::is_websocket_upgrade(req.headers()) {
        hub.route_ws(&node_id, req).await
    } else {
        hub.route_http(&node_id, req).await
    };

    match result {
        Ok(res) => res,
        Err(e) => {
            info!("request to node {} failed: {}", node_id, e);
            error_response(e.status_code(), format!("{}\n", e))
        }
    }
}

pub fn bind(
    addr: SocketAddr,
    hub: RelayHub,
    resolver: Arc<dyn NodeResolver>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        shadow_clone!(hub);
        shadow_clone!(resolver);

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                shadow_clone!(hub);
                shadow_clone!(resolver);

                async move { Ok::<_, Infallible>(handle(hub, resolver, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();

    Ok((local_addr, server.with_graceful_shutdown(shutdown)))
}
