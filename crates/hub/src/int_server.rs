use std::future::Future;
use std::net::SocketAddr;
use warp::Filter;

/// Internal listener serving `/metrics`.
pub fn bind(
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    warp::serve(warp::path!("metrics").map(crate::statistics::dump_prometheus))
        .try_bind_with_graceful_shutdown(addr, shutdown)
}
