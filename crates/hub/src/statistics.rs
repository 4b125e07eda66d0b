use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder};
use relaytun_common::Error;

lazy_static! {
    pub static ref CONNECTED_NODES: IntGauge = register_int_gauge!(opts!(
        "relaytun_connected_nodes",
        "Number of nodes with a live tunnel"
    ))
    .unwrap();
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!(opts!(
        "relaytun_registrations",
        "Accepted tunnel registrations"
    ))
    .unwrap();
    pub static ref REGISTRATIONS_REPLACED: IntCounter = register_int_counter!(opts!(
        "relaytun_registrations_replaced",
        "Registrations which replaced a live tunnel of the same node"
    ))
    .unwrap();
    pub static ref REGISTRATIONS_REJECTED: IntCounter = register_int_counter!(opts!(
        "relaytun_registrations_rejected",
        "Tunnel registrations refused by the authenticator"
    ))
    .unwrap();
    pub static ref EXCHANGES: IntCounterVec = register_int_counter_vec!(
        "relaytun_exchanges",
        "Exchanges routed to nodes",
        &["kind", "outcome"]
    )
    .unwrap();
    pub static ref RESPONSE_HEAD_TIME: Histogram = register_histogram!(
        "relaytun_response_head_seconds",
        "Time until the node answered with a response head"
    )
    .unwrap();
}

fn outcome<T>(result: &Result<T, Error>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(Error::NodeNotConnected(_)) => "not_connected",
        Err(Error::Timeout) => "timeout",
        Err(Error::NodeDisconnected) => "disconnected",
        Err(Error::Malformed(_)) => "malformed",
        Err(_) => "error",
    }
}

pub fn record_exchange<T>(kind: &str, result: &Result<T, Error>) {
    EXCHANGES.with_label_values(&[kind, outcome(result)]).inc();
}

pub fn dump_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("could not encode metrics: {}", e);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}
