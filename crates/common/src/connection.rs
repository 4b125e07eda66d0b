//! One physical tunnel connection: a single writer task draining the outbound queue and a
//! single reader task demultiplexing inbound frames to their exchanges.
use crate::codec::{Frame, PacketType, RequestId, WireFrame};
use crate::correlation::{CorrelationTable, PendingExchange};
use crate::error::Error;
use crate::settings::TunnelSettings;
use crate::transport::{FrameSink, FrameStream, Transport};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What the demultiplexer hands to an exchange: a frame, or the reason it was cut short.
pub type Inbound = Result<Frame, Error>;

pub type Exchange = PendingExchange<Inbound>;

impl PendingExchange<Inbound> {
    pub async fn next_frame(&mut self, limit: Duration) -> Result<Frame, Error> {
        self.recv(limit).await?
    }

    pub async fn next_frame_unbounded(&mut self) -> Result<Frame, Error> {
        self.recv_unbounded().await?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Relay side: only answers to exchanges it started.
    Relay,
    /// Node side: a `SendHeader` on an unknown request id starts a new exchange.
    Node,
}

/// Exchange started by the remote peer.
pub struct IncomingExchange {
    pub request_id: RequestId,
    pub head: Bytes,
    pub frames: Exchange,
}

struct Inner {
    node_id: String,
    outbound: mpsc::Sender<WireFrame>,
    table: Arc<CorrelationTable<Inbound>>,
    cancel: CancellationToken,
    settings: TunnelSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct NodeConnection {
    inner: Arc<Inner>,
}

fn teardown(cancel: &CancellationToken, table: &CorrelationTable<Inbound>) {
    cancel.cancel();
    let failed = table.close();
    if failed > 0 {
        warn!("{} pending exchanges failed: node disconnected", failed);
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<WireFrame>,
    cancel: CancellationToken,
    frame_timeout: Duration,
) -> Result<(), Error> {
    loop {
        let wire = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_wire = outbound.recv() => match maybe_wire {
                Some(wire) => wire,
                None => break,
            },
        };

        timeout(frame_timeout, sink.send(wire)).await??;
    }

    let _ = timeout(frame_timeout, sink.close()).await;

    Ok(())
}

async fn read_loop(
    mut stream: FrameStream,
    table: Arc<CorrelationTable<Inbound>>,
    incoming: Option<mpsc::Sender<IncomingExchange>>,
    cancel: CancellationToken,
    frame_timeout: Duration,
) -> Result<(), Error> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };

        let wire = match next {
            None => {
                info!("tunnel closed by peer");
                return Ok(());
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(Err(malformed))) => {
                warn!(
                    "unknown packet type {} on exchange {}",
                    malformed.packet_type, malformed.request_id
                );
                table.abort(
                    &malformed.request_id,
                    Err(Error::malformed(format!(
                        "unknown packet type {}",
                        malformed.packet_type
                    ))),
                );
                continue;
            }
            Some(Ok(Ok(wire))) => wire,
        };

        let WireFrame { request_id, frame } = wire;

        match &incoming {
            Some(incoming)
                if frame.packet_type == PacketType::SendHeader && !table.contains(&request_id) =>
            {
                let frames = table.register(request_id)?;
                let exchange = IncomingExchange {
                    request_id,
                    head: frame.data,
                    frames,
                };
                match timeout(frame_timeout, incoming.send(exchange)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!("no acceptor for exchange {}", request_id),
                    Err(_) => warn!("exchange {} not accepted in time, drop it", request_id),
                }
            }
            _ => {
                table.deliver(request_id, Ok(frame), frame_timeout).await;
            }
        }
    }
}

impl NodeConnection {
    /// Take ownership of `transport` and start the reader and writer tasks.
    ///
    /// The returned receiver yields exchanges started by the peer; it stays empty for
    /// `Role::Relay`.
    pub fn spawn(
        node_id: impl Into<String>,
        transport: Transport,
        settings: TunnelSettings,
        role: Role,
    ) -> (NodeConnection, mpsc::Receiver<IncomingExchange>) {
        let node_id = node_id.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.write_queue_depth.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(settings.exchange_queue_depth.max(1));
        let incoming_tx = match role {
            Role::Node => Some(incoming_tx),
            Role::Relay => None,
        };

        let table = CorrelationTable::new(settings.exchange_queue_depth);
        let cancel = CancellationToken::new();
        let span = info_span!("tunnel", node_id = %node_id, role = ?role);
        let Transport { stream, sink } = transport;

        let writer = tokio::spawn(
            {
                let table = table.clone();
                let cancel = cancel.clone();
                let frame_timeout = settings.frame_timeout;

                async move {
                    let written = write_loop(sink, outbound_rx, cancel.clone(), frame_timeout);
                    if let Err(e) = written.await {
                        warn!("tunnel write failed: {}", e);
                    }
                    teardown(&cancel, &table);
                }
            }
            .instrument(span.clone()),
        );

        let reader = tokio::spawn(
            {
                let table = table.clone();
                let cancel = cancel.clone();
                let frame_timeout = settings.frame_timeout;

                async move {
                    if let Err(e) =
                        read_loop(stream, table.clone(), incoming_tx, cancel.clone(), frame_timeout)
                            .await
                    {
                        warn!("tunnel read failed: {}", e);
                    }
                    teardown(&cancel, &table);
                }
            }
            .instrument(span),
        );

        let conn = NodeConnection {
            inner: Arc::new(Inner {
                node_id,
                outbound: outbound_tx,
                table,
                cancel,
                settings,
                tasks: Mutex::new(vec![writer, reader]),
            }),
        };

        (conn, incoming_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    pub fn register(&self, request_id: RequestId) -> Result<Exchange, Error> {
        self.inner.table.register(request_id)
    }

    /// Queue a frame for the writer task.
    pub async fn send(&self, request_id: RequestId, frame: Frame) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::NodeDisconnected);
        }

        let wire = WireFrame::new(request_id, frame);
        match timeout(self.inner.settings.frame_timeout, self.inner.outbound.send(wire)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NodeDisconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub fn pending_exchanges(&self) -> usize {
        self.inner.table.len()
    }

    pub fn close(&self) {
        teardown(&self.inner.cancel, &self.inner.table);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the connection is dead.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Run `task` for as long as the connection lives. `shutdown` waits for it, so the
    /// task has to finish once the connection is cancelled.
    pub fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Close and wait for the connection tasks and every task started with `spawn_task`.
    pub async fn shutdown(&self) {
        self.close();
        loop {
            let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    pub fn same_connection(&self, other: &NodeConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
