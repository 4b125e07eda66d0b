//! Request id to awaiting channel map, shared by both tunnel peers.
use crate::codec::RequestId;
use crate::error::Error;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TableInner<T> {
    pending: HashMap<RequestId, mpsc::Sender<T>>,
    closed: bool,
}

pub struct CorrelationTable<T> {
    inner: Mutex<TableInner<T>>,
    queue_depth: usize,
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        Arc::new(CorrelationTable {
            inner: Mutex::new(TableInner {
                pending: HashMap::new(),
                closed: false,
            }),
            queue_depth: queue_depth.max(1),
        })
    }

    /// Start awaiting items for `id`.
    ///
    /// Fails with `NodeDisconnected` once the table has been closed.
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<PendingExchange<T>, Error> {
        let (tx, rx) = mpsc::channel(self.queue_depth);

        let mut locked = self.inner.lock();
        if locked.closed {
            return Err(Error::NodeDisconnected);
        }
        if locked.pending.contains_key(&id) {
            return Err(Error::malformed(format!("duplicate request id {}", id)));
        }
        locked.pending.insert(id, tx);

        Ok(PendingExchange {
            id,
            rx,
            table: self.clone(),
        })
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().pending.contains_key(id)
    }

    /// Hand `item` to the exchange awaiting `id`.
    ///
    /// Unknown ids are dropped. An exchange that does not accept the item within
    /// `limit` is aborted, so one stalled consumer cannot block the whole connection.
    pub async fn deliver(&self, id: RequestId, item: T, limit: Duration) -> bool {
        let maybe_tx = self.inner.lock().pending.get(&id).cloned();

        let tx = match maybe_tx {
            Some(tx) => tx,
            None => {
                debug!("drop item for unknown exchange {}", id);
                return false;
            }
        };

        match timeout(limit, tx.send(item)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!("exchange {} is gone, drop item", id);
                self.remove(&id);
                false
            }
            Err(_) => {
                warn!("exchange {} did not consume in time, abort it", id);
                self.remove(&id);
                false
            }
        }
    }

    /// Deliver a final item without waiting and stop tracking `id`.
    pub fn abort(&self, id: &RequestId, item: T) {
        if let Some(tx) = self.inner.lock().pending.remove(id) {
            let _ = tx.try_send(item);
        }
    }

    /// Idempotent.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.inner.lock().pending.remove(id).is_some()
    }

    /// Close the table: every awaiting exchange observes `NodeDisconnected` and no new
    /// exchange can be registered. Returns the number of exchanges failed.
    pub fn close(&self) -> usize {
        let mut locked = self.inner.lock();
        locked.closed = true;
        let failed = locked.pending.len();
        locked.pending.clear();
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving side of one registered exchange. Deregisters itself when dropped.
pub struct PendingExchange<T: Send + 'static> {
    id: RequestId,
    rx: mpsc::Receiver<T>,
    table: Arc<CorrelationTable<T>>,
}

impl<T: Send + 'static> PendingExchange<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn recv(&mut self, limit: Duration) -> Result<T, Error> {
        timeout(limit, self.recv_unbounded()).await?
    }

    /// Wait without a deadline. Callers must tie this to a cancellation signal.
    pub async fn recv_unbounded(&mut self) -> Result<T, Error> {
        match self.rx.recv().await {
            Some(item) => Ok(item),
            None if self.table.is_closed() => Err(Error::NodeDisconnected),
            None => Err(Error::Aborted),
        }
    }
}

impl<T: Send + 'static> Drop for PendingExchange<T> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
