use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::chunk::{CorrelationToken, StreamChunk};

type ChunkHandler = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

struct Listener {
    id: u64,
    handler: ChunkHandler,
}

struct RelayInner {
    listeners: ArcSwap<Vec<Arc<Listener>>>,
    next_listener_id: AtomicU64,
}

impl Default for RelayInner {
    fn default() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }
}

impl RelayInner {
    fn register(&self, handler: ChunkHandler) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Listener { id, handler });
        self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
        id
    }

    fn remove(&self, id: u64) {
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|listener| listener.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Fan-out transport for [`StreamChunk`]s.
///
/// Publishing dispatches synchronously to the listeners registered at publish
/// time. There is no history: a listener only sees chunks published after it
/// subscribed. Per token, every listener observes chunks in publish order.
#[derive(Clone, Default)]
pub struct ChunkRelay {
    inner: Arc<RelayInner>,
}

impl ChunkRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, chunk: StreamChunk) {
        let snapshot = self.inner.listeners.load();
        for listener in snapshot.iter() {
            (listener.handler)(&chunk);
        }
    }

    /// Registers a handler for every chunk. It stays registered until the
    /// returned subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StreamChunk) + Send + Sync + 'static,
    {
        let id = self.inner.register(Arc::new(handler));
        Subscription {
            relay: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    /// Receives only `token`'s chunks and closes after its terminal chunk.
    pub fn subscribe_token(&self, token: CorrelationToken) -> ChunkReceiver {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let chunk_tx = Mutex::new(Some(chunk_tx));
        let relay = Arc::downgrade(&self.inner);
        let listener_id = Arc::new(AtomicU64::new(u64::MAX));
        let handler_listener_id = listener_id.clone();

        let subscription = self.subscribe(move |chunk| {
            if chunk.correlation_token != token {
                return;
            }

            let Ok(mut slot) = chunk_tx.lock() else {
                return;
            };
            let Some(sender) = slot.as_ref() else {
                return;
            };
            let _ = sender.send(chunk.clone());

            if chunk.is_terminal() {
                slot.take();
                if let Some(relay) = relay.upgrade() {
                    relay.remove(handler_listener_id.load(Ordering::Acquire));
                }
            }
        });
        listener_id.store(subscription.id, Ordering::Release);

        ChunkReceiver {
            chunks: chunk_rx,
            _subscription: subscription,
        }
    }

    /// Receives every chunk until the receiver is dropped.
    pub fn subscribe_channel(&self) -> ChunkReceiver {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |chunk| {
            let _ = chunk_tx.send(chunk.clone());
        });

        ChunkReceiver {
            chunks: chunk_rx,
            _subscription: subscription,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.load().len()
    }
}

/// Registration handle returned by [`ChunkRelay::subscribe`].
#[must_use = "dropping a subscription unregisters its handler"]
pub struct Subscription {
    relay: Weak<RelayInner>,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(relay) = self.relay.upgrade() {
            relay.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Channel-backed subscription for async consumers.
pub struct ChunkReceiver {
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    _subscription: Subscription,
}

impl ChunkReceiver {
    /// Next chunk, or `None` once a token-scoped receiver has seen its
    /// terminal chunk.
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamChunk> {
        self.chunks.try_recv().ok()
    }
}
