//! Live progress channel.
//!
//! Single writer, any number of subscribers. Each subscriber gets every
//! event published after it subscribed, in publish order; there is no
//! replay for late subscribers. Publishing never waits on a subscriber: a
//! subscriber that falls more than `capacity` events behind loses the
//! oldest events from its own queue, nobody else's.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use speedtest_common::protocol::ProgressEvent;

/// Owned, cloneable handle to one progress channel.
///
/// Clones share the same channel. The channel stays open for as long as any
/// handle is alive; it never closes subscriptions on its own.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<ProgressEvent>,
    next_id: AtomicU64,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscriber = id, "progress subscriber attached");
        Subscription {
            id,
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Detach a subscriber. Dropping the handle has the same effect.
    pub fn unsubscribe(&self, subscription: Subscription) {
        tracing::debug!(subscriber = subscription.id, "progress subscriber detached");
        drop(subscription);
    }

    /// Push an event to every current subscriber. Returns how many
    /// subscribers it was queued for; zero subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        self.inner.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

/// One subscriber's view of the channel.
pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Events lost to lag are skipped. `None` only
    /// once every channel handle is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(subscriber = self.id, dropped = n, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    tracing::warn!(subscriber = self.id, dropped = n, "progress subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}
