//! Broadcast of server-initiated notifications.
//!
//! Every subscriber gets its own unbounded queue, so a slow reader never
//! blocks the read loop or other subscribers. Subscribers only see
//! notifications published after they subscribed.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::PushNotification;

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<PushNotification>>,
    closed: bool,
}

/// Multi-subscriber push broadcaster.
#[derive(Default)]
pub struct PushChannel {
    inner: Mutex<Subscribers>,
}

impl PushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    ///
    /// Subscribing to a closed channel yields an iterator that is already
    /// finished.
    pub fn subscribe(&self) -> PushIterator {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.senders.push(tx);
        }
        PushIterator { rx }
    }

    /// Deliver a notification to every live subscriber, in arrival order.
    ///
    /// Returns the number of subscribers reached. Dropped iterators are pruned.
    pub fn publish(&self, notification: PushNotification) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }
        inner
            .senders
            .retain(|tx| tx.send(notification.clone()).is_ok());
        inner.senders.len()
    }

    /// End every iterator and refuse further subscriptions until reopened.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.senders.clear();
    }

    /// Accept subscribers again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

/// Ordered cursor over notifications for one subscriber.
///
/// Ends when the connection is closed.
pub struct PushIterator {
    rx: mpsc::UnboundedReceiver<PushNotification>,
}

impl PushIterator {
    /// Wait for the next notification; `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<PushNotification> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_next(&mut self) -> Option<PushNotification> {
        self.rx.try_recv().ok()
    }
}
