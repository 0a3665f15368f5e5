use super::WatchNotification;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub struct Subscription {
    pub id: String,
    sender: mpsc::UnboundedSender<WatchNotification>,
}

impl Subscription {
    #[must_use]
    pub fn new() -> (Self, WatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();

        (
            Self {
                id: id.clone(),
                sender: tx,
            },
            WatchReceiver { id, receiver: rx },
        )
    }
}

/// Receiving half handed to a subscriber
#[derive(Debug)]
pub struct WatchReceiver {
    id: String,
    receiver: mpsc::UnboundedReceiver<WatchNotification>,
}

impl WatchReceiver {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification; `None` once the watch is closed and drained
    pub async fn recv(&mut self) -> Option<WatchNotification> {
        self.receiver.recv().await
    }

    /// Next resource event, skipping lifecycle signals
    pub async fn next_event(&mut self) -> Option<super::WatchEvent> {
        loop {
            match self.recv().await? {
                WatchNotification::Event(event) => return Some(event),
                WatchNotification::Reconnect => {}
                WatchNotification::Closed => return None,
            }
        }
    }

    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<WatchNotification> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

impl Stream for WatchReceiver {
    type Item = WatchNotification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

#[derive(Default)]
struct Subscribers {
    entries: Vec<Subscription>,
    closed: bool,
}

/// Fan-out of watch notifications.
///
/// The closed flag lives under the same lock as the subscriber list, so once
/// `close` returns nothing can be delivered any more.
#[derive(Default)]
pub struct SubscriptionManager {
    subscribers: Mutex<Subscribers>,
    first: Notify,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> WatchReceiver {
        let (subscription, receiver) = Subscription::new();

        let mut subs = self.lock();
        if subs.closed {
            // Late subscribers see the watch already closed
            let _ = subscription.sender.send(WatchNotification::Closed);
            return receiver;
        }
        let first = subs.entries.is_empty();
        subs.entries.push(subscription);
        drop(subs);

        if first {
            self.first.notify_one();
        }
        receiver
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.lock().entries.retain(|s| s.id != subscription_id);
    }

    /// Deliver to every live subscriber, dropping those whose receiver is gone.
    /// Returns the number of subscribers reached.
    pub fn notify(&self, notification: &WatchNotification) -> usize {
        let mut subs = self.lock();
        if subs.closed {
            return 0;
        }
        subs.entries
            .retain(|s| s.sender.send(notification.clone()).is_ok());
        subs.entries.len()
    }

    /// Send `Closed` to everyone and detach them. Only the first call does anything.
    pub fn close(&self) -> bool {
        let mut subs = self.lock();
        if subs.closed {
            return false;
        }
        subs.closed = true;
        for subscription in subs.entries.drain(..) {
            let _ = subscription.sender.send(WatchNotification::Closed);
        }
        drop(subs);

        // Wake a task still waiting for its first subscriber
        self.first.notify_one();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.lock().entries.len()
    }

    /// Resolves once at least one subscriber is attached or the set is closed
    pub async fn first_subscriber(&self) {
        loop {
            let notified = self.first.notified();
            {
                let subs = self.lock();
                if subs.closed || !subs.entries.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}
