/**
 * Resumable watch subscriptions
 *
 * A `Watch` owns one long-poll connection at a time. The engine task behind
 * it reconnects whenever the stream ends and resumes from the last
 * `resourceVersion` it delivered, until `unsubscribe` is called.
 */
pub mod config;
mod engine;
pub mod subscription;

pub use config::WatchConfig;
pub use subscription::{SubscriptionManager, WatchReceiver};

use super::client::Query;
use super::transport::Transport;
use engine::WatchEngine;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A change to a watched resource
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
}

impl WatchEvent {
    /// Build from a wire `type`; `None` for ERROR, BOOKMARK and unknown types
    #[must_use]
    pub fn from_wire(kind: &str, object: Value) -> Option<Self> {
        match kind {
            "ADDED" => Some(Self::Added(object)),
            "MODIFIED" => Some(Self::Modified(object)),
            "DELETED" => Some(Self::Deleted(object)),
            _ => None,
        }
    }

    /// Lower-cased event type: `added`, `modified` or `deleted`
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }

    #[must_use]
    pub const fn object(&self) -> &Value {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    #[must_use]
    pub fn into_object(self) -> Value {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    /// `metadata.resourceVersion` of the carried object
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        resource_version(self.object())
    }
}

pub(crate) fn resource_version(object: &Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|metadata| metadata.get("resourceVersion"))
        .and_then(Value::as_str)
}

/// What subscribers receive: resource events plus lifecycle signals
#[derive(Debug, Clone, PartialEq)]
pub enum WatchNotification {
    Event(WatchEvent),
    /// The stream ended and a new connection is about to be opened
    Reconnect,
    /// Final notification after `unsubscribe`
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Connections that reached the streaming state
    pub connections: u64,
    pub reconnects: u64,
    /// Events delivered to subscribers
    pub events: u64,
    /// ERROR frames that reset the cursor
    pub resyncs: u64,
}

/// Handle to one resumable subscription.
///
/// Dropping the handle unsubscribes.
pub struct Watch {
    path: String,
    subscribers: Arc<SubscriptionManager>,
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    cursor: watch::Receiver<String>,
    stats: Arc<RwLock<WatchStats>>,
}

impl Watch {
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        path: String,
        query: Query,
        config: WatchConfig,
    ) -> Self {
        let subscribers = Arc::new(SubscriptionManager::new());
        let cancel = CancellationToken::new();
        let stats = Arc::new(RwLock::new(WatchStats::default()));

        let (engine, state, cursor) = WatchEngine::new(
            transport,
            path.clone(),
            query,
            config,
            subscribers.clone(),
            cancel.clone(),
            stats.clone(),
        );
        tokio::spawn(engine.run());

        Self {
            path,
            subscribers,
            cancel,
            state,
            cursor,
            stats,
        }
    }

    /// Attach a subscriber. The first one opens the connection.
    #[must_use]
    pub fn subscribe(&self) -> WatchReceiver {
        self.subscribers.subscribe()
    }

    /// Detach every subscriber and tear the connection down.
    ///
    /// Safe to call repeatedly and from any task; after it returns no event
    /// or reconnect signal is delivered.
    pub fn unsubscribe(&self) {
        if self.subscribers.close() {
            info!("🛑 Unsubscribed watch on {}", self.path);
        }
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscribers.is_closed()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Last `resourceVersion` the engine will resume from
    #[must_use]
    pub fn cursor(&self) -> String {
        self.cursor.borrow().clone()
    }

    #[must_use]
    pub fn stats(&self) -> WatchStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the engine reaches `target`. Returns false if the watch
    /// closed first.
    pub async fn wait_for(&self, target: WatchState) -> bool {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target || *current == WatchState::Closed)
            .await
            .is_ok_and(|current| *current == target)
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
