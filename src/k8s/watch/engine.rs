/**
 * Watch reconnect loop
 *
 * Drives one subscription: waits for the first subscriber, opens the
 * long-poll stream, frames it into NDJSON events, and reconnects with the
 * advancing cursor until cancelled.
 */
use super::config::{MAX_FRAME_BYTES, RESYNC_CURSOR, WatchConfig};
use super::subscription::SubscriptionManager;
use super::{WatchEvent, WatchNotification, WatchState, WatchStats};
use crate::error::{Error, Result};
use crate::k8s::client::Query;
use crate::k8s::transport::{ApiRequest, ByteStream, Method, Transport};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One line of the watch body
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

pub(super) struct WatchEngine {
    transport: Arc<dyn Transport>,
    path: String,
    query: Query,
    config: WatchConfig,
    subscribers: Arc<SubscriptionManager>,
    cancel: CancellationToken,
    stats: Arc<RwLock<WatchStats>>,
    state: watch::Sender<WatchState>,
    cursor: watch::Sender<String>,
}

impl WatchEngine {
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        path: String,
        mut query: Query,
        config: WatchConfig,
        subscribers: Arc<SubscriptionManager>,
        cancel: CancellationToken,
        stats: Arc<RwLock<WatchStats>>,
    ) -> (Self, watch::Receiver<WatchState>, watch::Receiver<String>) {
        let initial = query
            .remove("resourceVersion")
            .unwrap_or_else(|| RESYNC_CURSOR.to_string());
        if query.get("timeoutSeconds").is_none() {
            query.insert("timeoutSeconds", config.timeout_seconds);
        }

        let (state, state_rx) = watch::channel(WatchState::Connecting);
        let (cursor, cursor_rx) = watch::channel(initial);

        let engine = Self {
            transport,
            path,
            query,
            config,
            subscribers,
            cancel,
            stats,
            state,
            cursor,
        };
        (engine, state_rx, cursor_rx)
    }

    pub(super) async fn run(self) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.state.send_replace(WatchState::Closed);
                return;
            }
            () = self.subscribers.first_subscriber() => {}
        }

        info!("🔍 Starting watch on {}", self.path);
        let mut backoff = self.config.initial_backoff();

        while !self.cancel.is_cancelled() {
            self.state.send_replace(WatchState::Connecting);
            let request = self.request();
            debug!("Connecting watch {} at resourceVersion {}", self.path, self.current_cursor());

            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                opened = self.transport.stream(request) => opened,
            };

            match opened {
                Ok(body) => {
                    self.record(|stats| stats.connections += 1);
                    self.state.send_replace(WatchState::Streaming);

                    let mut framed = false;
                    match self.pump(body, &mut framed).await {
                        Ok(()) => debug!("🔍 Watch stream {} ended", self.path),
                        Err(e) => warn!("Watch stream {} failed: {}", self.path, e),
                    }
                    // A server that accepts and hangs up at once keeps backing off
                    if framed {
                        backoff = self.config.initial_backoff();
                    }
                }
                Err(e) if e.is_gone() => {
                    warn!("Watch {} history expired, resyncing: {}", self.path, e);
                    self.resync();
                }
                Err(e) => warn!("❌ Watch on {} could not connect: {}", self.path, e),
            }

            if self.cancel.is_cancelled() {
                break;
            }

            self.state.send_replace(WatchState::Reconnecting);
            self.record(|stats| stats.reconnects += 1);
            self.subscribers.notify(&WatchNotification::Reconnect);
            debug!(
                "Reconnecting watch {} in {}ms",
                self.path,
                backoff.as_millis()
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = sleep(backoff) => {}
            }
            backoff = self.config.next_backoff(backoff);
        }

        self.state.send_replace(WatchState::Closed);
        info!("🛑 Watch on {} closed", self.path);
    }

    fn request(&self) -> ApiRequest {
        let query = self
            .query
            .clone()
            .param("resourceVersion", self.current_cursor());
        ApiRequest::new(Method::Get, self.path.clone()).query(query)
    }

    fn current_cursor(&self) -> String {
        self.cursor.borrow().clone()
    }

    fn record(&self, update: impl FnOnce(&mut WatchStats)) {
        update(&mut self.stats.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn resync(&self) {
        self.cursor.send_replace(RESYNC_CURSOR.to_string());
        self.record(|stats| stats.resyncs += 1);
    }

    /// Read frames until the body ends, a frame is malformed, or the watch is cancelled
    async fn pump(&self, body: ByteStream, framed: &mut bool) -> Result<()> {
        let mut frames = FramedRead::new(
            StreamReader::new(body),
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        );

        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                frame = frames.next() => frame,
            };

            match frame {
                None => return Ok(()),
                Some(Ok(line)) => {
                    *framed = true;
                    self.handle_frame(&line)?;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(Error::MalformedStream(format!(
                        "frame longer than {MAX_FRAME_BYTES} bytes"
                    )));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(Error::Io(e)),
            }
        }
    }

    fn handle_frame(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let frame: Frame =
            serde_json::from_str(line).map_err(|e| Error::MalformedStream(e.to_string()))?;

        match frame.kind.as_str() {
            "ERROR" => {
                warn!(
                    "Watch {} reported an error, resyncing: {}",
                    self.path, frame.object
                );
                self.resync();
            }
            "BOOKMARK" => {
                if let Some(marker) = super::resource_version(&frame.object) {
                    self.advance_cursor(marker);
                }
            }
            kind => {
                let Some(event) = WatchEvent::from_wire(kind, frame.object) else {
                    debug!("Skipping watch frame of type {}", kind);
                    return Ok(());
                };
                let marker = event.resource_version().map(str::to_string);
                if self.subscribers.notify(&WatchNotification::Event(event)) > 0 {
                    self.record(|stats| stats.events += 1);
                }
                if let Some(marker) = marker {
                    self.advance_cursor(&marker);
                }
            }
        }
        Ok(())
    }

    /// Move the cursor forward. Numeric markers never go backwards; opaque
    /// ones are taken as they come.
    fn advance_cursor(&self, marker: &str) {
        self.cursor.send_if_modified(|current| {
            let newer = match (current.parse::<u64>(), marker.parse::<u64>()) {
                (Ok(old), Ok(new)) => new > old,
                _ => current != marker,
            };
            if newer {
                marker.clone_into(current);
            }
            newer
        });
    }
}
