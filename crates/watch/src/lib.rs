//! Tether watch: turns a disconnect-prone subscription into one ordered,
//! reconnect-safe sequence of changes.
//!
//! Delivery is at-least-once. The cursor is advanced to an event's version
//! before that event is handed out, so a reconnect resumes after the last
//! delivered event; servers may still replay at the boundary and consumers
//! must tolerate duplicates.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use metrics::counter;
use tether_core::{Backoff, Change, ChangeKind, ResourceVersion, WatchEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Raw events of one subscription.
pub type EventStream<T> = BoxStream<'static, Result<WatchEvent<T>, WatchError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The subscription could not be opened. The client stays disconnected
    /// and retries from the same cursor on the next call.
    #[error("opening watch from {from:?}: {message}")]
    Open { from: Option<ResourceVersion>, message: String },
    /// The server dropped history for `cursor`; events may have been missed.
    /// The client resumes "from now" afterwards.
    #[error("watch cursor {cursor:?} expired: {message}")]
    Expired { cursor: Option<ResourceVersion>, message: String },
    #[error("watch transport: {0}")]
    Transport(String),
}

/// Capability to open a subscription at a cursor (`None` = from now).
#[async_trait::async_trait]
pub trait Subscription<T>: Send {
    async fn open(&mut self, from: Option<ResourceVersion>) -> Result<EventStream<T>, WatchError>;
}

/// Adapts an async closure into a [`Subscription`].
pub struct FnSubscription<F>(pub F);

#[async_trait::async_trait]
impl<T, F, Fut> Subscription<T> for FnSubscription<F>
where
    T: 'static,
    F: FnMut(Option<ResourceVersion>) -> Fut + Send,
    Fut: Future<Output = Result<EventStream<T>, WatchError>> + Send,
{
    async fn open(&mut self, from: Option<ResourceVersion>) -> Result<EventStream<T>, WatchError> {
        (self.0)(from).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disconnected,
    Connecting,
    Streaming,
    Closed,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Capacity of the spawned handle's channel. A full channel pauses the
    /// subscription until the consumer catches up.
    pub buffer: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { buffer: 1024, backoff_initial: Duration::from_millis(200), backoff_max: Duration::from_secs(30) }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let buffer = std::env::var("TETHER_WATCH_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.buffer);
        let backoff_max = std::env::var("TETHER_WATCH_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.backoff_max);
        Self { buffer, backoff_max, ..d }
    }

    fn backoff(&self) -> Backoff { Backoff::new(self.backoff_initial, self.backoff_max) }
}

/// Pull-based resilient watch. Drive it with [`ResilientWatch::next`], or hand
/// it to a task with [`ResilientWatch::spawn`].
pub struct ResilientWatch<T, S> {
    source: S,
    cursor: Option<ResourceVersion>,
    state: WatchState,
    stream: Option<EventStream<T>>,
    // Delays reopening after sessions that produced nothing.
    idle: Backoff,
    idle_reopen: bool,
    progressed: bool,
    opens: u64,
}

impl<T, S: Subscription<T>> ResilientWatch<T, S> {
    pub fn new(from: Option<ResourceVersion>, source: S) -> Self {
        Self {
            source,
            cursor: from,
            state: WatchState::Disconnected,
            stream: None,
            idle: WatchConfig::default().backoff(),
            idle_reopen: false,
            progressed: false,
            opens: 0,
        }
    }

    pub fn with_backoff(mut self, idle: Backoff) -> Self {
        self.idle = idle;
        self
    }

    pub fn state(&self) -> WatchState { self.state }

    pub fn cursor(&self) -> Option<&ResourceVersion> { self.cursor.as_ref() }

    /// Next domain change, reconnecting transparently as needed.
    ///
    /// `Ok(None)` only after [`close`](Self::close). Errors leave the client
    /// disconnected; calling again resumes.
    pub async fn next(&mut self) -> Result<Option<Change<T>>, WatchError> {
        loop {
            match self.state {
                WatchState::Closed => return Ok(None),
                WatchState::Disconnected | WatchState::Connecting => self.connect().await?,
                WatchState::Streaming => {
                    let item = match self.stream.as_mut() {
                        Some(s) => s.next().await,
                        None => None,
                    };
                    match item {
                        Some(Ok(ev)) => {
                            if let Some(change) = self.observe(ev)? {
                                return Ok(Some(change));
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, cursor = ?self.cursor, "watch stream failed; resuming");
                            self.disconnect();
                        }
                        None => {
                            debug!(cursor = ?self.cursor, "watch stream ended; resuming");
                            self.disconnect();
                        }
                    }
                }
            }
        }
    }

    /// Enter the terminal state; no further reconnects happen.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = WatchState::Closed;
    }

    async fn connect(&mut self) -> Result<(), WatchError> {
        if self.idle_reopen {
            let delay = self.idle.next_delay();
            if !delay.is_zero() {
                debug!(delay_ms = %delay.as_millis(), "previous watch session was idle; delaying reopen");
                tokio::time::sleep(delay).await;
            }
            self.idle_reopen = false;
        }
        self.state = WatchState::Connecting;
        let from = self.cursor.clone();
        match self.source.open(from.clone()).await {
            Ok(stream) => {
                if self.opens > 0 {
                    counter!("watch_reconnects_total", 1u64);
                }
                self.opens += 1;
                self.stream = Some(stream);
                self.progressed = false;
                self.state = WatchState::Streaming;
                info!(from = ?from, opens = self.opens, "watch subscription open");
                Ok(())
            }
            Err(e) => {
                counter!("watch_open_errors_total", 1u64);
                warn!(error = %e, from = ?from, "watch open failed");
                self.state = WatchState::Disconnected;
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
        if self.state != WatchState::Closed {
            self.state = WatchState::Disconnected;
        }
        if !self.progressed {
            self.idle_reopen = true;
        }
    }

    fn advance(&mut self, version: &ResourceVersion) {
        if !version.is_empty() {
            self.cursor = Some(version.clone());
        }
        self.progressed = true;
        self.idle.reset();
    }

    fn deliver(&mut self, kind: ChangeKind, version: ResourceVersion, object: T) -> Change<T> {
        self.advance(&version);
        counter!("watch_events_total", 1u64);
        Change { kind, version, object }
    }

    fn observe(&mut self, ev: WatchEvent<T>) -> Result<Option<Change<T>>, WatchError> {
        match ev {
            WatchEvent::Added { version, object } => Ok(Some(self.deliver(ChangeKind::Added, version, object))),
            WatchEvent::Modified { version, object } => Ok(Some(self.deliver(ChangeKind::Modified, version, object))),
            WatchEvent::Deleted { version, object } => Ok(Some(self.deliver(ChangeKind::Deleted, version, object))),
            WatchEvent::Bookmark { version } => {
                debug!(version = %version, "watch bookmark");
                self.advance(&version);
                Ok(None)
            }
            WatchEvent::Error(fault) => {
                self.disconnect();
                if fault.is_expired() {
                    let cursor = self.cursor.take();
                    counter!("watch_expired_total", 1u64);
                    warn!(cursor = ?cursor, message = %fault.message, "watch cursor expired");
                    return Err(WatchError::Expired { cursor, message: fault.message });
                }
                warn!(code = ?fault.code, message = %fault.message, cursor = ?self.cursor, "watch error event; resuming");
                Ok(None)
            }
        }
    }
}

impl<T, S> ResilientWatch<T, S>
where
    T: Send + 'static,
    S: Subscription<T> + 'static,
{
    /// Run the watch on a tokio task feeding a bounded channel.
    ///
    /// Errors are forwarded in-band; after an error the task waits with
    /// exponential backoff before resuming. Dropping or closing the handle
    /// stops the task.
    pub fn spawn(mut self, cfg: &WatchConfig) -> WatchHandle<T> {
        let (tx, rx) = mpsc::channel(cfg.buffer.max(1));
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let mut retry = cfg.backoff();
        let task = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = &mut cancel_rx => break,
                    item = self.next() => item,
                };
                let failed = item.is_err();
                let msg = match item {
                    Ok(Some(change)) => Ok(change),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    sent = tx.send(msg) => if sent.is_err() { break },
                }
                if failed {
                    let delay = retry.next_delay();
                    tokio::select! {
                        _ = &mut cancel_rx => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    retry.reset();
                }
            }
            self.close();
            debug!(cursor = ?self.cursor, "watch task stopped");
        });
        WatchHandle { rx, cancel: Some(cancel_tx), task }
    }
}

/// Consumer side of a spawned [`ResilientWatch`].
pub struct WatchHandle<T> {
    pub rx: mpsc::Receiver<Result<Change<T>, WatchError>>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl<T> WatchHandle<T> {
    pub async fn recv(&mut self) -> Option<Result<Change<T>, WatchError>> { self.rx.recv().await }

    /// Stop the watch and wait for its task to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
