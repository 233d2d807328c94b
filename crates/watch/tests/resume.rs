#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tether_core::{Backoff, ChangeKind, ResourceVersion, WatchEvent, WatchFault};
use tether_watch::{EventStream, ResilientWatch, Subscription, WatchConfig, WatchError, WatchState};

type Session = Result<Vec<Result<WatchEvent<String>, WatchError>>, WatchError>;

/// Replays scripted sessions, one per `open`; once exhausted it hands out a
/// stream that never yields.
#[derive(Clone)]
struct Scripted {
    sessions: Arc<Mutex<VecDeque<Session>>>,
    opened_from: Arc<Mutex<Vec<Option<String>>>>,
}

impl Scripted {
    fn new(sessions: Vec<Session>) -> Self {
        Self { sessions: Arc::new(Mutex::new(sessions.into())), opened_from: Arc::new(Mutex::new(Vec::new())) }
    }

    fn opened_from(&self) -> Vec<Option<String>> { self.opened_from.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Subscription<String> for Scripted {
    async fn open(&mut self, from: Option<ResourceVersion>) -> Result<EventStream<String>, WatchError> {
        self.opened_from.lock().unwrap().push(from.map(|v| v.as_str().to_string()));
        match self.sessions.lock().unwrap().pop_front() {
            Some(Ok(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

fn added(rv: &str, obj: &str) -> Result<WatchEvent<String>, WatchError> {
    Ok(WatchEvent::Added { version: rv.into(), object: obj.to_string() })
}

fn modified(rv: &str, obj: &str) -> Result<WatchEvent<String>, WatchError> {
    Ok(WatchEvent::Modified { version: rv.into(), object: obj.to_string() })
}

fn deleted(rv: &str, obj: &str) -> Result<WatchEvent<String>, WatchError> {
    Ok(WatchEvent::Deleted { version: rv.into(), object: obj.to_string() })
}

fn fault(code: u16) -> Result<WatchEvent<String>, WatchError> {
    Ok(WatchEvent::Error(WatchFault { code: Some(code), message: format!("status {code}") }))
}

fn fast() -> Backoff { Backoff::new(Duration::ZERO, Duration::ZERO) }

#[tokio::test]
async fn resumes_from_last_delivered_cursor_without_gaps() {
    let src = Scripted::new(vec![
        Ok(vec![added("1", "a"), modified("2", "a"), Err(WatchError::Transport("connection reset".into()))]),
        // server replays the boundary event once
        Ok(vec![modified("2", "a"), added("3", "b"), deleted("4", "a")]),
    ]);
    let mut w = ResilientWatch::new(None, src.clone()).with_backoff(fast());
    let mut seen = Vec::new();
    for _ in 0..5 {
        let c = w.next().await.unwrap().unwrap();
        seen.push((c.kind, c.version.as_str().to_string()));
    }
    assert_eq!(src.opened_from(), [None, Some("2".to_string())]);
    let versions: Vec<_> = seen.iter().map(|(_, v)| v.as_str()).collect();
    assert_eq!(versions, ["1", "2", "2", "3", "4"]);
    assert_eq!(seen[4].0, ChangeKind::Deleted);
    assert_eq!(w.cursor().map(|v| v.as_str()), Some("4"));
}

#[tokio::test]
async fn bookmark_moves_cursor_without_delivery() {
    let src = Scripted::new(vec![
        Ok(vec![Ok(WatchEvent::Bookmark { version: "5".into() })]),
        Ok(vec![added("6", "c")]),
    ]);
    let mut w = ResilientWatch::new(Some("3".into()), src.clone()).with_backoff(fast());
    let c = w.next().await.unwrap().unwrap();
    assert_eq!(c.version.as_str(), "6");
    assert_eq!(c.object, "c");
    assert_eq!(src.opened_from(), [Some("3".to_string()), Some("5".to_string())]);
}

#[tokio::test]
async fn error_event_reconnects_transparently() {
    let src = Scripted::new(vec![Ok(vec![added("1", "a"), fault(500)]), Ok(vec![added("2", "b")])]);
    let mut w = ResilientWatch::new(None, src.clone()).with_backoff(fast());
    assert_eq!(w.next().await.unwrap().unwrap().object, "a");
    assert_eq!(w.next().await.unwrap().unwrap().object, "b");
    assert_eq!(src.opened_from(), [None, Some("1".to_string())]);
    assert_eq!(w.state(), WatchState::Streaming);
}

#[tokio::test]
async fn expired_cursor_is_surfaced_and_resets_to_now() {
    let src = Scripted::new(vec![Ok(vec![added("7", "a"), fault(410)]), Ok(vec![added("20", "z")])]);
    let mut w = ResilientWatch::new(None, src.clone()).with_backoff(fast());
    assert_eq!(w.next().await.unwrap().unwrap().version.as_str(), "7");
    match w.next().await {
        Err(WatchError::Expired { cursor, .. }) => assert_eq!(cursor.map(|v| v.as_str().to_string()), Some("7".to_string())),
        other => panic!("expected expiry, got {other:?}"),
    }
    assert!(w.cursor().is_none());
    assert_eq!(w.state(), WatchState::Disconnected);
    assert_eq!(w.next().await.unwrap().unwrap().version.as_str(), "20");
    assert_eq!(src.opened_from(), [None, None]);
}

#[tokio::test]
async fn open_failure_is_reported_then_retried_from_same_cursor() {
    let src = Scripted::new(vec![
        Err(WatchError::Open { from: Some("9".into()), message: "connection refused".into() }),
        Ok(vec![added("10", "a")]),
    ]);
    let mut w = ResilientWatch::new(Some("9".into()), src.clone()).with_backoff(fast());
    assert!(matches!(w.next().await, Err(WatchError::Open { .. })));
    assert_eq!(w.state(), WatchState::Disconnected);
    assert_eq!(w.next().await.unwrap().unwrap().version.as_str(), "10");
    assert_eq!(src.opened_from(), [Some("9".to_string()), Some("9".to_string())]);
}

#[tokio::test]
async fn closed_watch_never_reconnects() {
    let src = Scripted::new(vec![Ok(vec![added("1", "a")]), Ok(vec![added("2", "b")])]);
    let mut w = ResilientWatch::new(None, src.clone()).with_backoff(fast());
    assert!(w.next().await.unwrap().is_some());
    w.close();
    assert_eq!(w.state(), WatchState::Closed);
    assert!(w.next().await.unwrap().is_none());
    assert!(w.next().await.unwrap().is_none());
    assert_eq!(src.opened_from().len(), 1);
}

#[tokio::test]
async fn spawned_handle_delivers_across_reconnects_and_reports_open_errors() {
    let src = Scripted::new(vec![
        Ok(vec![added("1", "a"), Err(WatchError::Transport("eof".into()))]),
        Err(WatchError::Open { from: Some("1".into()), message: "refused".into() }),
        Ok(vec![modified("2", "a"), deleted("3", "a")]),
    ]);
    let cfg = WatchConfig { buffer: 1, backoff_initial: Duration::ZERO, backoff_max: Duration::ZERO };
    let mut handle = ResilientWatch::new(None, src.clone()).with_backoff(fast()).spawn(&cfg);

    let first = handle.recv().await.unwrap().unwrap();
    assert_eq!((first.kind, first.version.as_str()), (ChangeKind::Added, "1"));
    assert!(matches!(handle.recv().await, Some(Err(WatchError::Open { .. }))));
    let second = handle.recv().await.unwrap().unwrap();
    assert_eq!((second.kind, second.version.as_str()), (ChangeKind::Modified, "2"));
    let third = handle.recv().await.unwrap().unwrap();
    assert_eq!(third.kind, ChangeKind::Deleted);

    handle.close().await;
    let opened = src.opened_from();
    assert_eq!(&opened[..3], [None, Some("1".to_string()), Some("1".to_string())]);
}

/// Never-ending source that counts how many events have been pulled from it.
struct Endless {
    pulled: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Subscription<String> for Endless {
    async fn open(&mut self, _from: Option<ResourceVersion>) -> Result<EventStream<String>, WatchError> {
        let pulled = self.pulled.clone();
        Ok(futures::stream::iter(1u64..)
            .map(move |n| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(WatchEvent::Added { version: ResourceVersion::new(n.to_string()), object: format!("obj-{n}") })
            })
            .boxed())
    }
}

#[tokio::test]
async fn stalled_consumer_pauses_the_subscription() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let cfg = WatchConfig { buffer: 4, backoff_initial: Duration::ZERO, backoff_max: Duration::ZERO };
    let mut handle = ResilientWatch::new(None, Endless { pulled: pulled.clone() }).with_backoff(fast()).spawn(&cfg);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled = pulled.load(Ordering::SeqCst);
    assert!(stalled >= 4, "buffer never filled: {stalled}");
    assert!(stalled <= cfg.buffer + 1, "pulled {stalled} with a full buffer of {}", cfg.buffer);

    let first = handle.recv().await.unwrap().unwrap();
    assert_eq!(first.version.as_str(), "1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pulled.load(Ordering::SeqCst) <= cfg.buffer + 2);
    handle.close().await;
}
