//! Remote change-feed client.
//!
//! A [`ChangeTracker`] reads a remote `_changes` feed on its own thread and
//! forwards every change to a [`ChangeTrackerClient`]. It supports the three
//! feed modes:
//!
//! - `OneShot` - a single `feed=normal` request
//! - `LongPoll` - `feed=longpoll&limit=50`, re-issued after every response
//! - `Continuous` - one streaming response read line by line, reconnected
//!   from the last seen sequence when the server closes it
//!
//! Cancelling drops the in-flight request, so a blocked read ends promptly.

use crate::config::ChangeTrackerConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::{masked_url, HttpClient, HttpRequest};
use futures_util::StreamExt;
use parking_lot::Mutex;
use revsync_protocol::{ChangeEntry, FeedMode};
use serde_json::Value;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Heartbeat interval requested from the server, in milliseconds.
pub const HEARTBEAT_MS: u64 = 300_000;

/// Batch size requested in long-poll mode.
pub const LONGPOLL_LIMIT: u32 = 50;

/// Receives change-feed events.
///
/// Both methods are called on the tracker's thread.
pub trait ChangeTrackerClient: Send + Sync {
    /// Called for every well-formed change.
    fn changed(&self, change: ChangeEntry);

    /// Called exactly once when the tracker stops.
    fn tracker_stopped(&self, error: Option<SyncError>);
}

/// Lifecycle of a change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Created, not started.
    Idle,
    /// Reading the feed.
    Running,
    /// Stopped; [`ChangeTracker::error`] holds the cause, if any.
    Stopped,
}

/// Client of a remote `_changes` feed.
pub struct ChangeTracker {
    inner: Arc<TrackerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TrackerInner {
    database_url: Url,
    masked: String,
    config: ChangeTrackerConfig,
    http: Arc<dyn HttpClient>,
    headers: Vec<(String, String)>,
    state: Mutex<TrackerState>,
    last_sequence: Mutex<Option<String>>,
    error: Mutex<Option<SyncError>>,
    client: Mutex<Option<Arc<dyn ChangeTrackerClient>>>,
    cancel: watch::Sender<bool>,
}

/// What the run loop does after a request completes.
enum Next {
    Reconnect,
    Finish,
}

impl ChangeTracker {
    /// Creates a tracker for the database at `database_url`.
    pub fn new(
        database_url: Url,
        config: ChangeTrackerConfig,
        http: Arc<dyn HttpClient>,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let since = config.since.clone();
        Self {
            inner: Arc::new(TrackerInner {
                masked: masked_url(&database_url),
                database_url,
                config,
                http,
                headers: Vec::new(),
                state: Mutex::new(TrackerState::Idle),
                last_sequence: Mutex::new(since),
                error: Mutex::new(None),
                client: Mutex::new(Some(client)),
                cancel,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Adds headers sent with every feed request. Only effective before `start`.
    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.headers.extend_from_slice(headers);
        }
        self
    }

    /// Starts reading the feed on a dedicated thread.
    pub fn start(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != TrackerState::Idle {
                return Ok(());
            }
            *state = TrackerState::Running;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("revsync-changes".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(inner.run()),
                    Err(e) => inner.set_error(SyncError::network(e.to_string())),
                }
                inner.finish();
            });

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = SyncError::network(format!("failed to spawn change tracker: {e}"));
                self.inner.set_error(err.clone());
                self.inner.finish();
                Err(err)
            }
        }
    }

    /// Stops the tracker and notifies the client.
    pub fn stop(&self) {
        self.inner.cancel.send_replace(true);
        self.inner.finish();
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> TrackerState {
        *self.inner.state.lock()
    }

    /// Returns true while the feed is being read.
    pub fn is_running(&self) -> bool {
        self.state() == TrackerState::Running
    }

    /// Returns the last sequence seen.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.last_sequence.lock().clone()
    }

    /// Returns the error that stopped the tracker.
    pub fn error(&self) -> Option<SyncError> {
        self.inner.error.lock().clone()
    }

    /// Returns the feed mode.
    pub fn mode(&self) -> FeedMode {
        self.inner.config.mode
    }

    /// Returns the feed URL for the current sequence.
    pub fn changes_url(&self) -> SyncResult<Url> {
        self.inner.changes_url()
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.inner.cancel.send_replace(true);
    }
}

impl TrackerInner {
    fn changes_url(&self) -> SyncResult<Url> {
        let mode = self.config.mode;
        let mut query = format!("_changes?feed={}", mode.feed_name());
        if mode == FeedMode::LongPoll {
            query.push_str(&format!("&limit={LONGPOLL_LIMIT}"));
        }
        query.push_str(&format!("&heartbeat={HEARTBEAT_MS}"));
        if let Some(since) = self.last_sequence.lock().as_deref() {
            query.push_str(&format!("&since={}", encode(since)));
        }
        if let Some(filter) = &self.config.filter_name {
            query.push_str(&format!("&filter={}", encode(filter)));
            for (key, value) in &self.config.filter_params {
                query.push_str(&format!("&{}={}", encode(key), encode(value)));
            }
        }

        let base = self.database_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{query}"))?)
    }

    fn set_error(&self, error: SyncError) {
        *self.error.lock() = Some(error);
    }

    /// Marks the tracker stopped and notifies the client the first time.
    fn finish(&self) {
        *self.state.lock() = TrackerState::Stopped;
        let client = self.client.lock().take();
        if let Some(client) = client {
            let error = self.error.lock().clone();
            info!(remote = %self.masked, error = ?error, "change tracker stopped");
            client.tracker_stopped(error);
        }
    }

    fn client(&self) -> Option<Arc<dyn ChangeTrackerClient>> {
        self.client.lock().clone()
    }

    async fn run(&self) {
        let mut cancel = self.cancel.subscribe();
        let mut failures = 0u32;

        loop {
            if *cancel.borrow() {
                break;
            }
            let url = match self.changes_url() {
                Ok(url) => url,
                Err(e) => {
                    self.set_error(e);
                    break;
                }
            };
            debug!(remote = %self.masked, mode = %self.config.mode, "requesting changes");

            let outcome = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                outcome = self.request(url) => outcome,
            };

            match outcome {
                Ok(Next::Reconnect) => failures = 0,
                Ok(Next::Finish) => break,
                Err(e) if is_transport_failure(&e) && self.config.retry.should_retry(failures + 1) => {
                    failures += 1;
                    let delay = self.config.retry.delay_for_attempt(failures);
                    warn!(remote = %self.masked, error = %e, attempt = failures, ?delay, "change feed failed, retrying");
                    tokio::select! {
                        _ = cancelled(&mut cancel) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(remote = %self.masked, error = %e, "change feed failed");
                    self.set_error(e);
                    break;
                }
            }
        }
    }

    async fn request(&self, url: Url) -> SyncResult<Next> {
        let request = HttpRequest::get(url).with_headers(&self.headers);
        let response = self.http.open_stream(request).await?;
        if response.status >= 300 {
            let status = response.status;
            let body = response.collect().await.unwrap_or_default();
            return Err(SyncError::from_status(
                status,
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }

        match self.config.mode {
            FeedMode::OneShot | FeedMode::LongPoll => {
                let body = response.collect().await?;
                self.received_poll_response(&body)?;
                Ok(match self.config.mode {
                    FeedMode::LongPoll => Next::Reconnect,
                    _ => Next::Finish,
                })
            }
            FeedMode::Continuous => {
                let mut body = response.body;
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = body.next().await {
                    buf.extend_from_slice(&chunk?);
                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        self.received_line(&line);
                    }
                }
                if !buf.is_empty() {
                    self.received_line(&buf);
                }
                debug!(remote = %self.masked, "continuous feed closed, reconnecting");
                Ok(Next::Reconnect)
            }
        }
    }

    fn received_poll_response(&self, body: &[u8]) -> SyncResult<()> {
        let response: Value = serde_json::from_slice(body)?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::MalformedResponse("changes response lacks results".into()))?;
        for change in results {
            self.received_change(change);
        }
        if let Some(last_seq) = response.get("last_seq").filter(|v| !v.is_null()) {
            *self.last_sequence.lock() = Some(sequence_token(last_seq));
        }
        Ok(())
    }

    fn received_line(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.get("seq").is_none() && value.get("last_seq").is_some() => {
                if let Some(last_seq) = value.get("last_seq").filter(|v| !v.is_null()) {
                    *self.last_sequence.lock() = Some(sequence_token(last_seq));
                }
            }
            Ok(value) => {
                self.received_change(&value);
            }
            Err(e) => warn!(remote = %self.masked, error = %e, "discarding unparseable change line"),
        }
    }

    /// Validates one change and forwards it. Returns false if it was dropped.
    fn received_change(&self, value: &Value) -> bool {
        if value.get("seq").map_or(true, Value::is_null) {
            warn!(remote = %self.masked, "discarding change without seq");
            return false;
        }
        let change: ChangeEntry = match serde_json::from_value(value.clone()) {
            Ok(change) => change,
            Err(e) => {
                warn!(remote = %self.masked, error = %e, "discarding malformed change");
                return false;
            }
        };

        *self.last_sequence.lock() = Some(change.seq_token());
        if let Some(client) = self.client() {
            client.changed(change);
        }
        true
    }
}

fn is_transport_failure(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Network { status: None, .. } | SyncError::Timeout
    )
}

fn sequence_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which also ends the tracker.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::http::{HttpResponse, StreamingResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    enum Reply {
        Body(u16, &'static str),
        Chunks(Vec<&'static str>),
        Fail,
    }

    /// Replays scripted replies, then hangs.
    struct ScriptedFeed {
        replies: Mutex<VecDeque<Reply>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedFeed {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedFeed {
        async fn send(&self, _request: HttpRequest) -> SyncResult<HttpResponse> {
            Err(SyncError::network("unused"))
        }

        async fn open_stream(&self, request: HttpRequest) -> SyncResult<StreamingResponse> {
            self.urls.lock().push(request.url.to_string());
            let reply = self.replies.lock().pop_front();
            let chunks = |status, parts: Vec<&'static str>| {
                let parts: Vec<SyncResult<Bytes>> =
                    parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
                Ok(StreamingResponse::new(
                    status,
                    futures_util::stream::iter(parts).boxed(),
                ))
            };
            match reply {
                Some(Reply::Body(status, body)) => chunks(status, vec![body]),
                Some(Reply::Chunks(parts)) => chunks(200, parts),
                Some(Reply::Fail) => Err(SyncError::network("connection refused")),
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Changed(String, String),
        Stopped(Option<SyncError>),
    }

    struct Recorder {
        events: Mutex<std_mpsc::Sender<Event>>,
    }

    impl ChangeTrackerClient for Recorder {
        fn changed(&self, change: ChangeEntry) {
            let _ = self
                .events
                .lock()
                .send(Event::Changed(change.id.clone(), change.seq_token()));
        }

        fn tracker_stopped(&self, error: Option<SyncError>) {
            let _ = self.events.lock().send(Event::Stopped(error));
        }
    }

    fn tracker(
        config: ChangeTrackerConfig,
        feed: Arc<ScriptedFeed>,
    ) -> (ChangeTracker, std_mpsc::Receiver<Event>) {
        let (tx, rx) = std_mpsc::channel();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(tx),
        });
        let url = Url::parse("http://user:pw@h:5984/db").unwrap();
        (ChangeTracker::new(url, config, feed, recorder), rx)
    }

    fn next(rx: &std_mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn changed(id: &str, seq: &str) -> Event {
        Event::Changed(id.into(), seq.into())
    }

    #[test]
    fn builds_feed_urls() {
        let config = ChangeTrackerConfig::new(FeedMode::LongPoll)
            .with_since("12-g1AAA")
            .with_filter("app/by owner")
            .with_filter_param("owner", "a&b");
        let (tracker, _rx) = tracker(config, ScriptedFeed::new(vec![]));
        assert_eq!(
            tracker.changes_url().unwrap().as_str(),
            "http://user:pw@h:5984/db/_changes?feed=longpoll&limit=50&heartbeat=300000\
             &since=12-g1AAA&filter=app%2Fby+owner&owner=a%26b"
        );

        let (tracker, _rx) = tracker_for(FeedMode::OneShot);
        assert_eq!(
            tracker.changes_url().unwrap().as_str(),
            "http://user:pw@h:5984/db/_changes?feed=normal&heartbeat=300000"
        );
    }

    fn tracker_for(mode: FeedMode) -> (ChangeTracker, std_mpsc::Receiver<Event>) {
        tracker(ChangeTrackerConfig::new(mode), ScriptedFeed::new(vec![]))
    }

    #[test]
    fn one_shot_stops_after_first_response() {
        let feed = ScriptedFeed::new(vec![Reply::Body(
            200,
            r#"{"results":[{"seq":1,"id":"a","changes":[{"rev":"1-x"}]},{"id":"bad"},{"seq":2,"id":"b","changes":[{"rev":"1-y"}]}],"last_seq":2}"#,
        )]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::OneShot), feed.clone());
        tracker.start().unwrap();

        assert_eq!(next(&rx), changed("a", "1"));
        assert_eq!(next(&rx), changed("b", "2"));
        assert_eq!(next(&rx), Event::Stopped(None));
        assert_eq!(feed.urls.lock().len(), 1);
        assert_eq!(tracker.last_sequence().as_deref(), Some("2"));
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[test]
    fn one_shot_stops_on_empty_response() {
        let feed = ScriptedFeed::new(vec![Reply::Body(200, r#"{"results":[],"last_seq":0}"#)]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::OneShot), feed);
        tracker.start().unwrap();
        assert_eq!(next(&rx), Event::Stopped(None));
    }

    #[test]
    fn long_poll_reissues_with_updated_since() {
        let feed = ScriptedFeed::new(vec![
            Reply::Body(200, r#"{"results":[{"seq":"3-a","id":"a","changes":[{"rev":"1-x"}]}],"last_seq":"3-a"}"#),
            Reply::Body(200, r#"{"results":[],"last_seq":"3-a"}"#),
            Reply::Body(500, "boom"),
        ]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::LongPoll), feed.clone());
        tracker.start().unwrap();

        assert_eq!(next(&rx), changed("a", "3-a"));
        match next(&rx) {
            Event::Stopped(Some(err)) => assert_eq!(err.status(), Some(500)),
            other => panic!("unexpected event {other:?}"),
        }
        let urls = feed.urls.lock();
        assert_eq!(urls.len(), 3);
        assert!(!urls[0].contains("since="));
        assert!(urls[1].contains("&since=3-a"));
        assert!(tracker.error().is_some());
    }

    #[test]
    fn malformed_poll_response_stops() {
        let feed = ScriptedFeed::new(vec![Reply::Body(200, r#"{"rows":[]}"#)]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::LongPoll), feed);
        tracker.start().unwrap();
        assert!(matches!(
            next(&rx),
            Event::Stopped(Some(SyncError::MalformedResponse(_)))
        ));
    }

    #[test]
    fn continuous_reads_lines_and_reconnects() {
        let feed = ScriptedFeed::new(vec![
            Reply::Chunks(vec![
                "{\"seq\":1,\"id\":\"a\",\"changes\":[{\"rev\":\"1-x\"}]}\n\n",
                "{\"seq\":2,\"id\":\"b\",",
                "\"changes\":[{\"rev\":\"1-y\"}]}\nnot json\n{\"id\":\"noseq\"}\n",
            ]),
            Reply::Chunks(vec!["{\"seq\":3,\"id\":\"c\",\"changes\":[{\"rev\":\"1-z\"}]}\n"]),
        ]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::Continuous), feed.clone());
        tracker.start().unwrap();

        assert_eq!(next(&rx), changed("a", "1"));
        assert_eq!(next(&rx), changed("b", "2"));
        assert_eq!(next(&rx), changed("c", "3"));
        assert!(feed.urls.lock()[1].contains("feed=continuous&heartbeat=300000&since=2"));

        // The third request hangs until stopped.
        tracker.stop();
        assert_eq!(next(&rx), Event::Stopped(None));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn stop_unblocks_pending_request_once() {
        let feed = ScriptedFeed::new(vec![]);
        let (tracker, rx) = tracker(ChangeTrackerConfig::new(FeedMode::LongPoll), feed);
        tracker.start().unwrap();
        assert!(tracker.is_running());

        tracker.stop();
        tracker.stop();
        assert_eq!(next(&rx), Event::Stopped(None));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[test]
    fn transport_failures_are_retried() {
        let feed = ScriptedFeed::new(vec![
            Reply::Fail,
            Reply::Body(200, r#"{"results":[{"seq":1,"id":"a","changes":[{"rev":"1-x"}]}]}"#),
        ]);
        let config = ChangeTrackerConfig::new(FeedMode::OneShot)
            .with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(5)));
        let (tracker, rx) = tracker(config, feed);
        tracker.start().unwrap();
        assert_eq!(next(&rx), changed("a", "1"));
        assert_eq!(next(&rx), Event::Stopped(None));
    }

    #[test]
    fn exhausted_retries_record_error() {
        let feed = ScriptedFeed::new(vec![Reply::Fail, Reply::Fail]);
        let config = ChangeTrackerConfig::new(FeedMode::OneShot)
            .with_retry(RetryConfig::new(2).with_initial_delay(Duration::from_millis(5)));
        let (tracker, rx) = tracker(config, feed);
        tracker.start().unwrap();
        assert!(matches!(
            next(&rx),
            Event::Stopped(Some(SyncError::Network { status: None, .. }))
        ));
    }
}
