//! Shared fixtures for replication integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Method;
use revsync_engine::{
    HttpClient, HttpRequest, HttpResponse, ReplicationConfig, StreamingResponse, SyncError,
    SyncResult,
};
use revsync_protocol::{
    BulkDocsRequest, ChangeEntry, ChangeRev, ChangesResponse, Properties, RevisionHistory,
    RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// URL of the mock database.
pub const REMOTE_URL: &str = "http://remote.test/db";

/// A replication config against the mock database with short timers.
pub fn config() -> ReplicationConfig {
    ReplicationConfig::new(REMOTE_URL)
        .with_batch(revsync_engine::BatchConfig::new(100, Duration::from_millis(10)))
        .with_checkpoint_save_delay(Duration::from_millis(20))
}

/// Builds a document body.
pub fn body(value: Value) -> Properties {
    value.as_object().cloned().unwrap_or_default()
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Fails the test if `future` takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

struct StoredRevision {
    body: Properties,
    history: Vec<String>,
}

struct Change {
    seq: u64,
    doc_id: String,
    rev_id: String,
    deleted: bool,
}

#[derive(Default)]
struct RemoteState {
    exists: bool,
    deny_create: bool,
    fail_bulk_docs: bool,
    revisions: BTreeMap<(String, String), StoredRevision>,
    changes: Vec<Change>,
    local: HashMap<String, Properties>,
    requests: Vec<String>,
    bulk_docs: Vec<BulkDocsRequest>,
}

impl RemoteState {
    fn knows(&self, doc_id: &str, rev_id: &str) -> bool {
        self.revisions
            .range((doc_id.to_string(), String::new())..)
            .take_while(|((doc, _), _)| doc == doc_id)
            .any(|((_, rev), stored)| rev == rev_id || stored.history.iter().any(|r| r == rev_id))
    }

    fn insert(&mut self, mut body: Properties, seq: u64) -> Option<()> {
        let doc_id = body.get("_id")?.as_str()?.to_string();
        let rev_id = body.get("_rev")?.as_str()?.to_string();
        let history = RevisionHistory::from_properties(&body)
            .ok()
            .flatten()
            .map(|h| h.to_rev_ids())
            .unwrap_or_else(|| vec![rev_id.clone()]);
        body.remove("_revisions");
        let deleted = body.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        self.changes.push(Change {
            seq,
            doc_id: doc_id.clone(),
            rev_id: rev_id.clone(),
            deleted,
        });
        self.revisions
            .insert((doc_id, rev_id), StoredRevision { body, history });
        Some(())
    }

    fn changes_since(&self, since: u64) -> Vec<ChangeEntry> {
        self.changes
            .iter()
            .filter(|change| change.seq > since)
            .map(|change| ChangeEntry {
                seq: json!(change.seq),
                id: change.doc_id.clone(),
                changes: vec![ChangeRev {
                    rev: change.rev_id.clone(),
                }],
                deleted: change.deleted,
            })
            .collect()
    }
}

/// An in-memory database speaking the subset of the CouchDB HTTP API used
/// by replication.
pub struct MockRemote {
    state: Mutex<RemoteState>,
    seq: watch::Sender<u64>,
    checkpoint_delay: Mutex<Option<Duration>>,
    checkpoint_puts_in_flight: AtomicUsize,
    max_checkpoint_puts_in_flight: AtomicUsize,
}

impl MockRemote {
    /// An existing, empty database.
    pub fn new() -> Self {
        let remote = Self::missing();
        remote.state.lock().exists = true;
        remote
    }

    /// A database that has not been created yet.
    pub fn missing() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            seq: watch::channel(0).0,
            checkpoint_delay: Mutex::new(None),
            checkpoint_puts_in_flight: AtomicUsize::new(0),
            max_checkpoint_puts_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rejects database creation with 401.
    pub fn deny_create(&self) {
        self.state.lock().deny_create = true;
    }

    /// Makes `_bulk_docs` fail with 500.
    pub fn set_fail_bulk_docs(&self, fail: bool) {
        self.state.lock().fail_bulk_docs = fail;
    }

    /// Delays every checkpoint save.
    pub fn set_checkpoint_delay(&self, delay: Duration) {
        *self.checkpoint_delay.lock() = Some(delay);
    }

    /// Writes a revision as if another peer had replicated it here.
    pub fn put_revision(&self, doc_id: &str, history: &[&str], mut body: Properties) {
        body.insert("_id".into(), json!(doc_id));
        body.insert("_rev".into(), json!(history[0]));
        let revisions = RevisionHistory::from_rev_ids(history).unwrap();
        body.insert("_revisions".into(), revisions.to_value());
        let seq = {
            let mut state = self.state.lock();
            let seq = state.changes.len() as u64 + 1;
            state.insert(body, seq);
            seq
        };
        self.seq.send_replace(seq);
    }

    /// Returns true if the database holds the revision.
    pub fn has_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.state
            .lock()
            .revisions
            .contains_key(&(doc_id.to_string(), rev_id.to_string()))
    }

    /// Returns the stored history of a revision, newest first.
    pub fn history(&self, doc_id: &str, rev_id: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .revisions
            .get(&(doc_id.to_string(), rev_id.to_string()))
            .map(|stored| stored.history.clone())
    }

    /// Returns the number of stored revisions.
    pub fn revision_count(&self) -> usize {
        self.state.lock().revisions.len()
    }

    /// Returns true once the database exists.
    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Returns the `_bulk_docs` bodies received so far.
    pub fn bulk_docs(&self) -> Vec<BulkDocsRequest> {
        self.state.lock().bulk_docs.clone()
    }

    /// Returns `"METHOD path"` for every request received so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    /// Counts requests whose `"METHOD path"` starts with `prefix`.
    pub fn request_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    /// Returns a `_local` document.
    pub fn checkpoint(&self, id: &str) -> Option<Properties> {
        self.state.lock().local.get(id).cloned()
    }

    /// Rewrites a `_local` checkpoint as another client would, bumping its `_rev`.
    pub fn overwrite_checkpoint(&self, id: &str, last_sequence: &str) {
        let mut state = self.state.lock();
        let Some(doc) = state.local.get_mut(id) else {
            return;
        };
        let n = doc
            .get("_rev")
            .and_then(Value::as_str)
            .and_then(|rev| rev.trim_start_matches("0-").parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        doc.insert("_rev".into(), json!(format!("0-{n}")));
        doc.insert("lastSequence".into(), json!(last_sequence));
    }

    /// Drops every `_local` document.
    pub fn clear_checkpoints(&self) {
        self.state.lock().local.clear();
    }

    /// Returns the highest number of concurrent checkpoint saves observed.
    pub fn max_checkpoint_puts_in_flight(&self) -> usize {
        self.max_checkpoint_puts_in_flight.load(Ordering::SeqCst)
    }

    fn route(&self, request: &HttpRequest) -> (Vec<String>, HashMap<String, String>) {
        let segments: Vec<String> = request
            .url
            .path_segments()
            .map(|s| s.skip(1).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let query = request.url.query_pairs().into_owned().collect();
        let line = format!("{} /{}", request.method, segments.join("/"));
        self.state.lock().requests.push(line);
        (segments, query)
    }

    async fn put_checkpoint(&self, id: &str, mut body: Properties) -> HttpResponse {
        let in_flight = self.checkpoint_puts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_checkpoint_puts_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.checkpoint_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = {
            let mut state = self.state.lock();
            let current = state
                .local
                .get(id)
                .and_then(|doc| doc.get("_rev"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if current.as_deref() != body.get("_rev").and_then(Value::as_str) {
                reply(409, json!({"error": "conflict"}))
            } else {
                let n = current
                    .and_then(|rev| rev.trim_start_matches("0-").parse::<u64>().ok())
                    .unwrap_or(0)
                    + 1;
                let rev = format!("0-{n}");
                body.insert("_rev".into(), json!(rev));
                state.local.insert(id.to_string(), body);
                reply(201, json!({"ok": true, "id": format!("_local/{id}"), "rev": rev}))
            }
        };
        self.checkpoint_puts_in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }

    fn revs_diff(&self, request: RevsDiffRequest) -> HttpResponse {
        let state = self.state.lock();
        let mut response = BTreeMap::new();
        for (doc_id, rev_ids) in request {
            let missing: Vec<String> = rev_ids
                .into_iter()
                .filter(|rev_id| !state.knows(&doc_id, rev_id))
                .collect();
            if !missing.is_empty() {
                response.insert(
                    doc_id,
                    RevsDiffEntry {
                        missing,
                        possible_ancestors: None,
                    },
                );
            }
        }
        reply(200, serde_json::to_value(RevsDiffResponse(response)).unwrap())
    }

    fn store_bulk_docs(&self, request: BulkDocsRequest) -> HttpResponse {
        let seq = {
            let mut state = self.state.lock();
            if state.fail_bulk_docs {
                return reply(500, json!({"error": "internal"}));
            }
            state.bulk_docs.push(request.clone());
            let mut seq = state.changes.len() as u64;
            for doc in request.docs {
                seq += 1;
                if state.insert(doc, seq).is_none() {
                    return reply(400, json!({"error": "bad_request"}));
                }
            }
            seq
        };
        self.seq.send_replace(seq);
        reply(201, json!([]))
    }

    fn get_revision(&self, doc_id: &str, query: &HashMap<String, String>) -> HttpResponse {
        let state = self.state.lock();
        let Some(rev_id) = query.get("rev") else {
            return reply(400, json!({"error": "bad_request"}));
        };
        match state.revisions.get(&(doc_id.to_string(), rev_id.clone())) {
            Some(stored) => {
                let mut body = stored.body.clone();
                if query.get("revs").map(String::as_str) == Some("true") {
                    let history = RevisionHistory::from_rev_ids(stored.history.as_slice()).unwrap();
                    body.insert("_revisions".into(), history.to_value());
                }
                reply(200, Value::Object(body))
            }
            None => reply(404, json!({"error": "not_found"})),
        }
    }

    async fn changes(&self, query: &HashMap<String, String>) -> HttpResponse {
        let since = query
            .get("since")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        match query.get("feed").map(String::as_str) {
            Some("normal") | None => {}
            Some("longpoll") => {
                let mut rx = self.seq.subscribe();
                let _ = rx.wait_for(|seq| *seq > since).await;
            }
            Some(_) => return reply(400, json!({"error": "bad_request"})),
        }
        let state = self.state.lock();
        let response = ChangesResponse {
            results: state.changes_since(since),
            last_seq: Some(json!(state.changes.len())),
        };
        reply(200, serde_json::to_value(response).unwrap())
    }
}

fn reply(status: u16, body: Value) -> HttpResponse {
    HttpResponse::new(status, serde_json::to_vec(&body).unwrap())
}

fn parse<T: serde::de::DeserializeOwned>(request: &HttpRequest) -> SyncResult<T> {
    serde_json::from_slice(request.body.as_deref().unwrap_or(b"{}"))
        .map_err(|e| SyncError::MalformedResponse(e.to_string()))
}

#[async_trait]
impl HttpClient for MockRemote {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let (segments, query) = self.route(&request);
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        if request.method == Method::PUT && segments.is_empty() {
            let mut state = self.state.lock();
            return Ok(if state.deny_create {
                reply(401, json!({"error": "unauthorized"}))
            } else if state.exists {
                reply(412, json!({"error": "file_exists"}))
            } else {
                state.exists = true;
                reply(201, json!({"ok": true}))
            });
        }
        if !self.exists() {
            return Ok(reply(404, json!({"error": "not_found", "reason": "no_db_file"})));
        }

        let response = match (&request.method, segments.as_slice()) {
            (&Method::GET, ["_local", id]) => match self.checkpoint(id) {
                Some(doc) => reply(200, Value::Object(doc)),
                None => reply(404, json!({"error": "not_found"})),
            },
            (&Method::PUT, ["_local", id]) => self.put_checkpoint(id, parse(&request)?).await,
            (&Method::POST, ["_revs_diff"]) => self.revs_diff(parse(&request)?),
            (&Method::POST, ["_bulk_docs"]) => self.store_bulk_docs(parse(&request)?),
            (&Method::GET, [doc_id]) => self.get_revision(doc_id, &query),
            _ => reply(405, json!({"error": "method_not_allowed"})),
        };
        Ok(response)
    }

    async fn open_stream(&self, request: HttpRequest) -> SyncResult<StreamingResponse> {
        let (segments, query) = self.route(&request);
        let response = if !self.exists() {
            reply(404, json!({"error": "not_found"}))
        } else if segments == ["_changes"] {
            self.changes(&query).await
        } else {
            reply(405, json!({"error": "method_not_allowed"}))
        };
        let chunk: SyncResult<Bytes> = Ok(response.body);
        Ok(StreamingResponse::new(
            response.status,
            futures_util::stream::iter(vec![chunk]).boxed(),
        ))
    }
}
