//! Push command implementation.

use revsync_engine::{masked_url, ReplicationConfig, ReqwestClient, SessionFactory};
use revsync_protocol::Properties;
use revsync_store::MemoryStore;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Options of the push command.
#[derive(Debug)]
pub struct PushOptions {
    /// Remote database URL.
    pub remote: String,
    /// JSON file holding the documents.
    pub docs: PathBuf,
    /// Create the remote database first.
    pub create_target: bool,
    /// Keep pushing until interrupted.
    pub continuous: bool,
    /// Access token for upload requests.
    pub access_token: Option<String>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

/// Push result.
#[derive(Debug, Serialize)]
pub struct PushReport {
    /// Remote URL, credentials masked.
    pub remote: String,
    /// Session id.
    pub session_id: Option<String>,
    /// Number of documents loaded from the file.
    pub documents: usize,
    /// Revisions the remote has not confirmed.
    pub pending: usize,
    /// Last checkpointed local sequence.
    pub last_sequence: Option<String>,
    /// Error that ended the session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads a JSON array of document objects.
///
/// Documents without an `_id` get a random one.
pub fn load_documents(path: &Path) -> Result<Vec<(String, Properties)>, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    let Value::Array(items) = serde_json::from_str(&text)? else {
        return Err(format!("{} does not hold a JSON array", path.display()).into());
    };

    let mut documents = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(mut body) = item else {
            return Err(format!("document #{index} is not an object").into());
        };
        let id = match body.remove("_id") {
            Some(Value::String(id)) => id,
            Some(_) => return Err(format!("document #{index} has a non-string _id").into()),
            None => Uuid::new_v4().to_string(),
        };
        documents.push((id, body));
    }
    Ok(documents)
}

/// Runs the push command.
pub fn run(options: PushOptions, format: &str) -> Result<(), Box<dyn Error>> {
    let documents = load_documents(&options.docs)?;
    let store = Arc::new(MemoryStore::new());
    for (id, body) in &documents {
        store.put(id, body.clone())?;
    }
    info!(count = documents.len(), "loaded documents");

    let mut config = ReplicationConfig::new(options.remote.as_str())
        .with_create_target(options.create_target)
        .with_continuous(options.continuous);
    if let Some(token) = options.access_token {
        config = config.with_access_token(token);
    }
    for (name, value) in options.headers {
        config = config.with_header(name, value);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let status = runtime.block_on(async {
        let factory = SessionFactory::new(store.clone(), Arc::new(ReqwestClient::new()?))?;
        let session = factory.push(config)?;
        session.start();
        if options.continuous {
            tokio::select! {
                _ = session.wait_until_stopped() => {}
                interrupted = tokio::signal::ctrl_c() => {
                    interrupted?;
                    info!("interrupted, stopping");
                    factory.close();
                    session.wait_until_stopped().await;
                }
            }
        } else {
            session.wait_until_stopped().await;
        }
        Ok::<_, Box<dyn Error>>(session.status())
    })?;

    let report = PushReport {
        remote: url::Url::parse(&options.remote)
            .map(|url| masked_url(&url))
            .unwrap_or_default(),
        session_id: status.session_id,
        documents: documents.len(),
        pending: store.log_len(&options.remote, true),
        last_sequence: status.last_sequence,
        error: status.error.map(|e| e.to_string()),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }

    if report.error.is_some() {
        return Err("push failed".into());
    }
    Ok(())
}

fn print_text(report: &PushReport) {
    match &report.error {
        None => println!("✓ Push completed"),
        Some(_) => println!("✗ Push failed"),
    }
    println!("  Remote: {}", report.remote);
    println!(
        "  Session: {}",
        report.session_id.as_deref().unwrap_or("-")
    );
    println!("  Documents: {}", report.documents);
    println!("  Pending: {}", report.pending);
    println!(
        "  Last sequence: {}",
        report.last_sequence.as_deref().unwrap_or("-")
    );
    if let Some(error) = &report.error {
        println!("  Error: {error}");
    }
}
