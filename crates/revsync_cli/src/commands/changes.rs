//! Changes command implementation.

use parking_lot::Mutex;
use revsync_engine::{
    ChangeTracker, ChangeTrackerClient, ChangeTrackerConfig, ReqwestClient, SyncError,
};
use revsync_protocol::{ChangeEntry, FeedMode};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

/// Prints every change as one JSON line.
struct Printer {
    done: Mutex<Option<oneshot::Sender<Option<SyncError>>>>,
}

impl ChangeTrackerClient for Printer {
    fn changed(&self, change: ChangeEntry) {
        match serde_json::to_string(&change) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("unprintable change: {e}"),
        }
    }

    fn tracker_stopped(&self, error: Option<SyncError>) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(error);
        }
    }
}

/// Runs the changes command.
pub fn run(
    remote: &str,
    mode: &str,
    since: Option<String>,
    filter: Option<String>,
    filter_params: Vec<(String, String)>,
) -> Result<(), Box<dyn Error>> {
    let mode: FeedMode = mode.parse()?;
    let mut config = ChangeTrackerConfig::new(mode);
    if let Some(since) = since {
        config = config.with_since(since);
    }
    if let Some(filter) = filter {
        config = config.with_filter(filter);
    }
    for (key, value) in filter_params {
        config = config.with_filter_param(key, value);
    }

    let url = url::Url::parse(remote)?;
    let (tx, rx) = oneshot::channel();
    let printer = Arc::new(Printer {
        done: Mutex::new(Some(tx)),
    });
    let tracker = ChangeTracker::new(url, config, Arc::new(ReqwestClient::new()?), printer);
    tracker.start()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let error = runtime.block_on(async {
        tokio::select! {
            stopped = rx => stopped.ok().flatten(),
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                tracker.stop();
                None
            }
        }
    });

    info!(last_sequence = ?tracker.last_sequence(), "change feed closed");
    match error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}
