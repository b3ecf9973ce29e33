//! Configuration for replication sessions.

use revsync_protocol::FeedMode;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for one replication session.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Remote database URL (may embed `user:password`).
    pub remote_url: String,
    /// Keep replicating after the initial catch-up.
    pub continuous: bool,
    /// Create the remote database before pushing.
    pub create_target: bool,
    /// Name of the filter restricting which revisions replicate.
    pub filter_name: Option<String>,
    /// Parameters passed to the filter.
    pub filter_params: BTreeMap<String, String>,
    /// Inbox batching.
    pub batch: BatchConfig,
    /// Debounce delay before a changed checkpoint is saved.
    pub checkpoint_save_delay: Duration,
    /// Timeout for individual HTTP requests.
    pub request_timeout: Duration,
    /// Change-feed reconnect policy.
    pub retry: RetryConfig,
    /// Access token appended to `_revs_diff` and `_bulk_docs` requests.
    pub access_token: Option<String>,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl ReplicationConfig {
    /// Creates a one-shot configuration for the given remote.
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            continuous: false,
            create_target: false,
            filter_name: None,
            filter_params: BTreeMap::new(),
            batch: BatchConfig::default(),
            checkpoint_save_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            access_token: None,
            headers: BTreeMap::new(),
        }
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets whether the remote database is created before pushing.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the filter name.
    pub fn with_filter(mut self, name: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self
    }

    /// Adds a filter parameter.
    pub fn with_filter_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_params.insert(key.into(), value.into());
        self
    }

    /// Sets the batching configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the checkpoint save delay.
    pub fn with_checkpoint_save_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_save_delay = delay;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Derives the change-tracker configuration for a pull starting at `since`.
    pub fn change_tracker(&self, since: Option<String>) -> ChangeTrackerConfig {
        let mode = if self.continuous {
            FeedMode::LongPoll
        } else {
            FeedMode::OneShot
        };
        ChangeTrackerConfig {
            mode,
            since,
            filter_name: self.filter_name.clone(),
            filter_params: self.filter_params.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Batcher sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Queue depth that triggers an immediate flush.
    pub capacity: usize,
    /// Delay after the first queued item before a flush.
    pub delay: Duration,
}

impl BatchConfig {
    /// Creates a batch configuration.
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(500))
    }
}

/// Configuration for a change tracker.
#[derive(Debug, Clone)]
pub struct ChangeTrackerConfig {
    /// Feed mode.
    pub mode: FeedMode,
    /// Sequence token to start after.
    pub since: Option<String>,
    /// Server-side filter name.
    pub filter_name: Option<String>,
    /// Server-side filter parameters.
    pub filter_params: BTreeMap<String, String>,
    /// Reconnect policy for transport failures.
    pub retry: RetryConfig,
}

impl ChangeTrackerConfig {
    /// Creates a configuration for the given mode.
    pub fn new(mode: FeedMode) -> Self {
        Self {
            mode,
            since: None,
            filter_name: None,
            filter_params: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the starting sequence.
    pub fn with_since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    /// Sets the filter name.
    pub fn with_filter(mut self, name: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self
    }

    /// Adds a filter parameter.
    pub fn with_filter_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_params.insert(key.into(), value.into());
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Returns true if another attempt may follow `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculates the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(secs + secs * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// A value in `[0, 1)` derived from the clock.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
