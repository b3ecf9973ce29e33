//! Time- and size-bounded coalescing queue.

use crate::config::BatchConfig;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

/// Callback receiving each flushed batch.
pub type BatchProcessor<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Accumulates items and hands them to a processor in batches.
///
/// A batch is flushed when the queue reaches `capacity`, or `delay` after
/// the first item queued since the last flush. Batches are processed one
/// at a time, in FIFO order, on a task spawned on the given runtime; the
/// caller of [`Batcher::queue`] never runs the processor itself.
pub struct Batcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    config: BatchConfig,
    handle: Handle,
    queue: Mutex<Pending<T>>,
    batches: mpsc::UnboundedSender<Vec<T>>,
}

struct Pending<T> {
    items: Vec<T>,
    /// Bumped on every flush so timers armed for an earlier batch do nothing.
    generation: u64,
    timer_armed: bool,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher that delivers batches to `processor` on `handle`.
    pub fn new(config: BatchConfig, handle: Handle, processor: BatchProcessor<T>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<T>>();
        handle.spawn(async move {
            while let Some(batch) = rx.recv().await {
                processor(batch).await;
            }
        });

        Self {
            shared: Arc::new(Shared {
                config: BatchConfig {
                    capacity: config.capacity.max(1),
                    ..config
                },
                handle,
                queue: Mutex::new(Pending {
                    items: Vec::new(),
                    generation: 0,
                    timer_armed: false,
                }),
                batches: tx,
            }),
        }
    }

    /// Queues one item.
    pub fn queue(&self, item: T) {
        self.queue_all(std::iter::once(item));
    }

    /// Queues many items.
    pub fn queue_all(&self, items: impl IntoIterator<Item = T>) {
        let mut pending = self.shared.queue.lock();
        let before = pending.items.len();
        pending.items.extend(items);
        if pending.items.len() == before {
            return;
        }

        while pending.items.len() >= self.shared.config.capacity {
            let rest = pending.items.split_off(self.shared.config.capacity);
            let batch = std::mem::replace(&mut pending.items, rest);
            self.shared.dispatch(&mut pending, batch);
        }

        if !pending.items.is_empty() && !pending.timer_armed {
            pending.timer_armed = true;
            Shared::arm_timer(&self.shared, pending.generation);
        }
    }

    /// Delivers everything queued now.
    pub fn flush(&self) {
        let mut pending = self.shared.queue.lock();
        if !pending.items.is_empty() {
            let batch = std::mem::take(&mut pending.items);
            self.shared.dispatch(&mut pending, batch);
        }
    }

    /// Returns the number of queued items.
    pub fn count(&self) -> usize {
        self.shared.queue.lock().items.len()
    }
}

impl<T: Send + 'static> Shared<T> {
    fn dispatch(&self, pending: &mut Pending<T>, batch: Vec<T>) {
        pending.generation += 1;
        pending.timer_armed = false;
        trace!(count = batch.len(), "flushing batch");
        // The worker only exits once every sender is gone.
        let _ = self.batches.send(batch);
    }

    fn arm_timer(this: &Arc<Self>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let delay = this.config.delay;
        this.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                let mut pending = shared.queue.lock();
                if pending.generation == generation && !pending.items.is_empty() {
                    let batch = std::mem::take(&mut pending.items);
                    shared.dispatch(&mut pending, batch);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn collecting(
        capacity: usize,
        delay_ms: u64,
    ) -> (Batcher<u32>, UnboundedReceiver<Vec<u32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let processor: BatchProcessor<u32> = Arc::new(move |batch| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(batch);
            }
            .boxed()
        });
        let batcher = Batcher::new(
            BatchConfig::new(capacity, Duration::from_millis(delay_ms)),
            Handle::current(),
            processor,
        );
        (batcher, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_triggers_flush() {
        let (batcher, mut rx) = collecting(3, 500);
        batcher.queue_all([1, 2, 3, 4]);

        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(batcher.count(), 1);
        assert_eq!(rx.recv().await.unwrap(), vec![4]);
        assert_eq!(batcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_flushes_one_at_a_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor: BatchProcessor<u32> = Arc::new(move |batch| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(batch);
            }
            .boxed()
        });
        let config = BatchConfig {
            capacity: 0,
            delay: Duration::from_millis(500),
        };
        let batcher = Batcher::new(config, Handle::current(), processor);
        batcher.queue_all([1, 2]);

        assert_eq!(rx.recv().await.unwrap(), vec![1]);
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
        assert_eq!(batcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_triggers_flush() {
        let (batcher, mut rx) = collecting(100, 500);
        let start = tokio::time::Instant::now();
        batcher.queue(1);
        batcher.queue(2);

        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush() {
        let (batcher, mut rx) = collecting(100, 60_000);
        batcher.queue(7);
        batcher.flush();
        assert_eq!(rx.recv().await.unwrap(), vec![7]);
        batcher.flush();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_is_ignored() {
        let (batcher, mut rx) = collecting(100, 100);
        batcher.queue(1);
        batcher.flush();
        assert_eq!(rx.recv().await.unwrap(), vec![1]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        batcher.queue(2);

        // The first timer fires at 100ms and must not flush item 2.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(batcher.count(), 1);

        assert_eq!(rx.recv().await.unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let processor: BatchProcessor<u32> = {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            Arc::new(move |batch| {
                let running = Arc::clone(&running);
                let overlap = Arc::clone(&overlap);
                let tx = tx.clone();
                async move {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(batch);
                }
                .boxed()
            })
        };

        let batcher = Batcher::new(
            BatchConfig::new(2, Duration::from_millis(10)),
            Handle::current(),
            processor,
        );
        batcher.queue_all(0..6);

        assert_eq!(rx.recv().await.unwrap(), vec![0, 1]);
        assert_eq!(rx.recv().await.unwrap(), vec![2, 3]);
        assert_eq!(rx.recv().await.unwrap(), vec![4, 5]);
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
