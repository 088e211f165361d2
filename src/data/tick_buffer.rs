/// Bounded single-producer single-consumer tick queue with TTL eviction and
/// a never-blocks-the-producer overflow policy.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::types::Tick;

pub type OverflowCallback = Arc<dyn Fn(&Tick) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TickBufferStats {
    pub current_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub evicted: u64,
}

struct Inner {
    queue: VecDeque<Tick>,
    insertion_times: VecDeque<DateTime<Utc>>,
}

/// Bounded FIFO queue of ticks. Capacity (default 10k) is a hard bound; TTL
/// (default 60s) is a soft guard evicted lazily by `auto_flush`.
pub struct TickBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    notify: Notify,
    overflow_callback: Option<OverflowCallback>,

    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl TickBuffer {
    pub fn new(capacity: usize, ttl_seconds: u64) -> Self {
        TickBuffer {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                insertion_times: VecDeque::with_capacity(capacity),
            }),
            capacity,
            ttl: Duration::seconds(ttl_seconds as i64),
            notify: Notify::new(),
            overflow_callback: None,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn with_overflow_callback(mut self, callback: OverflowCallback) -> Self {
        self.overflow_callback = Some(callback);
        self
    }

    /// Enqueue a tick. Never blocks the producer: on a full queue it first
    /// attempts an emergency TTL flush, retries once, and on continued
    /// failure drops the tick, incrementing the dropped counter and invoking
    /// the overflow callback if one was registered. Returns true if the tick
    /// was enqueued, false if it was dropped.
    pub async fn enqueue(&self, tick: Tick) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.queue.len() >= self.capacity {
            Self::flush_old_locked(&mut inner, self.ttl, &self.evicted);
        }

        if inner.queue.len() >= self.capacity {
            warn!(symbol = %tick.symbol, "tick buffer full, dropping tick");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(cb) = &self.overflow_callback {
                cb(&tick);
            }
            return false;
        }

        inner.queue.push_back(tick);
        inner.insertion_times.push_back(Utc::now());
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Dequeue the oldest tick, waiting up to `timeout` if the queue is empty.
    /// Returns `None` on timeout.
    pub async fn dequeue(&self, timeout: Option<StdDuration>) -> Option<Tick> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(tick) = inner.queue.pop_front() {
                    if !inner.insertion_times.is_empty() {
                        inner.insertion_times.pop_front();
                    }
                    self.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(tick);
                }
            }

            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, self.notify.notified()).await.is_err() {
                        return None;
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Periodically evict aged insertion-time records. Eviction removes only
    /// the age record, not the tick itself — a stale tick still reaches the
    /// consumer via `dequeue`, which may choose to discard it.
    pub async fn auto_flush(&self, interval: StdDuration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut inner = self.inner.lock().await;
            Self::flush_old_locked(&mut inner, self.ttl, &self.evicted);
        }
    }

    fn flush_old_locked(inner: &mut Inner, ttl: Duration, evicted: &AtomicU64) {
        let cutoff = Utc::now() - ttl;
        while let Some(&oldest) = inner.insertion_times.front() {
            if oldest < cutoff {
                inner.insertion_times.pop_front();
                evicted.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    pub async fn stats(&self) -> TickBufferStats {
        let inner = self.inner.lock().await;
        let current_size = inner.queue.len();
        TickBufferStats {
            current_size,
            max_size: self.capacity,
            utilization: current_size as f64 / self.capacity as f64,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.queue.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.inner.lock().await.queue.len() >= self.capacity
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Wait for the queue to fully drain, used during shutdown.
    pub async fn shutdown(&self) {
        loop {
            if self.is_empty().await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, seq: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price: dec!(100) + decimal_from(seq),
            size: 1,
            timestamp: Utc::now(),
            exchange: "CME".to_string(),
        }
    }

    fn decimal_from(seq: i64) -> rust_decimal::Decimal {
        rust_decimal::Decimal::from(seq)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_preserves_fifo() {
        let buf = TickBuffer::new(10, 60);
        for i in 0..5 {
            assert!(buf.enqueue(tick("NQ", i)).await);
        }
        for i in 0..5 {
            let t = buf.dequeue(None).await.unwrap();
            assert_eq!(t.price, dec!(100) + decimal_from(i));
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_and_preserves_order() {
        let buf = TickBuffer::new(4, 60);
        for i in 0..4 {
            assert!(buf.enqueue(tick("NQ", i)).await);
        }
        // queue is full and nothing has been drained; this tick is dropped.
        assert!(!buf.enqueue(tick("NQ", 99)).await);

        let stats = buf.stats().await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.current_size, 4);

        let first = buf.dequeue(None).await.unwrap();
        assert_eq!(first.price, dec!(100));
    }

    #[tokio::test]
    async fn test_dequeue_timeout_on_empty_queue() {
        let buf = TickBuffer::new(4, 60);
        let result = buf.dequeue(Some(StdDuration::from_millis(20))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_overflow_callback_invoked() {
        let flagged = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flagged_clone = Arc::clone(&flagged);
        let buf = TickBuffer::new(1, 60).with_overflow_callback(Arc::new(move |_tick| {
            flagged_clone.store(true, Ordering::SeqCst);
        }));
        assert!(buf.enqueue(tick("NQ", 0)).await);
        assert!(!buf.enqueue(tick("NQ", 1)).await);
        assert!(flagged.load(Ordering::SeqCst));
    }
}
