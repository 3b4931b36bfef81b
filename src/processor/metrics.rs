use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Lock-free processor counters
pub(crate) struct ProcessorMetrics {
    pub(crate) enqueued: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    /// Running mean of successful processing time, as f64 bits
    average_ms_bits: AtomicU64,
    started_at: Instant,
}

impl ProcessorMetrics {
    pub(crate) fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            average_ms_bits: AtomicU64::new(0f64.to_bits()),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, elapsed: Duration) {
        let n = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        let sample = elapsed.as_secs_f64() * 1000.0;
        let _ = self
            .average_ms_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = f64::from_bits(bits);
                Some((avg + (sample - avg) / n as f64).to_bits())
            });
    }

    pub(crate) fn average_processing_ms(&self) -> f64 {
        f64::from_bits(self.average_ms_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Successful tasks per second since construction
    pub(crate) fn throughput(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.processed.load(Ordering::Relaxed) as f64 / secs
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
