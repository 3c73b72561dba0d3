//! Transfer rate pacing.
//!
//! The rate-capped transfer method paces its writes through a [`RateGate`]
//! so a queue never exceeds its configured Mbps on the wire.

mod semaphore;

pub use semaphore::TokenBucket;

/// Token granularity; keeps permit counts well inside the semaphore range
/// for multi-gigabyte files.
const TOKEN_BYTES: u64 = 1024;

/// Replenish interval for the pacing loop.
const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

/// Paces byte consumption at a fixed Mbps budget.
///
/// Dropping the gate stops the replenish task.
pub struct RateGate {
    bucket: std::sync::Arc<TokenBucket>,
    /// Per-interval token budget; single acquires are broken up at this
    /// size so they can never outgrow the bucket.
    interval_tokens: u64,
    replenisher: tokio::task::JoinHandle<()>,
}

impl RateGate {
    /// A gate for `rate_mbps` megabits per second; `None` when the rate is
    /// zero (uncapped). Must be created inside a tokio runtime.
    pub fn mbps(rate_mbps: u32) -> Option<Self> {
        if rate_mbps == 0 {
            return None;
        }
        let bytes_per_sec = rate_mbps as u64 * 1_000_000 / 8;
        let tokens_per_interval = (bytes_per_sec / TOKEN_BYTES
            * REPLENISH_INTERVAL.as_millis() as u64
            / 1000)
            .max(1) as usize;
        let bucket = std::sync::Arc::new(TokenBucket::new());
        bucket.setup(tokens_per_interval);
        let replenisher = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                bucket.run_replenish_loop(REPLENISH_INTERVAL).await;
            })
        };
        Some(Self {
            bucket,
            interval_tokens: tokens_per_interval as u64,
            replenisher,
        })
    }

    /// Block until `bytes` may go on the wire.
    pub async fn acquire(&self, bytes: u64) {
        let tokens = bytes.div_ceil(TOKEN_BYTES);
        // a block larger than one interval's budget is consumed in steps
        let mut remaining = tokens;
        while remaining > 0 {
            let step = remaining.min(self.interval_tokens) as u32;
            self.bucket.consume_many(step).await;
            remaining -= step as u64;
        }
    }
}

impl Drop for RateGate {
    fn drop(&mut self) {
        self.replenisher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rate_means_no_gate() {
        assert!(RateGate::mbps(0).is_none());
    }

    #[tokio::test]
    async fn gate_paces_consumption() {
        // 8 Mbps = 1 MB/s = ~20 KiB per 20ms interval
        let gate = RateGate::mbps(8).unwrap();
        let start = std::time::Instant::now();
        // first interval's budget is free; the next acquires must wait for
        // at least one replenish tick
        gate.acquire(20 * 1024).await;
        gate.acquire(20 * 1024).await;
        gate.acquire(20 * 1024).await;
        assert!(start.elapsed() >= REPLENISH_INTERVAL);
    }

    #[tokio::test]
    async fn uncapped_bucket_is_free() {
        let bucket = TokenBucket::new();
        // never armed, so consuming is immediate
        bucket.consume_many(1_000_000).await;
    }
}
