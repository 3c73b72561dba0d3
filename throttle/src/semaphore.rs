use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket over a tokio semaphore. Disabled until [`setup`] is called
/// with a non-zero budget; while disabled every consume is free.
///
/// [`setup`]: TokenBucket::setup
pub struct TokenBucket {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
    cap: std::sync::atomic::AtomicUsize,
}

impl TokenBucket {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(tokio::sync::Semaphore::MAX_PERMITS),
            cap: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Arm the bucket with an initial budget; the budget is also the cap
    /// the replenish loop fills back up to.
    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        self.cap.store(value, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub async fn consume_many(&self, value: u32) {
        if self.flag.load(Ordering::Acquire) {
            self.sem.acquire_many(value).await.unwrap().forget();
        }
    }

    /// Top the bucket back up to its cap every `interval`.
    pub async fn run_replenish_loop(&self, interval: std::time::Duration) {
        if !self.flag.load(Ordering::Acquire) {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let cap = self.cap.load(Ordering::Acquire);
            let curr_permits = self.sem.available_permits();
            if curr_permits >= cap {
                continue;
            }
            self.sem.add_permits(cap - curr_permits);
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
