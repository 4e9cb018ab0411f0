//! Concurrency and throughput gates shared by recovery and compaction.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counting semaphore bounding how many threads run a section at once.
///
/// Used as the open limiter (segment replay during recovery) and the
/// compaction limiter (parallel partition flushes).
#[derive(Debug)]
pub(crate) struct Limiter {
    available: Mutex<usize>,
    cv: Condvar,
}

impl Limiter {
    /// Creates a limiter with `n` permits; `n` is clamped to at least 1.
    pub fn new(n: usize) -> Self {
        Limiter {
            available: Mutex::new(n.max(1)),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a permit is available. The permit is released on drop.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .cv
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        Permit { limiter: self }
    }
}

#[derive(Debug)]
pub(crate) struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self
            .limiter
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.limiter.cv.notify_one();
    }
}

/// Token-bucket rate limiter for bytes written during compaction.
///
/// `take` blocks the calling thread until the requested number of tokens has
/// accumulated. Requests larger than the burst size are satisfied at the burst
/// boundary so a single oversized write cannot stall forever.
#[derive(Debug)]
pub(crate) struct ThroughputLimiter {
    rate: u64,
    burst: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl ThroughputLimiter {
    /// `rate` is in bytes per second; the bucket holds at most one second of
    /// tokens.
    pub fn new(rate: u64) -> Self {
        let rate = rate.max(1);
        ThroughputLimiter {
            rate,
            burst: rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn take(&self, bytes: u64) {
        let mut need = bytes.min(self.burst) as f64;
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.burst as f64);
                bucket.refilled_at = now;

                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return;
                }
                need -= bucket.tokens;
                bucket.tokens = 0.0;
                Duration::from_secs_f64(need / self.rate as f64)
            };
            std::thread::sleep(wait.min(Duration::from_millis(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_limiter_bounds_concurrency() {
        let limiter = Arc::new(Limiter::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                let _permit = limiter.acquire();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "more than 2 permits held");
    }

    #[test]
    fn test_throughput_limiter_paces_writes() {
        // 1 MiB/s with an initial full bucket: the first 1 MiB is free, the
        // next 512 KiB must wait roughly half a second.
        let limiter = ThroughputLimiter::new(1024 * 1024);
        limiter.take(1024 * 1024);

        let start = Instant::now();
        limiter.take(512 * 1024);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_throughput_limiter_clamps_oversized_requests() {
        let limiter = ThroughputLimiter::new(1024);
        // Far more than one second of tokens; must not block forever.
        limiter.take(u64::MAX);
    }
}
