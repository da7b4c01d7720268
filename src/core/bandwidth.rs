/*!
 * Bandwidth throttling utilities with token bucket rate limiting
 */

use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::io::{self, Read};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;

/// Target refill granularity
const TOKENS_PER_SEC: u64 = 1000;

/// Largest single read a throttled stream hands out before asking for tokens
pub const THROTTLE_QUANTUM: usize = 64 * 1024;

/// Bandwidth rate limiter using a token bucket.
///
/// Clones share one bucket, so a single limiter handed to every worker of a
/// transfer (or every transfer of a client) caps their aggregate throughput.
#[derive(Clone)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    clock: DefaultClock,
    bytes_per_token: u64,
    tokens_per_sec: u32,
    burst_tokens: u32,
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("enabled", &self.is_enabled())
            .field("bytes_per_sec", &self.bytes_per_sec())
            .field("burst_bytes", &self.burst_bytes())
            .finish()
    }
}

impl BandwidthLimiter {
    /// Create a new bandwidth limiter
    ///
    /// # Arguments
    /// * `max_bytes_per_sec` - Maximum bytes per second (0 = unlimited)
    ///
    /// The bucket holds a tenth of a second of traffic.
    pub fn new(max_bytes_per_sec: u64) -> Self {
        Self::with_burst(max_bytes_per_sec, max_bytes_per_sec / 10)
    }

    /// Create a limiter with an explicit bucket capacity in bytes
    pub fn with_burst(max_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        if max_bytes_per_sec == 0 {
            return Self::unlimited();
        }

        // Each token is a fixed byte quantum; the effective rate rounds down
        // so it never exceeds the requested one.
        let bytes_per_token = (max_bytes_per_sec / TOKENS_PER_SEC).max(1);
        let tokens_per_sec = clamp_u32(max_bytes_per_sec / bytes_per_token);
        let burst_tokens = clamp_u32(burst_bytes / bytes_per_token);

        let quota = Quota::per_second(tokens_per_sec).allow_burst(burst_tokens);

        Self {
            limiter: Some(Arc::new(GovernorRateLimiter::direct(quota))),
            clock: DefaultClock::default(),
            bytes_per_token,
            tokens_per_sec: tokens_per_sec.get(),
            burst_tokens: burst_tokens.get(),
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            clock: DefaultClock::default(),
            bytes_per_token: 0,
            tokens_per_sec: 0,
            burst_tokens: 0,
        }
    }

    /// Block until `bytes` may be transferred
    pub fn wait_for_capacity(&self, bytes: u64) {
        let Some(ref limiter) = self.limiter else {
            return;
        };
        if bytes == 0 {
            return;
        }

        let mut remaining = bytes.div_ceil(self.bytes_per_token);
        while remaining > 0 {
            // Requests larger than the bucket are debited in bucket-sized batches
            let batch = remaining.min(self.burst_tokens as u64) as u32;
            let Some(tokens) = NonZeroU32::new(batch) else {
                return;
            };
            loop {
                match limiter.check_n(tokens) {
                    Ok(Ok(())) => break,
                    Ok(Err(not_until)) => {
                        thread::sleep(not_until.wait_time_from(self.clock.now()));
                    }
                    // batch never exceeds the bucket capacity
                    Err(_) => return,
                }
            }
            remaining -= batch as u64;
        }
    }

    /// Check if bandwidth limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Effective sustained rate (0 = unlimited)
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_token * self.tokens_per_sec as u64
    }

    /// Bucket capacity in bytes
    pub fn burst_bytes(&self) -> u64 {
        self.burst_tokens as u64 * self.bytes_per_token
    }

    /// Wrap a reader so every chunk it yields is paid for with tokens
    pub fn throttle<R: Read>(&self, inner: R) -> ThrottledReader<R> {
        ThrottledReader::new(inner, self.clone())
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn clamp_u32(value: u64) -> NonZeroU32 {
    NonZeroU32::new(value.clamp(1, u32::MAX as u64) as u32).unwrap_or(NonZeroU32::MIN)
}

/// Reader that debits the shared bucket for every chunk it returns
pub struct ThrottledReader<R> {
    inner: R,
    limiter: BandwidthLimiter,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, limiter: BandwidthLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(THROTTLE_QUANTUM);
        let n = self.inner.read(&mut buf[..len])?;
        self.limiter.wait_for_capacity(n as u64);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    #[test]
    fn test_limiter_creation_unlimited() {
        let limiter = BandwidthLimiter::new(0);
        assert!(!limiter.is_enabled());
        assert_eq!(limiter.bytes_per_sec(), 0);
    }

    #[test]
    fn test_limiter_creation_limited() {
        let limiter = BandwidthLimiter::new(1_048_576); // 1 MB/s
        assert!(limiter.is_enabled());
        assert!(limiter.bytes_per_sec() <= 1_048_576);
        assert!(limiter.burst_bytes() <= 1_048_576 / 10);
    }

    #[test]
    fn test_low_rate_uses_byte_tokens() {
        let limiter = BandwidthLimiter::new(500);
        assert_eq!(limiter.bytes_per_sec(), 500);
        assert_eq!(limiter.burst_bytes(), 50);
    }

    #[test]
    fn test_limiter_wait() {
        let limiter = BandwidthLimiter::new(10_485_760); // 10 MB/s
        let start = Instant::now();
        limiter.wait_for_capacity(1024);
        // Should complete quickly for small amounts
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_unlimited_no_wait() {
        let limiter = BandwidthLimiter::new(0);
        let start = Instant::now();
        limiter.wait_for_capacity(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_throttled_reader_passes_bytes_through() {
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let limiter = BandwidthLimiter::new(100 * 1024 * 1024);
        let mut reader = limiter.throttle(Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_shared_bucket_lower_bound() {
        // 4 threads x 64 KiB against 512 KiB/s must take at least ~0.4s
        let rate = 512 * 1024u64;
        let limiter = BandwidthLimiter::new(rate);
        let start = Instant::now();

        thread::scope(|scope| {
            for _ in 0..4 {
                let limiter = limiter.clone();
                scope.spawn(move || {
                    for _ in 0..4 {
                        limiter.wait_for_capacity(16 * 1024);
                    }
                });
            }
        });

        let total = 4 * 4 * 16 * 1024u64;
        let expected =
            Duration::from_secs_f64((total - limiter.burst_bytes()) as f64 / rate as f64);
        assert!(
            start.elapsed() >= expected.mul_f32(0.9),
            "elapsed {:?} shorter than {:?}",
            start.elapsed(),
            expected
        );
    }
}
