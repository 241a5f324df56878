use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const BYTES_PER_KIB: u64 = 1024;

#[derive(Debug)]
struct LimiterState {
    start: Instant,
    bytes_consumed: u128,
}

/// Process-local byte-rate limiter shared by every upload of a job, so the
/// aggregate rate across destinations stays under the configured ceiling.
#[derive(Debug)]
pub struct ByteRateLimiter {
    bytes_per_sec: u64,
    state: Mutex<LimiterState>,
}

impl ByteRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(LimiterState {
                start: Instant::now(),
                bytes_consumed: 0,
            }),
        }
    }

    /// `None` when `kib_per_sec` is zero (unlimited).
    pub fn from_kib_per_sec(kib_per_sec: u64) -> Option<Arc<Self>> {
        if kib_per_sec == 0 {
            None
        } else {
            Some(Arc::new(Self::new(kib_per_sec.saturating_mul(BYTES_PER_KIB))))
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Account for `bytes` and block until the average rate is back under the limit.
    pub fn consume(&self, bytes: usize) {
        if bytes == 0 || self.bytes_per_sec == 0 {
            return;
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.bytes_consumed = state.bytes_consumed.saturating_add(bytes as u128);

        let elapsed_secs = state.start.elapsed().as_secs_f64();
        let expected_secs = state.bytes_consumed as f64 / self.bytes_per_sec as f64;
        if expected_secs > elapsed_secs {
            std::thread::sleep(Duration::from_secs_f64(expected_secs - elapsed_secs));
        }
    }
}

/// Reader adapter that charges every byte read against a shared limiter.
pub struct ThrottledReader<R> {
    inner: R,
    limiter: Option<Arc<ByteRateLimiter>>,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, limiter: Option<Arc<ByteRateLimiter>>) -> Self {
        Self { inner, limiter }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(limiter) = &self.limiter {
            limiter.consume(n);
        }
        Ok(n)
    }
}
