/// Byte-budget token bucket. Refills continuously at `rate_bps / 8` bytes
/// per second up to one burst window's worth of tokens.
pub struct TokenBucket {
    bytes_per_sec: f64,
    burst_bytes: f64,
    tokens: f64,
    updated: f64,
}

impl TokenBucket {
    pub fn new(rate_bps: u64, burst_secs: f64, now: f64) -> Self {
        let bytes_per_sec = rate_bps as f64 / 8.0;
        let burst_bytes = (bytes_per_sec * burst_secs).max(1.0);
        Self { bytes_per_sec, burst_bytes, tokens: burst_bytes, updated: now }
    }

    /// Raises the burst allowance so at least one frame of `bytes` can
    /// ever pass, no matter how narrow the rate is.
    pub fn with_min_burst(mut self, bytes: f64) -> Self {
        if self.burst_bytes < bytes {
            self.burst_bytes = bytes;
            self.tokens = self.tokens.max(bytes);
        }
        self
    }

    fn refill(&mut self, now: f64) {
        if now > self.updated {
            self.tokens =
                (self.tokens + (now - self.updated) * self.bytes_per_sec).min(self.burst_bytes);
            self.updated = now;
        }
    }

    /// Spends `bytes` from the bucket if available.
    pub fn try_consume(&mut self, bytes: usize, now: f64) -> bool {
        self.refill(now);

        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: f64) -> usize {
        self.refill(now);
        self.tokens.max(0.0) as usize
    }
}
