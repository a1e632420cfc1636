// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Token-bucket rate limiter gating aggregate TCP output (§4.7, §6's
// `sendBytesPerSec`/`sendBytesBurst`).

use std::sync::Mutex;
use std::time::Instant;

struct State {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: `rate` bytes/sec refill, capped at `burst` bytes.
/// `rate == 0` disables limiting entirely (`take` always succeeds).
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64, burst_bytes: u64) -> Self {
        let burst = if burst_bytes == 0 {
            bytes_per_sec.max(1) as f64
        } else {
            burst_bytes as f64
        };
        Self {
            rate: bytes_per_sec as f64,
            burst,
            state: Mutex::new(State {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    fn refill(&self, state: &mut State) {
        if self.rate <= 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Try to withdraw `bytes` tokens. Returns `true` if allowed
    /// immediately, `false` if the caller should wait and retry.
    pub fn try_take(&self, bytes: usize) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}
