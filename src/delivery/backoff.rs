//! Backoff schedule for retries inside one delivery cycle.
//!
//! Everything here is a pure function of the retry number, the time already
//! spent, and a jitter offset, so the schedule can be tested without a clock
//! or a network.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with symmetric jitter, an attempt cap and an elapsed
/// time cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Wait before the first retry, doubled for each retry after it.
    pub min: Duration,
    /// Upper bound for a single wait and for the whole cycle's elapsed time.
    pub max: Duration,
    /// Each wait is moved by a uniform offset in `[-jitter, +jitter]`.
    pub jitter: Duration,
    /// Retries after the first attempt. `2` means at most 3 attempts.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
            max_retries: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Un-jittered wait before retry number `retry` (0-based): `min * 2^retry`,
    /// capped at `max`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Wait before retry number `retry` with `jitter_offset` applied, clamped
    /// to `[0, max]`.
    pub fn delay(&self, retry: u32, jitter_offset: JitterOffset) -> Duration {
        let base = self.base_delay(retry);

        let shifted = match jitter_offset {
            JitterOffset::Later(d) => base.saturating_add(d),
            JitterOffset::Earlier(d) => base.saturating_sub(d),
        };

        shifted.min(self.max)
    }

    /// Draws a jitter offset uniformly from `[-jitter, +jitter]`.
    pub fn sample_jitter(&self, rng: &mut impl Rng) -> JitterOffset {
        let span = self.jitter.as_millis() as i64;
        if span == 0 {
            return JitterOffset::Later(Duration::ZERO);
        }

        let offset = rng.gen_range(-span..=span);
        if offset >= 0 {
            JitterOffset::Later(Duration::from_millis(offset as u64))
        } else {
            JitterOffset::Earlier(Duration::from_millis(offset.unsigned_abs()))
        }
    }

    /// How long to wait before retry number `retry`, or `None` when the cycle
    /// must stop.
    ///
    /// The attempt cap wins over the elapsed cap: if the full wait would run
    /// past `max` total elapsed time, the wait is cut to what is left and the
    /// retry still happens. Only an already exhausted elapsed budget stops the
    /// cycle before the attempt cap does.
    pub fn next_wait(
        &self,
        retry: u32,
        elapsed: Duration,
        jitter_offset: JitterOffset,
    ) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }

        let remaining = self.max.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }

        Some(self.delay(retry, jitter_offset).min(remaining))
    }
}

/// Signed jitter, kept as a direction plus a magnitude since `Duration` is
/// unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterOffset {
    Earlier(Duration),
    Later(Duration),
}

impl JitterOffset {
    pub const NONE: JitterOffset = JitterOffset::Later(Duration::ZERO);
}
