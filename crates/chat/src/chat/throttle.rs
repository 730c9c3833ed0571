use std::time::Duration;

use tokio::time::Instant;

pub const FLUSH_CHUNK_THRESHOLD: u32 = 3;
pub const FLUSH_INTERVAL_MS: u64 = 150;

/// Cadence at which buffered stream text is committed.
///
/// Both triggers are always active: counting chunks alone stalls on a slow
/// trickle, and time alone over-commits on bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    chunk_threshold: u32,
    interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(
            FLUSH_CHUNK_THRESHOLD,
            Duration::from_millis(FLUSH_INTERVAL_MS),
        )
    }
}

impl FlushPolicy {
    /// A zero threshold is raised to one.
    pub fn new(chunk_threshold: u32, interval: Duration) -> Self {
        Self {
            chunk_threshold: chunk_threshold.max(1),
            interval,
        }
    }

    pub fn chunk_threshold(&self) -> u32 {
        self.chunk_threshold
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// What the consumer should do after a chunk was buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Commit the buffer immediately.
    Now,
    /// Wait for the pending deferred flush, see [`StreamBuffer::pending_flush`].
    Deferred,
}

/// Accumulated text of one stream session plus its flush bookkeeping.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    policy: FlushPolicy,
    text: String,
    chunk_count: u64,
    last_flush: Instant,
    pending_flush: Option<Instant>,
}

impl StreamBuffer {
    /// `started` counts as the first flush so the interval runs from session start.
    pub fn new(policy: FlushPolicy, started: Instant) -> Self {
        Self {
            policy,
            text: String::new(),
            chunk_count: 0,
            last_flush: started,
            pending_flush: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn pending_flush(&self) -> Option<Instant> {
        self.pending_flush
    }

    /// Appends one delta and decides whether it must be committed now.
    ///
    /// When the answer is [`FlushDecision::Now`] the caller commits and then
    /// calls [`StreamBuffer::mark_flushed`]. Otherwise at most one deferred
    /// flush stays scheduled, due one interval after the last flush.
    pub fn push(&mut self, delta: &str, now: Instant) -> FlushDecision {
        self.text.push_str(delta);
        self.chunk_count += 1;

        let threshold_hit = self.chunk_count % u64::from(self.policy.chunk_threshold) == 0;
        let interval_elapsed = now.saturating_duration_since(self.last_flush) >= self.policy.interval;
        if threshold_hit || interval_elapsed {
            return FlushDecision::Now;
        }

        if self.pending_flush.is_none() {
            self.pending_flush = Some(self.last_flush + self.policy.interval);
        }
        FlushDecision::Deferred
    }

    /// Records a commit of the full buffer and cancels any deferred flush.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = now;
        self.pending_flush = None;
    }
}
