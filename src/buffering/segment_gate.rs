//! Token gate: a syntax-aware pre-buffer in front of the trace accumulator.
//!
//! The gate does not interpret meaning. It only decides when enough structure
//! has accumulated in a producer's token stream to pass it upstream as one
//! chunk. Flush triggers, in priority order:
//!   1. accumulated tokens >= `max_tokens` (hard cap)
//!   2. accumulated tokens >= `min_tokens` and the latest token ends in a
//!      boundary cue
//!   3. no token for `silence_timer` (checked on arrival and by timer ticks)
//!   4. `max_wait_timeout` elapsed since the first buffered token

use crate::config::GateConfig;
use crate::{validate_producer_id, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Why a chunk left the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    MaxTokens,
    Boundary,
    Silence,
    MaxWait,
    Forced,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushReason::MaxTokens => write!(f, "max_tokens"),
            FlushReason::Boundary => write!(f, "boundary"),
            FlushReason::Silence => write!(f, "silence"),
            FlushReason::MaxWait => write!(f, "max_wait"),
            FlushReason::Forced => write!(f, "forced"),
        }
    }
}

/// A chunk emitted by the gate for one producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFlush {
    pub producer_id: String,
    pub chunk: String,
    pub token_count: usize,
    pub reason: FlushReason,
}

/// Per-producer accumulation state
#[derive(Debug, Clone)]
struct GateState {
    text: String,
    token_count: usize,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
    /// Last time this producer did anything (kept across flushes, for eviction)
    last_seen: Instant,
}

impl GateState {
    fn new(now: Instant) -> Self {
        Self {
            text: String::new(),
            token_count: 0,
            first_token_at: None,
            last_token_at: None,
            last_seen: now,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn push(&mut self, token: &str, now: Instant) {
        self.text.push_str(token);
        self.token_count += count_tokens(token);
        self.first_token_at.get_or_insert(now);
        self.last_token_at = Some(now);
        self.last_seen = now;
    }

    fn take(&mut self, producer_id: &str, reason: FlushReason) -> GateFlush {
        let flush = GateFlush {
            producer_id: producer_id.to_string(),
            chunk: std::mem::take(&mut self.text),
            token_count: self.token_count,
            reason,
        };
        self.token_count = 0;
        self.first_token_at = None;
        self.last_token_at = None;
        flush
    }
}

/// Approximate token count of one streamed fragment: whitespace-delimited
/// words, never less than one.
pub fn count_tokens(token: &str) -> usize {
    token.split_whitespace().count().max(1)
}

/// Regulates per-producer token streams into segment-sized chunks
#[derive(Debug)]
pub struct SegmentGate {
    config: GateConfig,
    silence_timer: Duration,
    max_wait_timeout: Duration,
    states: HashMap<String, GateState>,
}

impl SegmentGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            silence_timer: config.silence_timer(),
            max_wait_timeout: config.max_wait_timeout(),
            config,
            states: HashMap::new(),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Add a token for `producer_id`, returning a chunk if a flush triggered.
    pub fn add_token(&mut self, producer_id: &str, token: &str) -> Result<Option<GateFlush>> {
        self.add_token_at(producer_id, token, Instant::now())
    }

    /// [`add_token`](Self::add_token) with an explicit clock reading.
    pub fn add_token_at(
        &mut self,
        producer_id: &str,
        token: &str,
        now: Instant,
    ) -> Result<Option<GateFlush>> {
        validate_producer_id(producer_id)?;

        let silence_timer = self.silence_timer;
        let state = self
            .states
            .entry(producer_id.to_string())
            .or_insert_with(|| GateState::new(now));

        // A gap since the previous token closes the old segment; the new
        // token opens a fresh one.
        let silence_expired = !state.is_empty()
            && state
                .last_token_at
                .is_some_and(|last| now.saturating_duration_since(last) >= silence_timer);
        if silence_expired {
            let flush = state.take(producer_id, FlushReason::Silence);
            state.push(token, now);
            log_flush(&flush);
            return Ok(Some(flush));
        }

        state.push(token, now);

        let reason = if state.token_count >= self.config.max_tokens {
            Some(FlushReason::MaxTokens)
        } else if state.token_count >= self.config.min_tokens
            && ends_with_cue(token, &self.config.boundary_cues)
        {
            Some(FlushReason::Boundary)
        } else if state
            .first_token_at
            .is_some_and(|first| now.saturating_duration_since(first) >= self.max_wait_timeout)
        {
            Some(FlushReason::MaxWait)
        } else {
            None
        };

        Ok(reason.map(|reason| {
            let flush = state.take(producer_id, reason);
            log_flush(&flush);
            flush
        }))
    }

    /// Force-flush a producer's buffer regardless of thresholds.
    /// Returns `None` (and changes nothing) when the buffer is empty.
    pub fn flush(&mut self, producer_id: &str) -> Option<GateFlush> {
        let state = self.states.get_mut(producer_id)?;
        if state.is_empty() {
            return None;
        }
        let flush = state.take(producer_id, FlushReason::Forced);
        log_flush(&flush);
        Some(flush)
    }

    /// Re-evaluate the silence and max-wait timers without a new token.
    pub fn check_timers(&mut self, producer_id: &str) -> Option<GateFlush> {
        self.check_timers_at(producer_id, Instant::now())
    }

    /// [`check_timers`](Self::check_timers) with an explicit clock reading.
    pub fn check_timers_at(&mut self, producer_id: &str, now: Instant) -> Option<GateFlush> {
        let (silence_timer, max_wait_timeout) = (self.silence_timer, self.max_wait_timeout);
        let state = self.states.get_mut(producer_id)?;
        let reason = expired_timer(state, now, silence_timer, max_wait_timeout)?;
        let flush = state.take(producer_id, reason);
        log_flush(&flush);
        Some(flush)
    }

    /// Check timers for every known producer.
    pub fn check_all_timers_at(&mut self, now: Instant) -> Vec<GateFlush> {
        let (silence_timer, max_wait_timeout) = (self.silence_timer, self.max_wait_timeout);
        let mut flushes = Vec::new();
        for (producer_id, state) in self.states.iter_mut() {
            if let Some(reason) = expired_timer(state, now, silence_timer, max_wait_timeout) {
                let flush = state.take(producer_id, reason);
                log_flush(&flush);
                flushes.push(flush);
            }
        }
        flushes
    }

    /// Drop state for producers with an empty buffer that have been idle for
    /// at least `ttl`. Producers holding unflushed text are never evicted.
    pub fn evict_idle_at(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.states.retain(|producer_id, state| {
            let idle = now.saturating_duration_since(state.last_seen) >= ttl;
            if idle && state.is_empty() {
                evicted.push(producer_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Tokens accumulated for a producer since its last flush
    pub fn pending_tokens(&self, producer_id: &str) -> usize {
        self.states.get(producer_id).map_or(0, |s| s.token_count)
    }

    /// Text accumulated for a producer since its last flush
    pub fn pending_text(&self, producer_id: &str) -> Option<&str> {
        self.states
            .get(producer_id)
            .filter(|s| !s.is_empty())
            .map(|s| s.text.as_str())
    }

    /// Number of producers with gate state
    pub fn producer_count(&self) -> usize {
        self.states.len()
    }
}

fn expired_timer(
    state: &GateState,
    now: Instant,
    silence_timer: Duration,
    max_wait_timeout: Duration,
) -> Option<FlushReason> {
    if state.is_empty() {
        return None;
    }
    if state
        .last_token_at
        .is_some_and(|last| now.saturating_duration_since(last) >= silence_timer)
    {
        return Some(FlushReason::Silence);
    }
    if state
        .first_token_at
        .is_some_and(|first| now.saturating_duration_since(first) >= max_wait_timeout)
    {
        return Some(FlushReason::MaxWait);
    }
    None
}

/// True if the token's last character (or last non-whitespace character) is
/// one of the boundary cues.
fn ends_with_cue(token: &str, cues: &str) -> bool {
    let is_cue = |c: char| cues.contains(c);
    token.chars().next_back().is_some_and(is_cue)
        || token.trim_end().chars().next_back().is_some_and(is_cue)
}

fn log_flush(flush: &GateFlush) {
    debug!(
        producer = %flush.producer_id,
        reason = %flush.reason,
        tokens = flush.token_count,
        "Gate flushed chunk of {} bytes",
        flush.chunk.len()
    );
}
