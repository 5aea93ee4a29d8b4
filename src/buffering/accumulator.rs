//! Trace accumulator: a single ordered buffer of traces from all producers.
//!
//! Every accepted trace is appended and the decision oracle is asked whether
//! the buffer is ready for summarization. The accumulator never clears itself;
//! the coordinator flushes after a positive verdict.
//!
//! Producer identity is kept as a structured field and only rendered into the
//! `| producer | text` tag when text is handed to an oracle.

use crate::config::AccumulatorConfig;
use crate::oracle::DecisionOracle;
use crate::{validate_producer_id, Result, TracegateError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Placeholder handed to the decision oracle when the buffer was empty
pub const NO_PREVIOUS_TRACES: &str = "(no previous traces)";

/// One trace waiting in the shared buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedTrace {
    pub producer_id: String,
    pub text: String,
}

impl BufferedTrace {
    /// Render as the tagged line oracles see
    pub fn tagged(&self) -> String {
        format!("| {} | {}", self.producer_id, self.text)
    }
}

/// Log entry for an accepted trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Per-producer sequence number, starting at 1
    pub seq: u64,
    pub text: String,
    /// Length of the trace text in characters
    pub length: usize,
    pub received_at: DateTime<Utc>,
}

impl TraceRecord {
    pub fn to_log_line(&self) -> String {
        format!(
            "| Timestamp: {} | Trace Length: {} | {}",
            self.received_at.format("%Y-%m-%d %H:%M:%S"),
            self.length,
            self.text
        )
    }
}

/// A trace already in the buffer, waiting for its flush verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedTrace {
    pub producer_id: String,
    /// Tagged buffer contents before this trace, or [`NO_PREVIOUS_TRACES`]
    pub previous: String,
    pub tagged: String,
    was_empty: bool,
}

#[derive(Debug)]
struct ProducerLog {
    count: u64,
    traces: VecDeque<TraceRecord>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    buffer: Vec<BufferedTrace>,
    producers: HashMap<String, ProducerLog>,
}

/// Shared trace buffer with oracle-driven flush decisions
pub struct TraceAccumulator {
    oracle: Arc<dyn DecisionOracle>,
    config: AccumulatorConfig,
    state: Mutex<AccumulatorState>,
}

impl TraceAccumulator {
    pub fn new(oracle: Arc<dyn DecisionOracle>, config: AccumulatorConfig) -> Self {
        Self {
            oracle,
            config,
            state: Mutex::new(AccumulatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccumulatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept a chunk from `producer_id` and return the flush verdict.
    ///
    /// The trace count is incremented and the chunk appended before the
    /// oracle is consulted, so both stand even if the oracle call fails.
    pub async fn add_chunk(&self, producer_id: &str, chunk: &str) -> Result<bool> {
        let appended = self.append(producer_id, chunk)?;
        self.decide(&appended).await
    }

    /// Record and buffer a chunk without consulting the oracle.
    ///
    /// Callers that must keep buffer order aligned with another lock append
    /// under that lock and [`decide`](Self::decide) after releasing it.
    pub fn append(&self, producer_id: &str, chunk: &str) -> Result<AppendedTrace> {
        validate_producer_id(producer_id)?;
        if chunk.trim().is_empty() {
            return Err(TracegateError::InvalidInput(format!(
                "empty trace from producer '{producer_id}'"
            )));
        }

        let trace = BufferedTrace {
            producer_id: producer_id.to_string(),
            text: chunk.to_string(),
        };
        let tagged = trace.tagged();

        let mut state = self.lock();
        self.record_trace(&mut state, producer_id, chunk);

        let was_empty = state.buffer.is_empty();
        let previous = if was_empty {
            NO_PREVIOUS_TRACES.to_string()
        } else {
            state
                .buffer
                .iter()
                .map(BufferedTrace::tagged)
                .collect::<Vec<_>>()
                .join("\n")
        };
        state.buffer.push(trace);

        Ok(AppendedTrace {
            producer_id: producer_id.to_string(),
            previous,
            tagged,
            was_empty,
        })
    }

    /// Flush verdict for a trace returned by [`append`](Self::append)
    pub async fn decide(&self, appended: &AppendedTrace) -> Result<bool> {
        if appended.was_empty && self.config.always_flush_first {
            debug!(producer = %appended.producer_id, "First trace into a cold buffer, flushing");
            return Ok(true);
        }

        let verdict = self
            .oracle
            .decide(&appended.previous, &appended.tagged)
            .await?;
        debug!(producer = %appended.producer_id, verdict, "Decision oracle verdict");
        Ok(verdict)
    }

    fn record_trace(&self, state: &mut AccumulatorState, producer_id: &str, chunk: &str) {
        let log = state
            .producers
            .entry(producer_id.to_string())
            .or_insert_with(|| ProducerLog {
                count: 0,
                traces: VecDeque::new(),
                last_seen: Instant::now(),
            });
        log.count += 1;
        log.last_seen = Instant::now();
        log.traces.push_back(TraceRecord {
            seq: log.count,
            text: chunk.to_string(),
            length: chunk.chars().count(),
            received_at: Utc::now(),
        });
        while log.traces.len() > self.config.max_traces_per_producer {
            log.traces.pop_front();
        }
    }

    /// Snapshot of the buffer as tagged lines, without clearing it
    pub fn peek(&self) -> Vec<String> {
        self.lock().buffer.iter().map(BufferedTrace::tagged).collect()
    }

    /// Return the buffer as tagged lines and clear it
    pub fn flush(&self) -> Vec<String> {
        self.flush_batch().iter().map(BufferedTrace::tagged).collect()
    }

    /// Return the buffered traces and clear the buffer
    pub fn flush_batch(&self) -> Vec<BufferedTrace> {
        std::mem::take(&mut self.lock().buffer)
    }

    /// Put a previously flushed batch back at the front of the buffer,
    /// ahead of anything appended since the flush.
    pub fn restore(&self, batch: Vec<BufferedTrace>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.lock();
        info!("Restoring {} traces to the buffer", batch.len());
        let newer = std::mem::replace(&mut state.buffer, batch);
        state.buffer.extend(newer);
    }

    pub fn buffer_len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// Total traces ever accepted from a producer (0 if never seen)
    pub fn trace_count(&self, producer_id: &str) -> u64 {
        self.lock().producers.get(producer_id).map_or(0, |log| log.count)
    }

    /// Retained trace log of a producer, oldest first
    pub fn traces(&self, producer_id: &str) -> Vec<TraceRecord> {
        self.lock()
            .producers
            .get(producer_id)
            .map(|log| log.traces.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Producers with bookkeeping entries
    pub fn producers(&self) -> Vec<String> {
        let mut producers: Vec<String> = self.lock().producers.keys().cloned().collect();
        producers.sort();
        producers
    }

    /// Forget producers idle for at least `ttl` that have nothing waiting in
    /// the buffer. Their trace counts restart from zero if they return.
    pub fn evict_idle_at(&self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut state = self.lock();
        let AccumulatorState { buffer, producers } = &mut *state;
        let mut evicted = Vec::new();
        producers.retain(|producer_id, log| {
            let idle = now.saturating_duration_since(log.last_seen) >= ttl;
            let buffered = buffer.iter().any(|t| &t.producer_id == producer_id);
            if idle && !buffered {
                evicted.push(producer_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }
}
