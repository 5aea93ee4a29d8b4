//! Coordinator: routes traces and token streams through the gate and the
//! accumulator, and turns positive verdicts into appended summaries.
//!
//! Locking:
//! - The gate sits behind a `tokio::sync::Mutex`; its critical sections never await.
//!   Chunks it emits are appended to the accumulator before the gate lock is
//!   released, so each producer's traces reach the buffer in emission order.
//! - The accumulator serializes its own buffer; the decision oracle runs unlocked.
//! - A commit lock serializes flush -> summarize -> append, so records land in
//!   flush order and each request sees the correct latest summary.

use crate::buffering::{AppendedTrace, BufferedTrace, GateFlush, SegmentGate, TraceAccumulator, TraceRecord};
use crate::config::{CoordinatorConfig, TracegateConfig};
use crate::history::{HistoryLedger, SummaryRecord};
use crate::oracle::{DecisionOracle, SummarizationOracle, SummaryRequest, NO_SUMMARIES_YET};
use crate::{validate_producer_id, Result};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Entry point for producers
pub struct Coordinator {
    config: CoordinatorConfig,

    /// Token-level pre-buffer (streaming input only)
    gate: Mutex<SegmentGate>,

    /// Shared trace buffer and per-producer counts
    accumulator: TraceAccumulator,

    /// Summary history, only written under `commit`
    ledger: RwLock<HistoryLedger>,

    summarizer: Arc<dyn SummarizationOracle>,

    /// Serializes flush -> summarize -> append
    commit: Mutex<()>,

    /// Every appended record is published here
    summaries_tx: broadcast::Sender<SummaryRecord>,
}

impl Coordinator {
    pub fn new(
        config: &TracegateConfig,
        decision: Arc<dyn DecisionOracle>,
        summarizer: Arc<dyn SummarizationOracle>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = SegmentGate::new(config.gate.clone())?;
        let accumulator = TraceAccumulator::new(decision, config.accumulator.clone());
        let (summaries_tx, _) = broadcast::channel(config.coordinator.broadcast_capacity.max(1));

        Ok(Self {
            config: config.coordinator.clone(),
            gate: Mutex::new(gate),
            accumulator,
            ledger: RwLock::new(HistoryLedger::new()),
            summarizer,
            commit: Mutex::new(()),
            summaries_tx,
        })
    }

    fn ledger(&self) -> RwLockReadGuard<'_, HistoryLedger> {
        self.ledger.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ledger_mut(&self) -> RwLockWriteGuard<'_, HistoryLedger> {
        self.ledger.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept one discrete trace. Returns the summary it triggered, if any.
    pub async fn receive_trace(&self, producer_id: &str, text: &str) -> Result<Option<SummaryRecord>> {
        let appended = self.accumulator.append(producer_id, text)?;
        self.resolve(appended).await
    }

    /// Feed a token stream for one producer through the gate.
    ///
    /// Returns the last summary produced during the call. A trailing partial
    /// chunk stays in the gate when the stream ends; call
    /// [`flush_producer`](Self::flush_producer) to push it through. An error
    /// stops consumption of the rest of the stream.
    pub async fn receive_streamed_tokens<S>(
        &self,
        producer_id: &str,
        tokens: S,
    ) -> Result<Option<SummaryRecord>>
    where
        S: Stream,
        S::Item: AsRef<str>,
    {
        validate_producer_id(producer_id)?;
        tokio::pin!(tokens);

        let mut last = None;
        while let Some(token) = tokens.next().await {
            let staged = {
                let mut gate = self.gate.lock().await;
                match gate.add_token(producer_id, token.as_ref())? {
                    Some(flush) => self.stage_chunk(&flush)?,
                    None => None,
                }
            };
            if let Some(record) = self.settle(staged).await? {
                last = Some(record);
            }
        }
        Ok(last)
    }

    /// Re-check the silence and max-wait timers of one producer.
    pub async fn check_timers(&self, producer_id: &str) -> Result<Option<SummaryRecord>> {
        let staged = {
            let mut gate = self.gate.lock().await;
            match gate.check_timers(producer_id) {
                Some(flush) => self.stage_chunk(&flush)?,
                None => None,
            }
        };
        self.settle(staged).await
    }

    /// Force the producer's partial gate chunk through as a trace.
    pub async fn flush_producer(&self, producer_id: &str) -> Result<Option<SummaryRecord>> {
        let staged = {
            let mut gate = self.gate.lock().await;
            match gate.flush(producer_id) {
                Some(flush) => self.stage_chunk(&flush)?,
                None => None,
            }
        };
        self.settle(staged).await
    }

    /// One timer pass: expire gate timers for every producer, then evict
    /// producers idle past the configured TTL. Every expired chunk is
    /// buffered before any oracle is asked; verdicts are requested
    /// concurrently. Failures are logged, not returned.
    pub async fn tick_at(&self, now: Instant) -> Vec<SummaryRecord> {
        let staged: Vec<AppendedTrace> = {
            let mut gate = self.gate.lock().await;
            gate.check_all_timers_at(now)
                .iter()
                .filter_map(|flush| match self.stage_chunk(flush) {
                    Ok(staged) => staged,
                    Err(e) => {
                        warn!(producer = %flush.producer_id, "Timer flush rejected: {}", e);
                        None
                    }
                })
                .collect()
        };

        let verdicts =
            join_all(staged.iter().map(|appended| self.accumulator.decide(appended))).await;

        let mut records = Vec::new();
        for (appended, verdict) in staged.iter().zip(verdicts) {
            let outcome = match verdict {
                Ok(true) => self.commit_flush(&appended.producer_id).await,
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(producer = %appended.producer_id, "Timer flush failed: {}", e),
            }
        }

        let ttl = self.config.producer_ttl();
        let mut evicted = self.gate.lock().await.evict_idle_at(now, ttl);
        evicted.extend(self.accumulator.evict_idle_at(now, ttl));
        if !evicted.is_empty() {
            evicted.sort();
            evicted.dedup();
            info!("Evicted idle producers: {}", evicted.join(", "));
        }

        records
    }

    pub async fn tick(&self) -> Vec<SummaryRecord> {
        self.tick_at(Instant::now()).await
    }

    /// Run [`tick`](Self::tick) every `timer_tick_ms` until the coordinator
    /// is dropped.
    pub fn spawn_timer_task(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let period = self.config.timer_tick();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    debug!("Coordinator dropped, stopping timer task");
                    break;
                };
                coordinator.tick().await;
            }
        })
    }

    /// Receive every summary appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SummaryRecord> {
        self.summaries_tx.subscribe()
    }

    pub fn get_all_summaries(&self) -> Vec<SummaryRecord> {
        self.ledger().all().to_vec()
    }

    pub fn get_summaries_by_agent(&self, producer_id: &str) -> Vec<SummaryRecord> {
        self.ledger().by_producer(producer_id)
    }

    pub fn latest_summary(&self) -> Option<SummaryRecord> {
        self.ledger().latest().cloned()
    }

    pub fn get_agent_trace_count(&self, producer_id: &str) -> u64 {
        self.accumulator.trace_count(producer_id)
    }

    pub fn get_agent_traces(&self, producer_id: &str) -> Vec<TraceRecord> {
        self.accumulator.traces(producer_id)
    }

    /// Producers with trace bookkeeping, sorted
    pub fn producers(&self) -> Vec<String> {
        self.accumulator.producers()
    }

    /// Tagged traces waiting for the next flush
    pub fn pending_traces(&self) -> Vec<String> {
        self.accumulator.peek()
    }

    /// Tokens held in the gate for a producer
    pub async fn pending_tokens(&self, producer_id: &str) -> usize {
        self.gate.lock().await.pending_tokens(producer_id)
    }

    /// Buffer a gate chunk. Call with the gate lock held.
    fn stage_chunk(&self, flush: &GateFlush) -> Result<Option<AppendedTrace>> {
        debug!(
            producer = %flush.producer_id,
            reason = %flush.reason,
            tokens = flush.token_count,
            "Gate emitted chunk"
        );
        if flush.chunk.trim().is_empty() {
            debug!(producer = %flush.producer_id, "Dropping whitespace-only chunk");
            return Ok(None);
        }
        self.accumulator.append(&flush.producer_id, &flush.chunk).map(Some)
    }

    async fn settle(&self, staged: Option<AppendedTrace>) -> Result<Option<SummaryRecord>> {
        match staged {
            Some(appended) => self.resolve(appended).await,
            None => Ok(None),
        }
    }

    /// Ask for the verdict on a buffered trace and commit on yes
    async fn resolve(&self, appended: AppendedTrace) -> Result<Option<SummaryRecord>> {
        if !self.accumulator.decide(&appended).await? {
            return Ok(None);
        }
        self.commit_flush(&appended.producer_id).await
    }

    async fn commit_flush(&self, trigger: &str) -> Result<Option<SummaryRecord>> {
        let _commit = self.commit.lock().await;

        let batch = self.accumulator.flush_batch();
        if batch.is_empty() {
            // A concurrent commit already took these traces.
            debug!(producer = trigger, "Positive verdict but buffer already flushed");
            return Ok(None);
        }

        let request = self.build_request(&batch);
        info!(
            producer = trigger,
            traces = batch.len(),
            history = request.history.len(),
            "Summarizing buffered traces"
        );

        match self.summarizer.summarize(&request).await {
            Ok(record) => {
                self.ledger_mut().append(record.clone());
                info!("Summary #{} appended for [{}]", self.ledger().len(), record.agents.join(", "));
                // No subscribers is fine.
                let _ = self.summaries_tx.send(record.clone());
                Ok(Some(record))
            }
            Err(e) => {
                warn!(producer = trigger, "Summarization failed: {}", e);
                if self.config.retain_failed_batches {
                    self.accumulator.restore(batch);
                } else {
                    warn!("Dropping {} flushed traces", batch.len());
                }
                Err(e)
            }
        }
    }

    fn build_request(&self, batch: &[BufferedTrace]) -> SummaryRequest {
        let ledger = self.ledger();
        SummaryRequest {
            history: ledger
                .history_excluding_latest()
                .iter()
                .map(SummaryRecord::render_short)
                .collect(),
            latest: ledger
                .latest()
                .map(SummaryRecord::render_short)
                .unwrap_or_else(|| NO_SUMMARIES_YET.to_string()),
            new_material: batch
                .iter()
                .map(BufferedTrace::tagged)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
