//! Integration tests for the Tracegate pipeline

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tracegate::oracle::{
    ExtractiveSummarizer, FixedDecisionOracle, ScriptedDecisionOracle, ThresholdDecisionOracle,
    NO_SUMMARIES_YET,
};
use tracegate::{
    Coordinator, DecisionOracle, GateConfig, Result, SummarizationOracle, SummaryRecord,
    SummaryRequest, TracegateConfig, TracegateError,
};

/// Summarizer fake: remembers every request, can be switched to failing
#[derive(Default)]
struct RecordingSummarizer {
    requests: Mutex<Vec<SummaryRequest>>,
    failing: AtomicBool,
}

impl RecordingSummarizer {
    fn requests(&self) -> Vec<SummaryRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SummarizationOracle for RecordingSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryRecord> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if self.failing.load(Ordering::SeqCst) {
            return Err(TracegateError::OracleUnavailable("summarizer offline".into()));
        }

        let mut agents: Vec<String> = Vec::new();
        for line in request.new_material.lines() {
            if let Some((agent, _)) = line.strip_prefix("| ").and_then(|l| l.split_once(" | ")) {
                if !agents.iter().any(|a| a == agent) {
                    agents.push(agent.to_string());
                }
            }
        }
        Ok(SummaryRecord::new(agents, format!("summary {n}")))
    }
}

fn build(
    config: TracegateConfig,
    decision: Arc<dyn DecisionOracle>,
) -> (Arc<Coordinator>, Arc<RecordingSummarizer>) {
    let summarizer = Arc::new(RecordingSummarizer::default());
    let coordinator = Coordinator::new(&config, decision, summarizer.clone()).unwrap();
    (Arc::new(coordinator), summarizer)
}

/// Decision oracle always says yes: one trace, one summary, empty buffer
#[tokio::test]
async fn test_always_yes_summarizes_every_trace() {
    let (coordinator, summarizer) = build(
        TracegateConfig::default(),
        Arc::new(FixedDecisionOracle(true)),
    );

    let record = assert_ok!(coordinator.receive_trace("a1", "hello").await);
    assert!(record.is_some());
    assert_eq!(coordinator.get_all_summaries().len(), 1);
    assert!(coordinator.pending_traces().is_empty());

    let requests = summarizer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].latest, NO_SUMMARIES_YET);
    assert_eq!(requests[0].new_material, "| a1 | hello");
}

/// Verdicts no, no, yes: the third call summarizes all three traces in order
#[tokio::test]
async fn test_buffer_accumulates_until_positive_verdict() {
    let decision = Arc::new(ScriptedDecisionOracle::new([false, false, true]));
    let (coordinator, summarizer) = build(TracegateConfig::default(), decision.clone());

    assert!(assert_ok!(coordinator.receive_trace("p", "t1").await).is_none());
    assert!(assert_ok!(coordinator.receive_trace("p", "t2").await).is_none());
    assert!(assert_ok!(coordinator.receive_trace("p", "t3").await).is_some());

    let requests = summarizer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].new_material, "| p | t1\n| p | t2\n| p | t3");
    assert_eq!(coordinator.get_agent_trace_count("p"), 3);

    let calls = decision.calls();
    assert_eq!(calls[2].0, "| p | t1\n| p | t2");
    assert_eq!(calls[2].1, "| p | t3");
}

/// Sub-word tokens are joined and handed on as a single trace once the cue arrives
#[tokio::test]
async fn test_streamed_tokens_flush_on_boundary() {
    let gate = GateConfig::default()
        .with_thresholds(2, 100)
        .with_boundary_cues(".");
    let decision = Arc::new(ScriptedDecisionOracle::new([true]));
    let (coordinator, summarizer) = build(
        TracegateConfig::default().with_gate(gate),
        decision.clone(),
    );

    let tokens = futures::stream::iter(["Pat", "ient", " fever", "."]);
    let record = assert_ok!(coordinator.receive_streamed_tokens("a", tokens).await);

    assert!(record.is_some());
    assert_eq!(decision.calls().len(), 1);
    assert_eq!(coordinator.get_agent_trace_count("a"), 1);
    assert_eq!(summarizer.requests()[0].new_material, "| a | Patient fever.");
    assert_eq!(coordinator.pending_tokens("a").await, 0);
}

/// A failed summary appends nothing and keeps the batch for the next attempt
#[tokio::test]
async fn test_summarizer_failure_keeps_batch() {
    let (coordinator, summarizer) = build(
        TracegateConfig::default(),
        Arc::new(FixedDecisionOracle(true)),
    );
    summarizer.set_failing(true);

    let err = assert_err!(coordinator.receive_trace("a", "first").await);
    assert!(matches!(err, TracegateError::OracleUnavailable(_)));
    assert!(coordinator.get_all_summaries().is_empty());
    assert_eq!(coordinator.get_agent_trace_count("a"), 1);
    assert_eq!(coordinator.pending_traces(), vec!["| a | first"]);

    summarizer.set_failing(false);
    let record = assert_ok!(coordinator.receive_trace("b", "second").await).unwrap();
    assert_eq!(record.agents, vec!["a", "b"]);
    assert_eq!(coordinator.get_all_summaries().len(), 1);
    assert_eq!(coordinator.get_agent_trace_count("a"), 1);
}

#[tokio::test]
async fn test_always_flush_first_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[accumulator]\nalways_flush_first = true\n\n[gate]\nmin_tokens = 2\nmax_tokens = 10\n",
    )
    .unwrap();

    let config = TracegateConfig::load(&path).await.unwrap();
    assert!(config.accumulator.always_flush_first);
    assert_eq!(config.gate.max_tokens, 10);

    let decision = Arc::new(ScriptedDecisionOracle::new([false]));
    let (coordinator, _) = build(config, decision.clone());

    // Cold buffer: summarized without asking the oracle.
    assert!(assert_ok!(coordinator.receive_trace("a", "one").await).is_some());
    assert!(decision.calls().is_empty());

    // Cold again after the flush.
    assert!(assert_ok!(coordinator.receive_trace("a", "two").await).is_some());
    assert_eq!(coordinator.get_all_summaries().len(), 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let gate = GateConfig::default().with_thresholds(50, 10);
    let config = TracegateConfig::default().with_gate(gate);
    let result = Coordinator::new(
        &config,
        Arc::new(FixedDecisionOracle(true)),
        Arc::new(RecordingSummarizer::default()),
    );
    assert!(matches!(result, Err(TracegateError::Config(_))));
}

#[tokio::test]
async fn test_queries_filter_by_agent() {
    let decision = Arc::new(ScriptedDecisionOracle::new([false, true, true]));
    let (coordinator, summarizer) = build(TracegateConfig::default(), decision);

    coordinator.receive_trace("x", "one").await.unwrap();
    coordinator.receive_trace("y", "two").await.unwrap();
    coordinator.receive_trace("y", "three").await.unwrap();

    assert_eq!(coordinator.get_summaries_by_agent("x").len(), 1);
    assert_eq!(coordinator.get_summaries_by_agent("y").len(), 2);
    assert!(coordinator.get_summaries_by_agent("z").is_empty());
    assert_eq!(coordinator.get_agent_trace_count("z"), 0);
    assert!(coordinator.get_agent_traces("z").is_empty());

    let traces = coordinator.get_agent_traces("y");
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[1].seq, 2);
    assert_eq!(traces[1].text, "three");

    // The second request sees the first summary as latest, with no older history.
    let requests = summarizer.requests();
    assert_eq!(requests[1].latest, "Agents: x, y | summary 1");
    assert!(requests[1].history.is_empty());
}

#[tokio::test]
async fn test_invalid_input_changes_nothing() {
    let decision = Arc::new(ScriptedDecisionOracle::new(Vec::new()));
    let (coordinator, _) = build(TracegateConfig::default(), decision.clone());

    assert!(matches!(
        coordinator.receive_trace("", "text").await,
        Err(TracegateError::InvalidInput(_))
    ));
    assert!(matches!(
        coordinator.receive_trace("a", "   ").await,
        Err(TracegateError::InvalidInput(_))
    ));
    assert!(coordinator.pending_traces().is_empty());
    assert!(coordinator.producers().is_empty());
    assert!(decision.calls().is_empty());
}

/// Producers writing concurrently never lose or duplicate traces
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_every_trace() {
    let (coordinator, _) = build(
        TracegateConfig::default(),
        Arc::new(FixedDecisionOracle(false)),
    );

    let mut handles = Vec::new();
    for p in 0..4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let producer = format!("p{p}");
            for i in 0..25 {
                coordinator
                    .receive_trace(&producer, &format!("step {i}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let pending = coordinator.pending_traces();
    assert_eq!(pending.len(), 100);
    for p in 0..4 {
        let producer = format!("p{p}");
        assert_eq!(coordinator.get_agent_trace_count(&producer), 25);

        // Per-producer order is preserved in the shared buffer.
        let prefix = format!("| {producer} | ");
        let steps: Vec<&str> = pending
            .iter()
            .filter_map(|t| t.strip_prefix(prefix.as_str()))
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("step {i}")).collect();
        assert_eq!(steps, expected);
    }
}

/// Concurrent positive verdicts produce one summary per flushed batch, no
/// duplicates and no lost traces.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flushes_cover_every_trace_once() {
    let (coordinator, summarizer) = build(
        TracegateConfig::default(),
        Arc::new(FixedDecisionOracle(true)),
    );

    let mut handles = Vec::new();
    for p in 0..4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                coordinator
                    .receive_trace(&format!("p{p}"), &format!("t{i}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total_lines: usize = summarizer
        .requests()
        .iter()
        .map(|r| r.new_material.lines().count())
        .sum();
    assert_eq!(total_lines, 40);
    assert_eq!(coordinator.get_all_summaries().len(), summarizer.requests().len());
    assert!(coordinator.pending_traces().is_empty());
}

/// The background timer flushes a producer that went silent mid-sentence
#[tokio::test(start_paused = true)]
async fn test_timer_task_flushes_silent_stream() {
    let gate = GateConfig::default().with_timers(Duration::from_secs(1), Duration::from_secs(10));
    let (coordinator, summarizer) = build(
        TracegateConfig::default().with_gate(gate),
        Arc::new(FixedDecisionOracle(true)),
    );
    let mut rx = coordinator.subscribe();
    let timer = coordinator.spawn_timer_task();

    let tokens = futures::stream::iter(["waiting", " on", " labs"]);
    let record = assert_ok!(coordinator.receive_streamed_tokens("a", tokens).await);
    assert!(record.is_none());

    let record = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timer never flushed")
        .unwrap();
    assert_eq!(record.agents, vec!["a"]);
    assert_eq!(summarizer.requests()[0].new_material, "| a | waiting on labs");
    assert_eq!(coordinator.pending_tokens("a").await, 0);

    timer.abort();
}

/// A restored batch still counts toward the threshold on the next trace
#[tokio::test]
async fn test_threshold_sees_restored_batch() {
    let (coordinator, summarizer) = build(
        TracegateConfig::default(),
        Arc::new(ThresholdDecisionOracle::new(2)),
    );

    assert!(assert_ok!(coordinator.receive_trace("a", "t1").await).is_none());

    summarizer.set_failing(true);
    assert_err!(coordinator.receive_trace("a", "t2").await);
    assert_eq!(coordinator.pending_traces(), vec!["| a | t1", "| a | t2"]);

    summarizer.set_failing(false);
    let record = assert_ok!(coordinator.receive_trace("a", "t3").await);
    assert!(record.is_some());
    assert!(coordinator.pending_traces().is_empty());
    assert_eq!(
        summarizer.requests().last().unwrap().new_material,
        "| a | t1\n| a | t2\n| a | t3"
    );
}

/// Offline oracles end to end: summarize every second trace
#[tokio::test]
async fn test_offline_pipeline() {
    let coordinator = Coordinator::new(
        &TracegateConfig::default(),
        Arc::new(ThresholdDecisionOracle::new(2)),
        Arc::new(ExtractiveSummarizer::default()),
    )
    .unwrap();

    let inputs = [
        ("retrieval", "Pulled the PE guideline. Wells score is 4."),
        ("differential", "CAP ranks above PE for now."),
        ("retrieval", "No prior imaging on file."),
    ];
    let mut records = Vec::new();
    for (agent, text) in inputs {
        if let Some(record) = coordinator.receive_trace(agent, text).await.unwrap() {
            records.push(record);
        }
    }

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].agents, vec!["retrieval", "differential"]);
    assert_eq!(
        records[0].summary,
        "Pulled the PE guideline. CAP ranks above PE for now."
    );
    assert_eq!(coordinator.pending_traces(), vec!["| retrieval | No prior imaging on file."]);
}
