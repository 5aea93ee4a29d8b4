//! Deterministic oracles for offline runs, replays and tests.

use super::{DecisionOracle, SummarizationOracle, SummaryRequest};
use crate::buffering::NO_PREVIOUS_TRACES;
use crate::history::SummaryRecord;
use crate::{Result, TracegateError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default character budget for extractive summaries
const DEFAULT_SUMMARY_MAX_CHARS: usize = 300;

/// Always answers the same verdict
#[derive(Debug, Clone, Copy)]
pub struct FixedDecisionOracle(pub bool);

#[async_trait]
impl DecisionOracle for FixedDecisionOracle {
    async fn decide(&self, _previous: &str, _new_trace: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Says yes once the buffer holds `threshold` traces, counting the new one.
/// The count is read from the buffer snapshot, so restored batches count too.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdDecisionOracle {
    threshold: usize,
}

impl ThresholdDecisionOracle {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }
}

#[async_trait]
impl DecisionOracle for ThresholdDecisionOracle {
    async fn decide(&self, previous: &str, _new_trace: &str) -> Result<bool> {
        let buffered = if previous == NO_PREVIOUS_TRACES {
            0
        } else {
            parse_tagged_lines(previous).len()
        };
        Ok(buffered + 1 >= self.threshold)
    }
}

/// Replays a fixed list of verdicts and records every call.
/// Reports itself unavailable once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedDecisionOracle {
    verdicts: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedDecisionOracle {
    pub fn new(verdicts: impl IntoIterator<Item = bool>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(previous, new_trace)` pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedDecisionOracle {
    async fn decide(&self, previous: &str, new_trace: &str) -> Result<bool> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((previous.to_string(), new_trace.to_string()));
        }
        self.verdicts
            .lock()
            .ok()
            .and_then(|mut verdicts| verdicts.pop_front())
            .ok_or_else(|| {
                TracegateError::OracleUnavailable("decision script exhausted".to_string())
            })
    }
}

/// Offline summarizer: first sentence of each flushed trace, attributed to
/// the agents found in the tags.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_chars: usize,
}

impl ExtractiveSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARY_MAX_CHARS)
    }
}

#[async_trait]
impl SummarizationOracle for ExtractiveSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryRecord> {
        let traces = parse_tagged_lines(&request.new_material);
        if traces.is_empty() {
            return Err(TracegateError::OracleUnavailable(
                "nothing to summarize".to_string(),
            ));
        }

        let mut agents: Vec<String> = Vec::new();
        for (agent, _) in &traces {
            if !agents.contains(agent) {
                agents.push(agent.clone());
            }
        }

        let sentences: Vec<&str> = traces
            .iter()
            .map(|(_, text)| first_sentence(text))
            .filter(|s| !s.is_empty())
            .collect();
        let summary = truncate_chars(&sentences.join(" "), self.max_chars);

        Ok(SummaryRecord::new(agents, summary)
            .with_section("trace_count", traces.len().to_string()))
    }
}

/// Split `| agent | text` lines into pairs; untagged lines continue the
/// previous trace.
pub(crate) fn parse_tagged_lines(material: &str) -> Vec<(String, String)> {
    let mut traces: Vec<(String, String)> = Vec::new();
    for line in material.lines() {
        let tagged = line
            .strip_prefix("| ")
            .and_then(|rest| rest.split_once(" | "));
        if let Some((agent, text)) = tagged {
            traces.push((agent.trim().to_string(), text.to_string()));
        } else if let Some((_, text)) = traces.last_mut() {
            text.push('\n');
            text.push_str(line);
        }
    }
    traces
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_break = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_break {
                return &text[..i + c.len_utf8()];
            }
        }
    }
    text
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let end = text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    format!("{}...", &text[..end])
}
