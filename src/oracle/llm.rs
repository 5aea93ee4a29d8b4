//! LLM-backed decision and summarization oracles.
//!
//! Summaries are requested as a single JSON object. Parsing strategy:
//! 1. `serde_json::from_str` on the full reply.
//! 2. Otherwise extract the first balanced `{...}` substring and retry.
//! 3. Otherwise the oracle is treated as unavailable for this call.

use super::heuristic::{parse_tagged_lines, truncate_chars};
use super::{DecisionOracle, LlmClient, SummarizationOracle, SummaryRequest};
use crate::history::SummaryRecord;
use crate::{Result, TracegateError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-field character cap on summary output
pub const MAX_FIELD_CHARS: usize = 300;

const DECISION_SYSTEM_PROMPT: &str = r#"You are monitoring the reasoning streams of multiple AI agents.
Decide whether the new reasoning trace should trigger a summary of the buffered traces.

Reply YES if ANY of these hold:
- the new trace completes a thought or reasoning step
- the topic or focus changed compared to the previous traces
- enough context has accumulated to be worth summarizing
- the reasoning reached a natural pause or conclusion

Reply NO if the new trace just continues the same line of reasoning without completing it.
Prefer YES when in doubt. Reply with exactly one word: YES or NO."#;

const SUMMARY_SYSTEM_PROMPT: &str = r#"You summarize the reasoning of a multi-agent system for a human reviewer.
Each buffered trace is tagged as "| agent_id | text".

Rules:
- Extract ONLY information that is new in the buffer; do not repeat earlier summaries
- Be concise and concrete; keep every field under 300 characters
- List every agent whose traces you summarized

Respond with a single JSON object and nothing else:
{"agents": ["agent_id", ...], "summary": "what happened", "sections": {"name": "content", ...}}

"sections" is optional and may hold named details such as findings, rationale,
uncertainty or next_step."#;

/// Asks the model a YES/NO question about the buffer
pub struct LlmDecisionOracle {
    client: Arc<LlmClient>,
}

impl LlmDecisionOracle {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DecisionOracle for LlmDecisionOracle {
    async fn decide(&self, previous: &str, new_trace: &str) -> Result<bool> {
        let prompt = decision_prompt(previous, new_trace);
        let model = self.client.config().decision_model().to_string();
        let response = self
            .client
            .complete(&model, DECISION_SYSTEM_PROMPT, &prompt)
            .await?;
        Ok(parse_verdict(&response))
    }
}

/// Asks the model for a structured JSON summary
pub struct LlmSummarizer {
    client: Arc<LlmClient>,
}

impl LlmSummarizer {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SummarizationOracle for LlmSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryRecord> {
        let prompt = summary_prompt(request);
        let model = self.client.config().model.clone();
        let response = self
            .client
            .complete(&model, SUMMARY_SYSTEM_PROMPT, &prompt)
            .await?;
        parse_summary_response(&response, &request.new_material)
    }
}

fn decision_prompt(previous: &str, new_trace: &str) -> String {
    format!(
        "Previous traces in buffer:\n{previous}\n\nNew trace to evaluate:\n{new_trace}\n\n\
         Should this trigger summarization? Reply with only 'YES' or 'NO'."
    )
}

fn summary_prompt(request: &SummaryRequest) -> String {
    format!(
        "Summary history:\n[ {} ]\n\nLatest summary:\n{}\n\nNew reasoning buffer:\n{}\n\n\
         Summarize the new agent actions and reasoning as the JSON object described.",
        request.history.join(",\n"),
        request.latest,
        request.new_material
    )
}

fn parse_verdict(response: &str) -> bool {
    response.trim().to_uppercase().contains("YES")
}

#[derive(Debug, Deserialize)]
struct SummaryJson {
    #[serde(default)]
    agents: Vec<String>,

    summary: String,

    #[serde(default)]
    sections: BTreeMap<String, String>,
}

fn parse_summary_response(response: &str, new_material: &str) -> Result<SummaryRecord> {
    let text = response.trim();

    let parsed = serde_json::from_str::<SummaryJson>(text).ok().or_else(|| {
        extract_json_object(text).and_then(|json| serde_json::from_str::<SummaryJson>(json).ok())
    });

    let Some(parsed) = parsed else {
        warn!("Unparseable summary response ({} chars)", text.len());
        return Err(TracegateError::OracleUnavailable(
            "summary response was not a JSON summary object".to_string(),
        ));
    };

    if parsed.summary.trim().is_empty() {
        return Err(TracegateError::OracleUnavailable(
            "summary response had an empty summary".to_string(),
        ));
    }

    let mut agents: Vec<String> = parsed
        .agents
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    if agents.is_empty() {
        debug!("Summary listed no agents, taking them from the trace tags");
        for (agent, _) in parse_tagged_lines(new_material) {
            if !agents.contains(&agent) {
                agents.push(agent);
            }
        }
    }

    let mut record = SummaryRecord::new(agents, truncate_chars(parsed.summary.trim(), MAX_FIELD_CHARS));
    for (name, content) in parsed.sections {
        record = record.with_section(name, truncate_chars(content.trim(), MAX_FIELD_CHARS));
    }
    Ok(record)
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
