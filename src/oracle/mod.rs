//! External capabilities consulted by the pipeline.
//!
//! The decision oracle judges whether the buffer is ready to be condensed;
//! the summarization oracle condenses it. Both are injected as trait objects
//! so the core runs equally against an LLM endpoint or a deterministic fake.

mod heuristic;
mod llm;
mod llm_client;

pub use heuristic::{
    ExtractiveSummarizer, FixedDecisionOracle, ScriptedDecisionOracle, ThresholdDecisionOracle,
};
pub use llm::{LlmDecisionOracle, LlmSummarizer};
pub use llm_client::LlmClient;

use crate::history::SummaryRecord;
use crate::Result;
use async_trait::async_trait;

/// Placeholder for the latest summary when the ledger is empty
pub const NO_SUMMARIES_YET: &str = "(no summaries yet)";

/// Decides whether the accumulated traces should be summarized now
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// `previous` is the tagged buffer before `new_trace` was appended
    async fn decide(&self, previous: &str, new_trace: &str) -> Result<bool>;
}

/// Condenses flushed traces into a summary record
#[async_trait]
pub trait SummarizationOracle: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryRecord>;
}

/// Everything the summarization oracle receives for one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    /// All summaries but the latest, rendered short, oldest first
    pub history: Vec<String>,
    /// Latest summary rendered short, or [`NO_SUMMARIES_YET`]
    pub latest: String,
    /// Flushed tagged traces joined in buffer order
    pub new_material: String,
}
