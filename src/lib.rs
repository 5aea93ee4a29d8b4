//! Tracegate - trace buffering and summarization triggering
//!
//! Ingests reasoning traces from many independent agents and decides, per
//! agent and continuously, when enough material has accumulated to ask for a
//! condensed summary:
//! - A token-level gate turns raw token streams into segment-sized chunks
//! - A trace accumulator consults a decision oracle on every accepted trace
//! - A history ledger keeps the summaries and feeds them back as context

pub mod buffering;
pub mod config;
pub mod coordinator;
pub mod history;
pub mod oracle;

pub use buffering::{GateFlush, FlushReason, SegmentGate, TraceAccumulator, TraceRecord};
pub use config::{AccumulatorConfig, CoordinatorConfig, GateConfig, LlmConfig, TracegateConfig};
pub use coordinator::Coordinator;
pub use history::{HistoryLedger, SummaryRecord};
pub use oracle::{DecisionOracle, SummarizationOracle, SummaryRequest};

/// Result type for Tracegate operations
pub type Result<T> = std::result::Result<T, TracegateError>;

/// Errors that can occur in Tracegate
#[derive(Debug, thiserror::Error)]
pub enum TracegateError {
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Reject empty or whitespace-only producer ids.
pub(crate) fn validate_producer_id(producer_id: &str) -> Result<()> {
    if producer_id.trim().is_empty() {
        return Err(TracegateError::InvalidInput(
            "producer id must not be empty".to_string(),
        ));
    }
    Ok(())
}
