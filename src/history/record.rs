//! Condensed summary record produced by the summarization oracle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One condensed summary. Immutable once appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Producers whose traces this summary covers
    pub agents: Vec<String>,
    /// Short free-text summary
    pub summary: String,
    /// Optional named sections (schema-specific, opaque to the core)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SummaryRecord {
    pub fn new(agents: Vec<String>, summary: impl Into<String>) -> Self {
        Self {
            agents,
            summary: summary.into(),
            sections: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_section(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.sections.insert(name.into(), content.into());
        self
    }

    /// Whether `producer_id` is among the involved agents
    pub fn involves(&self, producer_id: &str) -> bool {
        self.agents.iter().any(|a| a == producer_id)
    }

    /// Compact single-string form used as history context
    pub fn render_short(&self) -> String {
        let mut out = format!("Agents: {} | {}", self.agents.join(", "), self.summary);
        for (name, content) in &self.sections {
            out.push_str(&format!(" | {name}: {content}"));
        }
        out
    }
}
