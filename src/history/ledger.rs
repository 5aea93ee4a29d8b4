//! Append-only summary history.

use super::SummaryRecord;
use std::collections::HashMap;

/// Authoritative sequence of summaries, indexed by producer
#[derive(Debug, Default, Clone)]
pub struct HistoryLedger {
    records: Vec<SummaryRecord>,
    /// Producer -> positions in `records`, ascending
    by_producer: HashMap<String, Vec<usize>>,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: SummaryRecord) {
        let position = self.records.len();
        for agent in &record.agents {
            let positions = self.by_producer.entry(agent.clone()).or_default();
            // An agent listed twice in one record is indexed once.
            if positions.last() != Some(&position) {
                positions.push(position);
            }
        }
        self.records.push(record);
    }

    pub fn all(&self) -> &[SummaryRecord] {
        &self.records
    }

    pub fn by_producer(&self, producer_id: &str) -> Vec<SummaryRecord> {
        self.by_producer
            .get(producer_id)
            .map(|positions| positions.iter().map(|&i| self.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<&SummaryRecord> {
        self.records.last()
    }

    /// Every record except the most recent one
    pub fn history_excluding_latest(&self) -> &[SummaryRecord] {
        let end = self.records.len().saturating_sub(1);
        &self.records[..end]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
