//! Summary history: records and the append-only ledger.

mod ledger;
mod record;

pub use ledger::HistoryLedger;
pub use record::SummaryRecord;
