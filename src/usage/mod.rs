pub mod ledger;

pub use ledger::{LedgerEntry, OperationKind, UsageLedger, UsageRecord, UsageSummary};
