use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Raw extraction shapes — produced by the extractor, consumed by the
// classifier/normalizer, never persisted
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTable {
    pub source_file: String,
    pub table_index: usize,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn header_text(&self) -> String {
        self.headers.join(" ").to_lowercase()
    }
}

#[derive(Debug, Clone)]
pub struct RawTableRow {
    pub source_file: String,
    pub table_index: usize,
    pub row_index: usize,
    pub headers: Vec<String>,
    pub cells: Vec<String>,
}

impl RawTableRow {
    /// First cell whose column header contains `keyword` (case-insensitive).
    pub fn cell_by_header(&self, keyword: &str) -> Option<&str> {
        let keyword = keyword.to_lowercase();
        self.headers
            .iter()
            .position(|h| h.to_lowercase().contains(&keyword))
            .and_then(|i| self.cells.get(i))
            .map(|s| s.as_str())
    }

    pub fn joined_text(&self) -> String {
        self.cells.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Canonical transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Check,
    Withdrawal,
    Deposit,
    Credit,
    Other,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "CHECK",
            Self::Withdrawal => "WITHDRAWAL",
            Self::Deposit => "DEPOSIT",
            Self::Credit => "CREDIT",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CHECK" => Self::Check,
            "WITHDRAWAL" => Self::Withdrawal,
            "DEPOSIT" => Self::Deposit,
            "CREDIT" => Self::Credit,
            _ => Self::Other,
        }
    }

    /// Debits negative, credits positive. `None` when the type alone does
    /// not determine a sign.
    pub fn sign(&self) -> Option<i8> {
        match self {
            Self::Check | Self::Withdrawal => Some(-1),
            Self::Deposit | Self::Credit => Some(1),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Bank,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Card => "CARD",
            Self::Bank => "BANK",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CASH" => Self::Cash,
            "CARD" => Self::Card,
            "BANK" => Self::Bank,
            _ => Self::Other,
        }
    }
}

/// The canonical unit of work. Created once per accepted raw row during
/// normalization and immutable thereafter; financial facts are never edited
/// post-persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub org_id: String,
    pub account_number: String,
    pub transaction_date: NaiveDate,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub description: String,
    pub raw_description: String,
    pub method: PaymentMethod,
    pub source_file: String,
    pub source_table_index: usize,
    pub source_row_index: usize,
    pub content_hash: String,
}

impl NormalizedTransaction {
    /// Explicit serialization for process/storage boundaries. Dates render
    /// as ISO calendar dates and amounts as fixed-point strings.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A persisted transaction together with its ledger row id.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: i64,
    pub tx: NormalizedTransaction,
}

// ---------------------------------------------------------------------------
// Duplicate detection results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateStatus {
    None,
    PendingReview,
    ConfirmedDuplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedAgainst {
    /// Another candidate in the same batch, by candidate index.
    Sibling(usize),
    /// A persisted transaction, by ledger row id.
    Ledger(i64),
}

#[derive(Debug, Clone)]
pub struct DuplicateVerdict {
    pub status: DuplicateStatus,
    pub matched: Option<MatchedAgainst>,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

impl DuplicateVerdict {
    pub fn none() -> Self {
        Self {
            status: DuplicateStatus::None,
            matched: None,
            confidence: 0.0,
            reasons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStatus {
    Pending,
    Confirmed,
    Dismissed,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Dismissed => "DISMISSED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CONFIRMED" => Self::Confirmed,
            "DISMISSED" => Self::Dismissed,
            _ => Self::Pending,
        }
    }
}

/// Persisted link between a rejected candidate and the ledger transaction it
/// duplicates. Updated only by an external review action, never deleted.
#[derive(Debug, Clone)]
pub struct DuplicateFlag {
    pub id: Option<i64>,
    pub batch_id: Option<i64>,
    pub candidate_table_index: usize,
    pub candidate_row_index: usize,
    pub candidate_hash: String,
    pub matched_transaction_id: i64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub status: FlagStatus,
}

// ---------------------------------------------------------------------------
// Import batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    /// Terminal status of a short-circuited re-import of an already
    /// completed file; never written over the prior batch record.
    AlreadyImported,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
            Self::AlreadyImported => "ALREADY_IMPORTED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "COMPLETED" => Self::Completed,
            "COMPLETED_WITH_ERRORS" => Self::CompletedWithErrors,
            "FAILED" => Self::Failed,
            "ALREADY_IMPORTED" => Self::AlreadyImported,
            _ => Self::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Statuses that make a later re-import of the same file a no-op.
    pub fn counts_as_imported(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors)
    }
}

/// One row per ingestion run. Counters are filled in stage by stage and the
/// record is immutable once `status` is terminal.
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub id: Option<i64>,
    pub org_id: String,
    pub source_file: String,
    pub checksum: String,
    pub import_started_at: String,
    pub import_finished_at: Option<String>,
    pub rows_extracted: i64,
    pub rows_classified_transaction: i64,
    pub rows_normalized: i64,
    pub rows_validated: i64,
    pub rows_duplicate: i64,
    pub rows_persisted: i64,
    pub status: BatchStatus,
    pub error_log: Option<String>,
}

impl ImportBatch {
    pub fn new(org_id: &str, source_file: &str, checksum: &str) -> Self {
        Self {
            id: None,
            org_id: org_id.to_string(),
            source_file: source_file.to_string(),
            checksum: checksum.to_string(),
            import_started_at: chrono::Utc::now().to_rfc3339(),
            import_finished_at: None,
            rows_extracted: 0,
            rows_classified_transaction: 0,
            rows_normalized: 0,
            rows_validated: 0,
            rows_duplicate: 0,
            rows_persisted: 0,
            status: BatchStatus::Running,
            error_log: None,
        }
    }

    pub fn finish(&mut self, status: BatchStatus) {
        self.status = status;
        self.import_finished_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

// ---------------------------------------------------------------------------
// Per-row outcomes — no row ever vanishes without an accounted reason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Disposition {
    Accepted { content_hash: String },
    Duplicate(DuplicateVerdict),
    Rejected { reason: String },
}

/// Rows are identified by table plus row index; row indexes restart in
/// every table, so the pair is the document-unique key.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub table_index: usize,
    pub source_row_index: usize,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
pub struct ImportBatchResult {
    pub batch: ImportBatch,
    pub outcomes: Vec<RowOutcome>,
}

impl ImportBatchResult {
    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Accepted { .. }))
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Rejected { .. }))
            .count()
    }

    pub fn flagged(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Duplicate(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_tx() -> NormalizedTransaction {
        NormalizedTransaction {
            org_id: "org-1".to_string(),
            account_number: "1234".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2025, 5, 22).unwrap(),
            amount: Decimal::from_str("-123.00").unwrap(),
            transaction_type: TransactionType::Withdrawal,
            description: "ONLINE PYMT TO DTE ENERGY".to_string(),
            raw_description: "5/3 ONLINE PYMT TO DTE ENERGY".to_string(),
            method: PaymentMethod::Bank,
            source_file: "may.csv".to_string(),
            source_table_index: 0,
            source_row_index: 0,
            content_hash: "abc123".to_string(),
        }
    }

    #[test]
    fn test_json_round_trip_preserves_date_and_amount() {
        let tx = sample_tx();
        let json = tx.to_json().unwrap();
        assert!(json.contains("\"2025-05-22\""), "date must be ISO text: {json}");
        let back = NormalizedTransaction::from_json(&json).unwrap();
        assert_eq!(back.transaction_date, tx.transaction_date);
        assert_eq!(back.amount, tx.amount);
        assert_eq!(back.transaction_type, TransactionType::Withdrawal);
    }

    #[test]
    fn test_transaction_type_sign_convention() {
        assert_eq!(TransactionType::Check.sign(), Some(-1));
        assert_eq!(TransactionType::Withdrawal.sign(), Some(-1));
        assert_eq!(TransactionType::Deposit.sign(), Some(1));
        assert_eq!(TransactionType::Credit.sign(), Some(1));
        assert_eq!(TransactionType::Other.sign(), None);
    }

    #[test]
    fn test_enum_db_round_trip() {
        for t in [
            TransactionType::Check,
            TransactionType::Withdrawal,
            TransactionType::Deposit,
            TransactionType::Credit,
            TransactionType::Other,
        ] {
            assert_eq!(TransactionType::parse(t.as_str()), t);
        }
        for s in [
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::CompletedWithErrors,
            BatchStatus::Failed,
            BatchStatus::AlreadyImported,
        ] {
            assert_eq!(BatchStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_batch_finish_sets_terminal_state() {
        let mut batch = ImportBatch::new("org-1", "may.csv", "deadbeef");
        assert_eq!(batch.status, BatchStatus::Running);
        assert!(!batch.status.is_terminal());
        batch.finish(BatchStatus::Completed);
        assert!(batch.status.is_terminal());
        assert!(batch.import_finished_at.is_some());
    }

    #[test]
    fn test_cell_by_header_is_case_insensitive() {
        let row = RawTableRow {
            source_file: "a.csv".to_string(),
            table_index: 0,
            row_index: 1,
            headers: vec!["Date".to_string(), "Amount".to_string()],
            cells: vec!["05/22".to_string(), "123.00".to_string()],
        };
        assert_eq!(row.cell_by_header("amount"), Some("123.00"));
        assert_eq!(row.cell_by_header("balance"), None);
    }
}
