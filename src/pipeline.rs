use std::path::Path;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::classifier::TableClassifier;
use crate::dedupe::DuplicateDetector;
use crate::error::{IngestError, Result};
use crate::extract::{compute_checksum, extract_with_timeout, SourceKind};
use crate::ledger::Ledger;
use crate::models::{
    BatchStatus, Disposition, DuplicateFlag, DuplicateStatus, FlagStatus, ImportBatch,
    ImportBatchResult, MatchedAgainst, NormalizedTransaction, RowOutcome,
};
use crate::normalizer::{statement_period, BatchContext, TransactionNormalizer};
use crate::settings::IngestSettings;

/// Largest amount a single statement row may carry: 999,999,999.99.
fn max_amount() -> Decimal {
    Decimal::new(99_999_999_999, 2)
}

/// Drives one source file through the full ingestion pipeline: checksum and
/// idempotency check, timed extraction, classification, normalization,
/// validation, duplicate detection, and a single atomic persist.
///
/// Row-level problems are recorded and skipped; only extraction failure, a
/// document with no usable transaction table, or a persistence failure abort
/// the batch. Every abort still leaves a terminal `FAILED` batch record
/// behind.
pub struct ImportBatchOrchestrator<L: Ledger> {
    settings: IngestSettings,
    classifier: TableClassifier,
    normalizer: TransactionNormalizer,
    detector: DuplicateDetector,
    ledger: L,
}

impl<L: Ledger> ImportBatchOrchestrator<L> {
    pub fn new(settings: IngestSettings, ledger: L) -> Self {
        let classifier = TableClassifier::new(&settings);
        let normalizer = TransactionNormalizer::new(&settings);
        let detector = DuplicateDetector::new(&settings);
        Self {
            settings,
            classifier,
            normalizer,
            detector,
            ledger,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn run(
        &mut self,
        file_path: &Path,
        org_id: &str,
        account_number: &str,
    ) -> Result<ImportBatchResult> {
        let source_file = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        let kind = SourceKind::for_path(file_path)?;
        let checksum = compute_checksum(file_path)?;

        // Same file name with the same bytes, already imported: a no-op.
        if let Some(prior) = self
            .ledger
            .find_completed_batch(org_id, &source_file, &checksum)?
        {
            info!(file = %source_file, prior_batch = ?prior.id, "already imported, skipping");
            // This run did no work, so its record reports zero everywhere;
            // the prior batch keeps the real counters.
            let mut batch = ImportBatch::new(org_id, &source_file, &checksum);
            batch.finish(BatchStatus::AlreadyImported);
            return Ok(ImportBatchResult {
                batch,
                outcomes: Vec::new(),
            });
        }

        let mut batch = ImportBatch::new(org_id, &source_file, &checksum);
        let batch_id = self.ledger.insert_batch(&batch)?;
        batch.id = Some(batch_id);

        let extraction =
            match extract_with_timeout(kind, file_path, self.settings.extraction_timeout_secs) {
                Ok(extraction) => extraction,
                Err(e) => return Err(self.fail_batch(batch, e)),
            };

        // Classification. Excluded tables are logged, never silently dropped.
        let classified = self.classifier.classify(extraction.tables);
        batch.rows_extracted = classified
            .iter()
            .map(|ct| ct.table.rows.len() as i64)
            .sum();
        let mut error_lines: Vec<String> = Vec::new();
        for ct in &classified {
            if let Some(reason) = &ct.reason {
                warn!(
                    table = ct.table.table_index,
                    label = ct.label.as_str(),
                    %reason,
                    "table excluded"
                );
                error_lines.push(format!(
                    "table {} excluded ({}): {reason}",
                    ct.table.table_index,
                    ct.label.as_str()
                ));
            }
        }
        let rows = self.classifier.extract_rows(&classified);
        batch.rows_classified_transaction = rows.len() as i64;
        if rows.is_empty() {
            let e = IngestError::Extraction(format!(
                "{source_file}: no transaction tables ({})",
                error_lines.join("; ")
            ));
            return Err(self.fail_batch(batch, e));
        }

        // Normalization, row by row in table order.
        let mut ctx = BatchContext::new(org_id, account_number);
        if let Some((start, end)) = statement_period(&extraction.free_text) {
            ctx = ctx.with_period(start, end);
        }
        let mut outcomes: Vec<RowOutcome> = Vec::new();
        let mut candidates: Vec<NormalizedTransaction> = Vec::new();
        let mut row_errors = 0usize;
        for row in &rows {
            match self.normalizer.normalize(row, &mut ctx) {
                Ok(tx) => candidates.push(tx),
                Err(e) => {
                    warn!(row = row.row_index, error = %e, "row rejected");
                    error_lines.push(e.to_string());
                    row_errors += 1;
                    outcomes.push(RowOutcome {
                        table_index: row.table_index,
                        source_row_index: row.row_index,
                        disposition: Disposition::Rejected {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }
        batch.rows_normalized = candidates.len() as i64;

        // Validation.
        let mut validated: Vec<NormalizedTransaction> = Vec::new();
        for tx in candidates {
            match validate(&tx) {
                Ok(()) => validated.push(tx),
                Err(e) => {
                    warn!(row = tx.source_row_index, error = %e, "row rejected");
                    error_lines.push(e.to_string());
                    row_errors += 1;
                    outcomes.push(RowOutcome {
                        table_index: tx.source_table_index,
                        source_row_index: tx.source_row_index,
                        disposition: Disposition::Rejected {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }
        batch.rows_validated = validated.len() as i64;

        // Duplicate detection against the overlapping ledger window.
        let existing = if validated.is_empty() {
            Vec::new()
        } else {
            let pad = Duration::days(self.settings.date_window_days);
            let start = validated
                .iter()
                .map(|t| t.transaction_date)
                .min()
                .unwrap_or_default()
                - pad;
            let end = validated
                .iter()
                .map(|t| t.transaction_date)
                .max()
                .unwrap_or_default()
                + pad;
            self.ledger.query_existing(org_id, start, end)?
        };
        let verdicts = self.detector.detect(&validated, &existing);

        let mut accepted: Vec<NormalizedTransaction> = Vec::new();
        let mut flags: Vec<DuplicateFlag> = Vec::new();
        for (tx, verdict) in validated.into_iter().zip(verdicts) {
            match verdict.status {
                DuplicateStatus::None => {
                    outcomes.push(RowOutcome {
                        table_index: tx.source_table_index,
                        source_row_index: tx.source_row_index,
                        disposition: Disposition::Accepted {
                            content_hash: tx.content_hash.clone(),
                        },
                    });
                    accepted.push(tx);
                }
                DuplicateStatus::ConfirmedDuplicate | DuplicateStatus::PendingReview => {
                    batch.rows_duplicate += 1;
                    // Flags only make sense against a persisted row; in-batch
                    // twins are fully described by the outcome. Confirmed
                    // matches are recorded pre-resolved, review ones pending.
                    if let Some(MatchedAgainst::Ledger(matched_id)) = verdict.matched {
                        let flag_status = if verdict.status == DuplicateStatus::PendingReview {
                            FlagStatus::Pending
                        } else {
                            FlagStatus::Confirmed
                        };
                        flags.push(DuplicateFlag {
                            id: None,
                            batch_id: Some(batch_id),
                            candidate_table_index: tx.source_table_index,
                            candidate_row_index: tx.source_row_index,
                            candidate_hash: tx.content_hash.clone(),
                            matched_transaction_id: matched_id,
                            confidence: verdict.confidence,
                            reasons: verdict.reasons.clone(),
                            status: flag_status,
                        });
                    }
                    outcomes.push(RowOutcome {
                        table_index: tx.source_table_index,
                        source_row_index: tx.source_row_index,
                        disposition: Disposition::Duplicate(verdict),
                    });
                }
            }
        }

        if let Err(e) = self.ledger.persist_accepted(batch_id, &accepted, &flags) {
            return Err(self.fail_batch(batch, e));
        }
        batch.rows_persisted = accepted.len() as i64;

        let status = if row_errors > 0 {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        };
        batch.error_log = if error_lines.is_empty() {
            None
        } else {
            Some(error_lines.join("\n"))
        };
        batch.finish(status);
        self.ledger.update_batch(&batch)?;
        info!(
            file = %source_file,
            status = batch.status.as_str(),
            persisted = batch.rows_persisted,
            duplicates = batch.rows_duplicate,
            errors = row_errors,
            "batch finished"
        );

        outcomes.sort_by_key(|o| (o.table_index, o.source_row_index));
        Ok(ImportBatchResult { batch, outcomes })
    }

    /// Record the terminal failure on the batch row, then hand the error up.
    fn fail_batch(&mut self, mut batch: ImportBatch, err: IngestError) -> IngestError {
        batch.error_log = Some(err.to_string());
        batch.finish(BatchStatus::Failed);
        if let Err(update_err) = self.ledger.update_batch(&batch) {
            warn!(error = %update_err, "could not record batch failure");
        }
        err
    }
}

fn validate(tx: &NormalizedTransaction) -> Result<()> {
    let reject = |reason: String| {
        Err(IngestError::Validation {
            row: tx.source_row_index,
            reason,
        })
    };
    if tx.description.trim().is_empty() {
        return reject("empty description".to_string());
    }
    if tx.amount.is_zero() {
        return reject("zero amount".to_string());
    }
    if tx.amount.abs() > max_amount() {
        return reject(format!("amount {} out of range", tx.amount));
    }
    if tx.transaction_date > chrono::Utc::now().date_naive() {
        return reject(format!("future date {}", tx.transaction_date));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::str::FromStr;

    use crate::ledger::MemoryLedger;
    use crate::normalizer::content_hash;
    use chrono::NaiveDate;

    const PREAMBLE: &str = "\
Fifth Third Bank,,
Statement Period Date: 05/01/2025 - 05/31/2025,,
";

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("{PREAMBLE}\n{body}")).unwrap();
        path
    }

    fn orchestrator() -> ImportBatchOrchestrator<MemoryLedger> {
        ImportBatchOrchestrator::new(IngestSettings::default(), MemoryLedger::new())
    }

    fn run(
        o: &mut ImportBatchOrchestrator<MemoryLedger>,
        path: &Path,
    ) -> Result<ImportBatchResult> {
        o.run(path, "org-1", "1234")
    }

    const TWO_ROWS: &str = "\
Date,Amount,Withdrawals / Debits
05/22,123.00,5/3 ONLINE PYMT TO DTE ENERGY
05/23,45.10,GROCERY OUTLET STORE
";

    #[test]
    fn test_happy_path_counters_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", TWO_ROWS);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.batch.status, BatchStatus::Completed);
        assert_eq!(result.batch.rows_extracted, 2);
        assert_eq!(result.batch.rows_classified_transaction, 2);
        assert_eq!(result.batch.rows_normalized, 2);
        assert_eq!(result.batch.rows_validated, 2);
        assert_eq!(result.batch.rows_duplicate, 0);
        assert_eq!(result.batch.rows_persisted, 2);
        assert_eq!(result.accepted(), 2);
        assert_eq!(o.ledger().rows.len(), 2);
        // Ledger amounts carry the debit sign from the column name.
        assert_eq!(
            o.ledger().rows[0].tx.amount,
            Decimal::from_str("-123.00").unwrap()
        );
        // The batch record is terminal in storage too.
        assert_eq!(o.ledger().batches[0].status, BatchStatus::Completed);
    }

    #[test]
    fn test_reimport_same_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", TWO_ROWS);
        let mut o = orchestrator();
        run(&mut o, &path).unwrap();
        let second = run(&mut o, &path).unwrap();

        assert_eq!(second.batch.status, BatchStatus::AlreadyImported);
        // The second run did no work and must say so.
        assert_eq!(second.batch.rows_persisted, 0);
        assert_eq!(second.batch.rows_extracted, 0);
        assert_eq!(second.batch.rows_duplicate, 0);
        assert!(second.outcomes.is_empty());
        assert_eq!(o.ledger().rows.len(), 2);
        // No new batch record, and the original keeps its status.
        assert_eq!(o.ledger().batches.len(), 1);
        assert_eq!(o.ledger().batches[0].status, BatchStatus::Completed);
    }

    #[test]
    fn test_edited_file_with_same_name_imports_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", TWO_ROWS);
        let mut o = orchestrator();
        run(&mut o, &path).unwrap();

        let extended = format!("{TWO_ROWS}05/24,9.99,NEW ROW VENDOR\n");
        let path = write_csv(dir.path(), "may.csv", &extended);
        let result = run(&mut o, &path).unwrap();
        assert_eq!(result.batch.status, BatchStatus::Completed);
        // The two overlapping rows dedupe on exact hash; one new row lands.
        assert_eq!(result.batch.rows_duplicate, 2);
        assert_eq!(result.batch.rows_persisted, 1);
        assert_eq!(o.ledger().rows.len(), 3);
    }

    #[test]
    fn test_partial_failure_counts_and_status() {
        let mut body = String::from("Date,Amount,Withdrawals / Debits\n");
        for day in 1..=8 {
            body.push_str(&format!("05/{day:02},10.00,VENDOR NUMBER {day}\n"));
        }
        body.push_str("05/09,not-money,BROKEN ROW ONE\n");
        body.push_str("05/10,12..50,BROKEN ROW TWO\n");

        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", &body);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.batch.status, BatchStatus::CompletedWithErrors);
        assert_eq!(result.batch.rows_classified_transaction, 10);
        assert_eq!(result.batch.rows_normalized, 8);
        assert_eq!(result.batch.rows_persisted, 8);
        assert_eq!(result.rejected(), 2);
        let log = result.batch.error_log.unwrap();
        assert!(log.contains("unparseable amount"));
    }

    #[test]
    fn test_balance_summary_table_is_excluded_end_to_end() {
        let body = "\
Date,Amount,Withdrawals / Debits
05/22,123.00,5/3 ONLINE PYMT TO DTE ENERGY

Date,Amount,Date,Amount
05/27,\"81,266.19\",06/05,\"77,746.93\"
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", body);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.batch.status, BatchStatus::Completed);
        assert_eq!(result.batch.rows_extracted, 2);
        assert_eq!(result.batch.rows_classified_transaction, 1);
        assert_eq!(result.batch.rows_persisted, 1);
        assert_eq!(o.ledger().rows.len(), 1);
        assert_eq!(
            o.ledger().rows[0].tx.description,
            "5/3 ONLINE PYMT TO DTE ENERGY"
        );
        // The exclusion is visible in the batch record, not silent.
        assert!(result.batch.error_log.unwrap().contains("excluded"));
    }

    #[test]
    fn test_document_without_transaction_tables_fails() {
        let body = "\
Date,Amount,Date,Amount
05/27,\"81,266.19\",06/05,\"77,746.93\"
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", body);
        let mut o = orchestrator();
        let err = run(&mut o, &path).unwrap_err();
        assert!(matches!(err, IngestError::Extraction(_)));
        assert_eq!(o.ledger().batches[0].status, BatchStatus::Failed);
        assert!(o.ledger().batches[0].error_log.is_some());
        assert!(o.ledger().rows.is_empty());
    }

    #[test]
    fn test_unsupported_format_is_rejected_before_any_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statement.pdf");
        std::fs::write(&path, "%PDF").unwrap();
        let mut o = orchestrator();
        let err = run(&mut o, &path).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
        assert!(o.ledger().batches.is_empty());
    }

    #[test]
    fn test_exact_ledger_duplicate_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", TWO_ROWS);
        let mut o = orchestrator();
        run(&mut o, &path).unwrap();

        // Same rows arrive under a different file name.
        let path2 = write_csv(dir.path(), "may-copy.csv", TWO_ROWS);
        let result = run(&mut o, &path2).unwrap();
        assert_eq!(result.batch.status, BatchStatus::Completed);
        assert_eq!(result.batch.rows_duplicate, 2);
        assert_eq!(result.batch.rows_persisted, 0);
        assert_eq!(o.ledger().rows.len(), 2);
        // Exact matches are recorded pre-resolved; nothing awaits review.
        assert_eq!(o.ledger().flags.len(), 2);
        assert!(o
            .ledger()
            .flags
            .iter()
            .all(|f| f.status == FlagStatus::Confirmed));
        assert!(o.ledger().pending_flags("org-1").unwrap().is_empty());
    }

    #[test]
    fn test_near_match_goes_to_review_not_ledger() {
        let mut o = orchestrator();
        let date = NaiveDate::from_ymd_opt(2025, 5, 22).unwrap();
        let amount = Decimal::from_str("-123.00").unwrap();
        let seeded = NormalizedTransaction {
            org_id: "org-1".to_string(),
            account_number: "1234".to_string(),
            transaction_date: date,
            amount,
            transaction_type: crate::models::TransactionType::Withdrawal,
            description: "ONLINE PYMT DTE".to_string(),
            raw_description: "ONLINE PYMT DTE".to_string(),
            method: crate::models::PaymentMethod::Other,
            source_file: "april.csv".to_string(),
            source_table_index: 0,
            source_row_index: 0,
            content_hash: content_hash("org-1", date, amount, "ONLINE PYMT DTE"),
        };
        let seeded_id = o.ledger_mut().seed(seeded);

        let body = "\
Date,Amount,Withdrawals / Debits
05/23,123.00,ONLINE PYMT GAS CO
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", body);
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.batch.rows_duplicate, 1);
        assert_eq!(result.batch.rows_persisted, 0);
        assert_eq!(o.ledger().rows.len(), 1);
        let flags = &o.ledger().flags;
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].matched_transaction_id, seeded_id);
        assert_eq!(flags[0].status, FlagStatus::Pending);
        assert!(flags[0].confidence >= 0.5 && flags[0].confidence < 0.85);
    }

    #[test]
    fn test_persistence_failure_marks_batch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", TWO_ROWS);
        let mut o = orchestrator();
        o.ledger_mut().fail_next_persist = true;
        let err = run(&mut o, &path).unwrap_err();
        assert!(matches!(err, IngestError::Other(_)));
        assert!(o.ledger().rows.is_empty());
        assert_eq!(o.ledger().batches[0].status, BatchStatus::Failed);
    }

    #[test]
    fn test_validation_rejects_zero_amount_and_future_date() {
        let future = chrono::Utc::now().date_naive() + Duration::days(30);
        let body = format!(
            "Date,Amount,Withdrawals / Debits\n\
             05/22,0.00,ZERO AMOUNT ROW\n\
             {},10.00,TIME TRAVELER ROW\n\
             05/23,45.10,GROCERY OUTLET STORE\n",
            future.format("%m/%d/%Y")
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", &body);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.batch.status, BatchStatus::CompletedWithErrors);
        assert_eq!(result.batch.rows_normalized, 3);
        assert_eq!(result.batch.rows_validated, 1);
        assert_eq!(result.batch.rows_persisted, 1);
        assert_eq!(result.rejected(), 2);
    }

    #[test]
    fn test_outcomes_distinguish_rows_across_tables() {
        // Two transaction tables, each with its own row 0.
        let body = "\
Date,Amount,Withdrawals / Debits
05/22,123.00,VENDOR ONE

Date,Amount,Deposits / Credits
05/23,45.10,VENDOR TWO
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", body);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();

        assert_eq!(result.accepted(), 2);
        let keys: Vec<(usize, usize)> = result
            .outcomes
            .iter()
            .map(|o| (o.table_index, o.source_row_index))
            .collect();
        assert_eq!(keys, vec![(0, 0), (1, 0)]);
        // The persisted rows keep the same provenance.
        assert_eq!(o.ledger().rows[0].tx.source_table_index, 0);
        assert_eq!(o.ledger().rows[1].tx.source_table_index, 1);
    }

    #[test]
    fn test_outcomes_account_for_every_row() {
        let body = "\
Date,Amount,Withdrawals / Debits
05/22,123.00,VENDOR ONE
bad,10.00,BROKEN ROW
05/23,45.10,VENDOR TWO
";
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "may.csv", body);
        let mut o = orchestrator();
        let result = run(&mut o, &path).unwrap();
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.accepted() + result.rejected() + result.flagged(), 3);
    }
}
