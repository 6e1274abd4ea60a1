use std::path::PathBuf;

use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::fmt::status_colored;
use crate::ledger::{Ledger, SqliteLedger};
use crate::models::{BatchStatus, Disposition};
use crate::pipeline::ImportBatchOrchestrator;
use crate::settings::{get_data_dir, load_settings};

pub fn run(file: &str, org: &str, account: &str) -> Result<()> {
    let file_path = PathBuf::from(file);
    let settings = load_settings();
    let ledger = SqliteLedger::open(&get_data_dir().join("tally.db"))?;
    let mut orchestrator = ImportBatchOrchestrator::new(settings, ledger);

    let result = orchestrator.run(&file_path, org, account)?;

    if result.batch.status == BatchStatus::AlreadyImported {
        println!("This file has already been imported (same name and checksum).");
        return Ok(());
    }

    println!("Status:      {}", status_colored(result.batch.status));
    println!("Extracted:   {}", result.batch.rows_extracted);
    println!("Transaction: {}", result.batch.rows_classified_transaction);
    println!("Normalized:  {}", result.batch.rows_normalized);
    println!("Validated:   {}", result.batch.rows_validated);
    println!("Duplicates:  {}", result.batch.rows_duplicate);
    println!("Persisted:   {}", result.batch.rows_persisted);

    let duplicates: Vec<_> = result
        .outcomes
        .iter()
        .filter_map(|o| match &o.disposition {
            Disposition::Duplicate(v) => Some((o.table_index, o.source_row_index, v)),
            _ => None,
        })
        .collect();
    if !duplicates.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Table", "Row", "Status", "Confidence", "Reasons"]);
        for (table_index, row, verdict) in duplicates {
            table.add_row(vec![
                Cell::new(table_index),
                Cell::new(row),
                Cell::new(format!("{:?}", verdict.status)),
                Cell::new(format!("{:.2}", verdict.confidence)),
                Cell::new(verdict.reasons.join("; ")),
            ]);
        }
        println!("\nDuplicates\n{table}");
    }

    if let Some(log) = &result.batch.error_log {
        println!("\nNotes:");
        for line in log.lines() {
            println!("  {line}");
        }
    }

    let pending = orchestrator.ledger().pending_flags(org)?;
    if !pending.is_empty() {
        println!(
            "\n{} flag(s) awaiting review. Run `tally flags list --org {org}`.",
            pending.len()
        );
    }
    Ok(())
}
