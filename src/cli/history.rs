use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::fmt::status_colored;
use crate::ledger::{Ledger, SqliteLedger};
use crate::settings::get_data_dir;

pub fn run(org: &str, limit: usize) -> Result<()> {
    let ledger = SqliteLedger::open(&get_data_dir().join("tally.db"))?;
    let batches = ledger.recent_batches(org, limit)?;

    if batches.is_empty() {
        println!("No import batches for {org}.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "File", "Started", "Status", "Extracted", "Persisted", "Dupes",
    ]);
    for b in batches {
        table.add_row(vec![
            Cell::new(b.id.unwrap_or_default()),
            Cell::new(&b.source_file),
            Cell::new(b.import_started_at.chars().take(19).collect::<String>()),
            Cell::new(status_colored(b.status)),
            Cell::new(b.rows_extracted),
            Cell::new(b.rows_persisted),
            Cell::new(b.rows_duplicate),
        ]);
    }
    println!("Import history\n{table}");
    Ok(())
}
