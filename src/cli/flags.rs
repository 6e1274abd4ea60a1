use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::ledger::{Ledger, SqliteLedger};
use crate::models::FlagStatus;
use crate::settings::get_data_dir;

pub fn list(org: &str) -> Result<()> {
    let ledger = SqliteLedger::open(&get_data_dir().join("tally.db"))?;
    let flags = ledger.pending_flags(org)?;

    if flags.is_empty() {
        println!("No pending flags for {org}.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Batch", "Table", "Row", "Matched Tx", "Confidence", "Reasons",
    ]);
    for f in flags {
        table.add_row(vec![
            Cell::new(f.id.unwrap_or_default()),
            Cell::new(f.batch_id.unwrap_or_default()),
            Cell::new(f.candidate_table_index),
            Cell::new(f.candidate_row_index),
            Cell::new(f.matched_transaction_id),
            Cell::new(format!("{:.2}", f.confidence)),
            Cell::new(f.reasons.join("; ")),
        ]);
    }
    println!("Pending duplicate flags\n{table}");
    Ok(())
}

pub fn resolve(id: i64, status: FlagStatus) -> Result<()> {
    let mut ledger = SqliteLedger::open(&get_data_dir().join("tally.db"))?;
    ledger.resolve_flag(id, status)?;
    println!("Flag {id} marked {}.", status.as_str());
    Ok(())
}
