use std::path::PathBuf;

use crate::error::Result;
use crate::ledger::SqliteLedger;
use crate::settings::{load_settings, save_settings};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = dir;
    }
    let dir = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&dir)?;

    let db_path = dir.join("tally.db");
    SqliteLedger::open(&db_path)?;
    save_settings(&settings)?;

    println!("Data dir:   {}", dir.display());
    println!("Database:   {}", db_path.display());
    println!("Ready. Import a statement with `tally ingest`.");
    Ok(())
}
