use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{
    BatchStatus, DuplicateFlag, FlagStatus, ImportBatch, LedgerRow, NormalizedTransaction,
    PaymentMethod, TransactionType,
};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS import_batches (
    id INTEGER PRIMARY KEY,
    org_id TEXT NOT NULL,
    source_file TEXT NOT NULL,
    checksum TEXT NOT NULL,
    import_started_at TEXT NOT NULL,
    import_finished_at TEXT,
    rows_extracted INTEGER DEFAULT 0,
    rows_classified_transaction INTEGER DEFAULT 0,
    rows_normalized INTEGER DEFAULT 0,
    rows_validated INTEGER DEFAULT 0,
    rows_duplicate INTEGER DEFAULT 0,
    rows_persisted INTEGER DEFAULT 0,
    status TEXT NOT NULL,
    error_log TEXT
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    org_id TEXT NOT NULL,
    account_number TEXT NOT NULL,
    transaction_date TEXT NOT NULL,
    amount TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    description TEXT NOT NULL,
    raw_description TEXT NOT NULL,
    method TEXT NOT NULL,
    source_file TEXT NOT NULL,
    source_table_index INTEGER NOT NULL,
    source_row_index INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    import_batch_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (import_batch_id) REFERENCES import_batches(id),
    UNIQUE (org_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_transactions_org_date
    ON transactions(org_id, transaction_date);

CREATE TABLE IF NOT EXISTS duplicate_flags (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER,
    candidate_table_index INTEGER NOT NULL,
    candidate_row_index INTEGER NOT NULL,
    candidate_hash TEXT NOT NULL,
    matched_transaction_id INTEGER NOT NULL,
    confidence REAL NOT NULL,
    reasons TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (batch_id) REFERENCES import_batches(id),
    FOREIGN KEY (matched_transaction_id) REFERENCES transactions(id)
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

/// Storage seam for the pipeline. The real store is SQLite; tests use the
/// in-memory fake. Dates and amounts cross this boundary as their canonical
/// string forms (ISO date, fixed-point decimal), never as floats.
pub trait Ledger {
    /// Persisted transactions for an org whose date falls in `[start, end]`,
    /// both inclusive.
    fn query_existing(&self, org_id: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<LedgerRow>>;

    /// A prior batch for this file that already counts as imported, if any.
    /// Matches on file name plus checksum, so a renamed or edited file
    /// imports fresh.
    fn find_completed_batch(
        &self,
        org_id: &str,
        source_file: &str,
        checksum: &str,
    ) -> Result<Option<ImportBatch>>;

    fn insert_batch(&mut self, batch: &ImportBatch) -> Result<i64>;

    fn update_batch(&mut self, batch: &ImportBatch) -> Result<()>;

    /// Write the accepted transactions and review flags of one batch
    /// atomically. Either every row lands or none do.
    fn persist_accepted(
        &mut self,
        batch_id: i64,
        accepted: &[NormalizedTransaction],
        flags: &[DuplicateFlag],
    ) -> Result<Vec<i64>>;

    fn recent_batches(&self, org_id: &str, limit: usize) -> Result<Vec<ImportBatch>>;

    fn pending_flags(&self, org_id: &str) -> Result<Vec<DuplicateFlag>>;

    fn resolve_flag(&mut self, flag_id: i64, status: FlagStatus) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = get_connection(db_path)?;
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn map_ledger_row(row: &rusqlite::Row) -> rusqlite::Result<LedgerRow> {
    let date_text: String = row.get("transaction_date")?;
    let amount_text: String = row.get("amount")?;
    let transaction_date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let amount = Decimal::from_str(&amount_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let type_text: String = row.get("transaction_type")?;
    let method_text: String = row.get("method")?;
    Ok(LedgerRow {
        id: row.get("id")?,
        tx: NormalizedTransaction {
            org_id: row.get("org_id")?,
            account_number: row.get("account_number")?,
            transaction_date,
            amount,
            transaction_type: TransactionType::parse(&type_text),
            description: row.get("description")?,
            raw_description: row.get("raw_description")?,
            method: PaymentMethod::parse(&method_text),
            source_file: row.get("source_file")?,
            source_table_index: row.get::<_, i64>("source_table_index")? as usize,
            source_row_index: row.get::<_, i64>("source_row_index")? as usize,
            content_hash: row.get("content_hash")?,
        },
    })
}

fn map_batch(row: &rusqlite::Row) -> rusqlite::Result<ImportBatch> {
    let status_text: String = row.get("status")?;
    Ok(ImportBatch {
        id: Some(row.get("id")?),
        org_id: row.get("org_id")?,
        source_file: row.get("source_file")?,
        checksum: row.get("checksum")?,
        import_started_at: row.get("import_started_at")?,
        import_finished_at: row.get("import_finished_at")?,
        rows_extracted: row.get("rows_extracted")?,
        rows_classified_transaction: row.get("rows_classified_transaction")?,
        rows_normalized: row.get("rows_normalized")?,
        rows_validated: row.get("rows_validated")?,
        rows_duplicate: row.get("rows_duplicate")?,
        rows_persisted: row.get("rows_persisted")?,
        status: BatchStatus::parse(&status_text),
        error_log: row.get("error_log")?,
    })
}

fn map_flag(row: &rusqlite::Row) -> rusqlite::Result<DuplicateFlag> {
    let reasons_text: String = row.get("reasons")?;
    let status_text: String = row.get("status")?;
    Ok(DuplicateFlag {
        id: Some(row.get("id")?),
        batch_id: row.get("batch_id")?,
        candidate_table_index: row.get::<_, i64>("candidate_table_index")? as usize,
        candidate_row_index: row.get::<_, i64>("candidate_row_index")? as usize,
        candidate_hash: row.get("candidate_hash")?,
        matched_transaction_id: row.get("matched_transaction_id")?,
        confidence: row.get("confidence")?,
        reasons: serde_json::from_str(&reasons_text).unwrap_or_default(),
        status: FlagStatus::parse(&status_text),
    })
}

impl Ledger for SqliteLedger {
    fn query_existing(
        &self,
        org_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT * FROM transactions
             WHERE org_id = ?1 AND transaction_date >= ?2 AND transaction_date <= ?3
             ORDER BY transaction_date, id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    org_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string()
                ],
                map_ledger_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn find_completed_batch(
        &self,
        org_id: &str,
        source_file: &str,
        checksum: &str,
    ) -> Result<Option<ImportBatch>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT * FROM import_batches
             WHERE org_id = ?1 AND source_file = ?2 AND checksum = ?3
               AND status IN ('COMPLETED', 'COMPLETED_WITH_ERRORS')
             ORDER BY id DESC LIMIT 1",
        )?;
        let batch = stmt
            .query_row(params![org_id, source_file, checksum], map_batch)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(batch)
    }

    fn insert_batch(&mut self, batch: &ImportBatch) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO import_batches (org_id, source_file, checksum, import_started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                batch.org_id,
                batch.source_file,
                batch.checksum,
                batch.import_started_at,
                batch.status.as_str()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_batch(&mut self, batch: &ImportBatch) -> Result<()> {
        self.conn.execute(
            "UPDATE import_batches SET
                import_finished_at = ?1,
                rows_extracted = ?2,
                rows_classified_transaction = ?3,
                rows_normalized = ?4,
                rows_validated = ?5,
                rows_duplicate = ?6,
                rows_persisted = ?7,
                status = ?8,
                error_log = ?9
             WHERE id = ?10",
            params![
                batch.import_finished_at,
                batch.rows_extracted,
                batch.rows_classified_transaction,
                batch.rows_normalized,
                batch.rows_validated,
                batch.rows_duplicate,
                batch.rows_persisted,
                batch.status.as_str(),
                batch.error_log,
                batch.id
            ],
        )?;
        Ok(())
    }

    fn persist_accepted(
        &mut self,
        batch_id: i64,
        accepted: &[NormalizedTransaction],
        flags: &[DuplicateFlag],
    ) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(accepted.len());
        for t in accepted {
            tx.execute(
                "INSERT INTO transactions (org_id, account_number, transaction_date, amount,
                    transaction_type, description, raw_description, method, source_file,
                    source_table_index, source_row_index, content_hash, import_batch_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    t.org_id,
                    t.account_number,
                    t.transaction_date.format("%Y-%m-%d").to_string(),
                    t.amount.to_string(),
                    t.transaction_type.as_str(),
                    t.description,
                    t.raw_description,
                    t.method.as_str(),
                    t.source_file,
                    t.source_table_index as i64,
                    t.source_row_index as i64,
                    t.content_hash,
                    batch_id
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        for flag in flags {
            tx.execute(
                "INSERT INTO duplicate_flags (batch_id, candidate_table_index,
                    candidate_row_index, candidate_hash, matched_transaction_id,
                    confidence, reasons, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    batch_id,
                    flag.candidate_table_index as i64,
                    flag.candidate_row_index as i64,
                    flag.candidate_hash,
                    flag.matched_transaction_id,
                    flag.confidence,
                    serde_json::to_string(&flag.reasons).unwrap_or_else(|_| "[]".to_string()),
                    flag.status.as_str()
                ],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn recent_batches(&self, org_id: &str, limit: usize) -> Result<Vec<ImportBatch>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT * FROM import_batches WHERE org_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let batches = stmt
            .query_map(params![org_id, limit as i64], map_batch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    fn pending_flags(&self, org_id: &str) -> Result<Vec<DuplicateFlag>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT f.* FROM duplicate_flags f
             JOIN import_batches b ON b.id = f.batch_id
             WHERE b.org_id = ?1 AND f.status = 'PENDING'
             ORDER BY f.id",
        )?;
        let flags = stmt
            .query_map(params![org_id], map_flag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(flags)
    }

    fn resolve_flag(&mut self, flag_id: i64, status: FlagStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE duplicate_flags SET status = ?1 WHERE id = ?2",
            params![status.as_str(), flag_id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory fake for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLedger {
    pub rows: Vec<LedgerRow>,
    pub batches: Vec<ImportBatch>,
    pub flags: Vec<DuplicateFlag>,
    /// When set, the next `persist_accepted` fails without writing anything.
    pub fail_next_persist: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, tx: NormalizedTransaction) -> i64 {
        let id = self.rows.len() as i64 + 1;
        self.rows.push(LedgerRow { id, tx });
        id
    }
}

impl Ledger for MemoryLedger {
    fn query_existing(
        &self,
        org_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                r.tx.org_id == org_id
                    && r.tx.transaction_date >= start
                    && r.tx.transaction_date <= end
            })
            .cloned()
            .collect())
    }

    fn find_completed_batch(
        &self,
        org_id: &str,
        source_file: &str,
        checksum: &str,
    ) -> Result<Option<ImportBatch>> {
        Ok(self
            .batches
            .iter()
            .rev()
            .find(|b| {
                b.org_id == org_id
                    && b.source_file == source_file
                    && b.checksum == checksum
                    && b.status.counts_as_imported()
            })
            .cloned())
    }

    fn insert_batch(&mut self, batch: &ImportBatch) -> Result<i64> {
        let id = self.batches.len() as i64 + 1;
        let mut stored = batch.clone();
        stored.id = Some(id);
        self.batches.push(stored);
        Ok(id)
    }

    fn update_batch(&mut self, batch: &ImportBatch) -> Result<()> {
        if let Some(slot) = self.batches.iter_mut().find(|b| b.id == batch.id) {
            *slot = batch.clone();
        }
        Ok(())
    }

    fn persist_accepted(
        &mut self,
        batch_id: i64,
        accepted: &[NormalizedTransaction],
        flags: &[DuplicateFlag],
    ) -> Result<Vec<i64>> {
        if self.fail_next_persist {
            self.fail_next_persist = false;
            return Err(crate::error::IngestError::Other(
                "injected persist failure".to_string(),
            ));
        }
        let mut ids = Vec::new();
        for t in accepted {
            ids.push(self.seed(t.clone()));
        }
        for flag in flags {
            let mut stored = flag.clone();
            stored.id = Some(self.flags.len() as i64 + 1);
            stored.batch_id = Some(batch_id);
            self.flags.push(stored);
        }
        Ok(ids)
    }

    fn recent_batches(&self, org_id: &str, limit: usize) -> Result<Vec<ImportBatch>> {
        Ok(self
            .batches
            .iter()
            .rev()
            .filter(|b| b.org_id == org_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn pending_flags(&self, _org_id: &str) -> Result<Vec<DuplicateFlag>> {
        Ok(self
            .flags
            .iter()
            .filter(|f| f.status == FlagStatus::Pending)
            .cloned()
            .collect())
    }

    fn resolve_flag(&mut self, flag_id: i64, status: FlagStatus) -> Result<()> {
        if let Some(flag) = self.flags.iter_mut().find(|f| f.id == Some(flag_id)) {
            flag.status = status;
        }
        Ok(())
    }
}
