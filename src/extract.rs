use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::models::RawTable;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string()
}

// ---------------------------------------------------------------------------
// Extraction output
// ---------------------------------------------------------------------------

/// Everything pulled out of one source document: the tables, in document
/// order, plus the loose text between them (account headers, statement
/// period lines, disclaimers).
#[derive(Debug, Default)]
pub struct Extraction {
    pub tables: Vec<RawTable>,
    pub free_text: Vec<String>,
}

// ---------------------------------------------------------------------------
// Source kinds — enum dispatch instead of trait objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind {
    /// Bank CSV export: preamble lines, then one or more header+rows
    /// sections separated by blank records.
    Csv,
    /// Pre-extracted document dump, as produced by a PDF table extractor:
    /// `{"tables": [{"headers": [...], "rows": [[...]]}], "free_text": [...]}`.
    JsonTables,
}

impl SourceKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::JsonTables => "json",
        }
    }

    pub fn for_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::JsonTables),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extract(&self, file_path: &Path) -> Result<Extraction> {
        match self {
            Self::Csv => extract_csv(file_path),
            Self::JsonTables => extract_json_tables(file_path),
        }
    }
}

/// Run the extraction on a worker thread and give up after `timeout_secs`.
/// A wedged parse must not hang the whole batch.
pub fn extract_with_timeout(
    kind: SourceKind,
    file_path: &Path,
    timeout_secs: u64,
) -> Result<Extraction> {
    let path: PathBuf = file_path.to_path_buf();
    run_with_timeout(move || kind.extract(&path), timeout_secs)
}

pub(crate) fn run_with_timeout<F, T>(f: F, timeout_secs: u64) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        // Receiver may be gone after a timeout; nothing to do about it.
        let _ = tx.send(f());
    });
    match rx.recv_timeout(Duration::from_secs(timeout_secs)) {
        Ok(result) => result,
        Err(_) => Err(IngestError::ExtractionTimeout(timeout_secs)),
    }
}

// ---------------------------------------------------------------------------
// CSV extraction
// ---------------------------------------------------------------------------

const HEADER_KEYWORDS: &[&str] = &[
    "amount",
    "withdrawal",
    "deposit",
    "debit",
    "credit",
    "description",
    "balance",
    "checks",
];

/// A record reads as a section header when it has a date-named column next
/// to at least one other known column name and carries no numeric data of
/// its own.
fn is_header_record(fields: &[String]) -> bool {
    let lowered: Vec<String> = fields.iter().map(|f| f.trim().to_lowercase()).collect();
    let has_date = lowered.iter().any(|f| f.contains("date"));
    let has_known = lowered
        .iter()
        .any(|f| HEADER_KEYWORDS.iter().any(|k| f.contains(k)));
    let has_numeric = lowered
        .iter()
        .any(|f| !f.is_empty() && f.replace(['$', ',', '.', '-', '(', ')'], "").parse::<i64>().is_ok());
    has_date && has_known && !has_numeric
}

fn extract_csv(file_path: &Path) -> Result<Extraction> {
    let file = std::fs::File::open(file_path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(std::io::BufReader::new(file));

    let source = file_name(file_path);
    let mut out = Extraction::default();
    let mut current: Option<RawTable> = None;

    for result in rdr.records() {
        let record = result?;
        let fields: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        let blank = fields.iter().all(|f| f.trim().is_empty());

        if blank {
            // Blank record closes the open section.
            if let Some(table) = current.take() {
                out.tables.push(table);
            }
            continue;
        }
        if is_header_record(&fields) {
            if let Some(table) = current.take() {
                out.tables.push(table);
            }
            current = Some(RawTable {
                source_file: source.clone(),
                table_index: out.tables.len(),
                headers: fields.iter().map(|f| f.trim().to_string()).collect(),
                rows: Vec::new(),
            });
            continue;
        }
        match current.as_mut() {
            Some(table) => table.rows.push(fields),
            // Anything before the first header is document prose.
            None => out.free_text.push(
                fields
                    .iter()
                    .map(|f| f.trim())
                    .filter(|f| !f.is_empty())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        }
    }
    if let Some(table) = current.take() {
        out.tables.push(table);
    }

    debug!(
        file = %source,
        tables = out.tables.len(),
        free_text = out.free_text.len(),
        "csv extraction done"
    );
    if out.tables.is_empty() && out.free_text.is_empty() {
        return Err(IngestError::Extraction(format!("{source}: empty document")));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// JSON table-dump extraction
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct JsonTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct JsonDocument {
    #[serde(default)]
    tables: Vec<JsonTable>,
    #[serde(default)]
    free_text: Vec<String>,
}

fn extract_json_tables(file_path: &Path) -> Result<Extraction> {
    let content = std::fs::read_to_string(file_path)?;
    let doc: JsonDocument = serde_json::from_str(&content)?;
    let source = file_name(file_path);
    let tables = doc
        .tables
        .into_iter()
        .enumerate()
        .map(|(table_index, t)| RawTable {
            source_file: source.clone(),
            table_index,
            headers: t.headers,
            rows: t.rows,
        })
        .collect();
    Ok(Extraction {
        tables,
        free_text: doc.free_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const SAMPLE_CSV: &str = "\
Fifth Third Bank,,
Statement Period Date: 05/01/2025 - 05/31/2025,,

Date,Amount,Withdrawals / Debits
05/22,123.00,5/3 ONLINE PYMT TO DTE ENERGY
05/23,45.10,DEBIT CARD - STAR MARKET

Date,Amount,Date,Amount
05/27,\"81,266.19\",06/05,\"77,746.93\"
";

    #[test]
    fn test_source_kind_by_extension() {
        assert_eq!(SourceKind::for_path(Path::new("a.csv")).unwrap(), SourceKind::Csv);
        assert_eq!(SourceKind::for_path(Path::new("a.CSV")).unwrap(), SourceKind::Csv);
        assert_eq!(
            SourceKind::for_path(Path::new("a.json")).unwrap(),
            SourceKind::JsonTables
        );
        assert!(matches!(
            SourceKind::for_path(Path::new("a.pdf")),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_csv_splits_tables_and_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "may.csv", SAMPLE_CSV);
        let out = SourceKind::Csv.extract(&path).unwrap();
        assert_eq!(out.tables.len(), 2);
        assert_eq!(
            out.tables[0].headers,
            vec!["Date", "Amount", "Withdrawals / Debits"]
        );
        assert_eq!(out.tables[0].rows.len(), 2);
        assert_eq!(out.tables[0].rows[0][2], "5/3 ONLINE PYMT TO DTE ENERGY");
        assert_eq!(out.tables[1].table_index, 1);
        assert_eq!(out.tables[1].rows[0][1], "81,266.19");
        assert!(out
            .free_text
            .iter()
            .any(|t| t.contains("Statement Period Date")));
    }

    #[test]
    fn test_csv_empty_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.csv", "");
        assert!(matches!(
            SourceKind::Csv.extract(&path),
            Err(IngestError::Extraction(_))
        ));
    }

    #[test]
    fn test_header_record_detection() {
        let h = |fields: &[&str]| {
            is_header_record(&fields.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };
        assert!(h(&["Date", "Amount", "Withdrawals / Debits"]));
        assert!(h(&["Date", "Description", "Amount", "Running Bal."]));
        // Data rows carry numbers; prose carries no date column.
        assert!(!h(&["05/22", "123.00", "coffee"]));
        assert!(!h(&["Fifth Third Bank", "", ""]));
    }

    #[test]
    fn test_json_tables_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "may.json",
            r#"{
                "tables": [
                    {"headers": ["Date", "Amount", "Withdrawals"],
                     "rows": [["05/22", "123.00", "DTE ENERGY"]]}
                ],
                "free_text": ["Statement Period Date: 05/01/2025 - 05/31/2025"]
            }"#,
        );
        let out = SourceKind::JsonTables.extract(&path).unwrap();
        assert_eq!(out.tables.len(), 1);
        assert_eq!(out.tables[0].source_file, "may.json");
        assert_eq!(out.tables[0].rows[0][2], "DTE ENERGY");
        assert_eq!(out.free_text.len(), 1);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.json", "{not json");
        assert!(matches!(
            SourceKind::JsonTables.extract(&path),
            Err(IngestError::Json(_))
        ));
    }

    #[test]
    fn test_timeout_fires_on_slow_work() {
        let result: Result<()> = run_with_timeout(
            || {
                std::thread::sleep(Duration::from_secs(5));
                Ok(())
            },
            1,
        );
        assert!(matches!(result, Err(IngestError::ExtractionTimeout(1))));
    }

    #[test]
    fn test_timeout_passes_fast_work_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "may.csv", SAMPLE_CSV);
        let out = extract_with_timeout(SourceKind::Csv, &path, 30).unwrap();
        assert_eq!(out.tables.len(), 2);
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.csv", "one");
        let b = write_file(dir.path(), "b.csv", "one");
        let c = write_file(dir.path(), "c.csv", "two");
        assert_eq!(
            compute_checksum(&a).unwrap(),
            compute_checksum(&b).unwrap()
        );
        assert_ne!(
            compute_checksum(&a).unwrap(),
            compute_checksum(&c).unwrap()
        );
    }
}
