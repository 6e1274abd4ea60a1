use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{RawTable, RawTableRow};
use crate::settings::IngestSettings;

// Keywords that mark a header as naming a transaction section/column.
const TRANSACTION_KEYWORDS: &[&str] = &["withdrawal", "deposit", "debit", "credit", "checks"];

const AMOUNT_HEADERS: &[&str] = &[
    "amount",
    "withdrawal",
    "deposit",
    "debit",
    "credit",
];

// Row text that gives away a balance table even when the headers look fine.
const BALANCE_PHRASES: &[&str] = &[
    "beginning balance",
    "ending balance",
    "previous balance",
    "total balance",
    "credit limit",
    "available credit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Transaction,
    BalanceSummary,
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "TRANSACTION",
            Self::BalanceSummary => "BALANCE_SUMMARY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedTable {
    pub table: RawTable,
    pub label: Label,
    /// Exclusion reason for non-Transaction labels, for the batch log.
    pub reason: Option<String>,
}

/// Labels extracted tables as transaction rows versus balance/summary noise.
///
/// Balance-summary and transaction tables share the same date+amount column
/// shape in many bank exports, so header checks alone under-filter; the
/// content scan is the second line of defense. Classification never fails:
/// an ambiguous table becomes `Unknown` and is reported, not guessed into
/// `Transaction`.
pub struct TableClassifier {
    stoplist: Vec<String>,
    large_amount_threshold: Decimal,
    date_cell_re: Regex,
}

impl TableClassifier {
    pub fn new(settings: &IngestSettings) -> Self {
        Self {
            stoplist: settings
                .balance_stoplist
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            large_amount_threshold: settings.large_amount_threshold,
            date_cell_re: Regex::new(r"^\d{1,2}/\d{1,2}(/\d{2,4})?$").unwrap(),
        }
    }

    /// Ordered chain: stoplist exclusion, content-based balance override,
    /// then shape inclusion. The content scan runs before inclusion so that
    /// a continuation-page balance grid with bare headers still lands in
    /// `BalanceSummary` rather than `Unknown`.
    pub fn classify(&self, tables: Vec<RawTable>) -> Vec<ClassifiedTable> {
        tables
            .into_iter()
            .map(|table| {
                if let Some(phrase) = self.header_stoplist_hit(&table) {
                    debug!(table = table.table_index, %phrase, "stoplisted header");
                    return ClassifiedTable {
                        table,
                        label: Label::BalanceSummary,
                        reason: Some(format!("stoplisted header phrase: {phrase}")),
                    };
                }
                if let Some(reason) = self.content_balance_override(&table) {
                    debug!(table = table.table_index, %reason, "content override");
                    return ClassifiedTable {
                        table,
                        label: Label::BalanceSummary,
                        reason: Some(reason),
                    };
                }
                if let Some(reason) = self.missing_transaction_shape(&table) {
                    debug!(table = table.table_index, %reason, "not a transaction shape");
                    return ClassifiedTable {
                        table,
                        label: Label::Unknown,
                        reason: Some(reason),
                    };
                }
                ClassifiedTable {
                    table,
                    label: Label::Transaction,
                    reason: None,
                }
            })
            .collect()
    }

    /// Rows of `Transaction`-labeled tables, in table order then row order.
    pub fn extract_rows(&self, classified: &[ClassifiedTable]) -> Vec<RawTableRow> {
        let mut out = Vec::new();
        for ct in classified {
            if ct.label != Label::Transaction {
                continue;
            }
            for (row_index, cells) in ct.table.rows.iter().enumerate() {
                if cells.iter().all(|c| c.trim().is_empty()) {
                    continue;
                }
                out.push(RawTableRow {
                    source_file: ct.table.source_file.clone(),
                    table_index: ct.table.table_index,
                    row_index,
                    headers: ct.table.headers.clone(),
                    cells: cells.clone(),
                });
            }
        }
        out
    }

    // -- predicates ---------------------------------------------------------

    fn header_stoplist_hit(&self, table: &RawTable) -> Option<String> {
        let header = table.header_text();
        self.stoplist
            .iter()
            .find(|phrase| header.contains(phrase.as_str()))
            .cloned()
    }

    /// `None` when the table passes inclusion; otherwise the reason it fails.
    fn missing_transaction_shape(&self, table: &RawTable) -> Option<String> {
        if table.rows.is_empty() {
            return Some("no data rows".to_string());
        }
        let headers: Vec<String> = table.headers.iter().map(|h| h.to_lowercase()).collect();
        if !headers.iter().any(|h| h.contains("date")) {
            return Some("no date-like column".to_string());
        }
        if !headers
            .iter()
            .any(|h| AMOUNT_HEADERS.iter().any(|k| h.contains(k)))
        {
            return Some("no amount-like column".to_string());
        }
        if !headers
            .iter()
            .any(|h| TRANSACTION_KEYWORDS.iter().any(|k| h.contains(k)))
        {
            return Some("no transaction keyword in headers".to_string());
        }
        None
    }

    /// The classic "running balance" shape: a large amount next to a short
    /// date-shaped cell in a row with no descriptive text, or balance
    /// phrasing inside the rows. An ordinary transaction row also puts a
    /// date beside its amount, so the override additionally requires the
    /// row to lack a description cell before the threshold fires.
    fn content_balance_override(&self, table: &RawTable) -> Option<String> {
        for cells in &table.rows {
            let row_text = cells.join(" ").to_lowercase();
            if let Some(phrase) = BALANCE_PHRASES.iter().find(|p| row_text.contains(*p)) {
                return Some(format!("balance phrase in row: {phrase}"));
            }
            if has_description_cell(cells) {
                continue;
            }
            for (i, cell) in cells.iter().enumerate() {
                let Some(amount) = parse_cell_amount(cell) else {
                    continue;
                };
                if amount.abs() < self.large_amount_threshold {
                    continue;
                }
                let neighbor_is_date = [i.checked_sub(1), Some(i + 1)]
                    .into_iter()
                    .flatten()
                    .filter_map(|j| cells.get(j))
                    .any(|c| self.looks_like_date(c));
                if neighbor_is_date {
                    return Some(format!(
                        "amount {amount} at or above threshold beside a date cell"
                    ));
                }
            }
        }
        None
    }

    fn looks_like_date(&self, cell: &str) -> bool {
        self.date_cell_re.is_match(cell.trim())
    }
}

/// A cell that reads like free text: two or more words, or a long run of
/// letters. Balance grids carry only dates and amounts.
fn has_description_cell(cells: &[String]) -> bool {
    cells.iter().any(|c| {
        let c = c.trim();
        let words = c
            .split_whitespace()
            .filter(|w| w.chars().any(|ch| ch.is_alphabetic()))
            .count();
        words >= 2 || (words == 1 && c.len() > 12)
    })
}

/// Lenient amount reading for the content scan only; the normalizer owns the
/// strict parse.
fn parse_cell_amount(cell: &str) -> Option<Decimal> {
    let s = cell.trim().replace(['$', ',', '"'], "");
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return inner.trim().parse::<Decimal>().ok().map(|d| -d);
    }
    s.parse::<Decimal>().ok()
}
