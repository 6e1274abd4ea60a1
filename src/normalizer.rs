use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::error::{IngestError, Result};
use crate::models::{NormalizedTransaction, PaymentMethod, RawTableRow, TransactionType};
use crate::settings::IngestSettings;

// ---------------------------------------------------------------------------
// Batch context
// ---------------------------------------------------------------------------

/// Per-batch state the normalizer needs: which org/account the document
/// belongs to, the statement period for MM/DD year inference, and the
/// sign hint carried forward across continuation rows of each table.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub org_id: String,
    pub account_number: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    carried_hints: HashMap<usize, TransactionType>,
}

impl BatchContext {
    pub fn new(org_id: &str, account_number: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            account_number: account_number.to_string(),
            period_start: None,
            period_end: None,
            carried_hints: HashMap::new(),
        }
    }

    pub fn with_period(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.period_start = Some(start);
        self.period_end = Some(end);
        self
    }
}

/// Pull a "Statement Period Date: MM/DD/YYYY - MM/DD/YYYY" span out of the
/// extractor's free-text items, when the bank prints one.
pub fn statement_period(free_text: &[String]) -> Option<(NaiveDate, NaiveDate)> {
    let re = Regex::new(
        r"(?i)Statement\s+Period\s+Date\s*:\s*(\d{1,2}/\d{1,2}/\d{4})\s*-\s*(\d{1,2}/\d{1,2}/\d{4})",
    )
    .unwrap();
    for text in free_text {
        if let Some(caps) = re.captures(text) {
            let start = NaiveDate::parse_from_str(&caps[1], "%m/%d/%Y").ok()?;
            let end = NaiveDate::parse_from_str(&caps[2], "%m/%d/%Y").ok()?;
            return Some((start, end));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

const AMOUNT_HEADER_CANDIDATES: &[&str] = &["amount", "withdrawal", "deposit", "debit", "credit"];

pub struct TransactionNormalizer {
    max_description_len: usize,
    date_md_re: Regex,
    money_re: Regex,
    check_cell_re: Regex,
    boilerplate_re: Regex,
}

impl TransactionNormalizer {
    pub fn new(settings: &IngestSettings) -> Self {
        Self {
            max_description_len: settings.max_description_len,
            date_md_re: Regex::new(r"^(\d{1,2})/(\d{1,2})$").unwrap(),
            money_re: Regex::new(r"^\(?-?\$?[\d,]+(\.\d{1,2})?\)?$").unwrap(),
            check_cell_re: Regex::new(r"^(?i)(?:check\s*#?\s*)?(\d{3,8})\s*\*?\s*[is]?$").unwrap(),
            boilerplate_re: Regex::new(r"(?i)^(DEBIT CARD|CREDIT CARD|ACH|CHECK|POS|TST\*)\s*-?\s*")
                .unwrap(),
        }
    }

    /// Convert one raw row to the canonical shape. Rows are fed strictly in
    /// table order so the continuation sign carry in `ctx` stays correct.
    pub fn normalize(
        &self,
        row: &RawTableRow,
        ctx: &mut BatchContext,
    ) -> Result<NormalizedTransaction> {
        let (date_idx, transaction_date) = self.find_date(row, ctx)?;
        let (amount_idx, raw_amount, explicit_sign) = self.find_amount(row, date_idx)?;

        let raw_description = self.collect_description(row, date_idx, amount_idx);
        let transaction_type = self.resolve_type(row, &raw_description, ctx);
        let method = infer_method(&raw_description, &row.headers, transaction_type);

        let amount = match (explicit_sign, transaction_type.sign()) {
            // The source's own sign is the higher-trust signal.
            (true, _) | (false, None) => raw_amount,
            (false, Some(-1)) => -raw_amount.abs(),
            (false, Some(_)) => raw_amount.abs(),
        };

        let description = self.normalize_description(&raw_description);
        let content_hash = content_hash(&ctx.org_id, transaction_date, amount, &description);

        Ok(NormalizedTransaction {
            org_id: ctx.org_id.clone(),
            account_number: ctx.account_number.clone(),
            transaction_date,
            amount,
            transaction_type,
            description,
            raw_description,
            method,
            source_file: row.source_file.clone(),
            source_table_index: row.table_index,
            source_row_index: row.row_index,
            content_hash,
        })
    }

    // -- date ---------------------------------------------------------------

    fn find_date(&self, row: &RawTableRow, ctx: &BatchContext) -> Result<(usize, NaiveDate)> {
        let candidate = row
            .headers
            .iter()
            .position(|h| h.to_lowercase().contains("date"))
            .filter(|&i| row.cells.get(i).is_some_and(|c| !c.trim().is_empty()))
            .or_else(|| {
                row.cells
                    .iter()
                    .position(|c| self.cell_is_dateish(c.trim()))
            });
        let Some(idx) = candidate else {
            return Err(IngestError::Normalization {
                row: row.row_index,
                reason: "no date cell".to_string(),
            });
        };
        let raw = row.cells[idx].trim();
        match self.parse_date(raw, ctx) {
            Some(date) => Ok((idx, date)),
            None => Err(IngestError::Normalization {
                row: row.row_index,
                reason: format!("unparseable date: {raw}"),
            }),
        }
    }

    fn cell_is_dateish(&self, cell: &str) -> bool {
        self.date_md_re.is_match(cell)
            || NaiveDate::parse_from_str(cell, "%Y-%m-%d").is_ok()
            || NaiveDate::parse_from_str(cell, "%m/%d/%Y").is_ok()
            || NaiveDate::parse_from_str(cell, "%m/%d/%y").is_ok()
    }

    /// Fixed set of accepted formats; anything else is rejected, not guessed.
    /// `%m/%d/%y` must run before `%m/%d/%Y`: chrono's `%Y` also accepts a
    /// two-digit year, which would turn `05/22/25` into year 25.
    fn parse_date(&self, raw: &str, ctx: &BatchContext) -> Option<NaiveDate> {
        for fmt in ["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"] {
            if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
                return Some(d);
            }
        }
        if let Some(caps) = self.date_md_re.captures(raw) {
            let month: u32 = caps[1].parse().ok()?;
            let day: u32 = caps[2].parse().ok()?;
            let year = self.infer_year(month, ctx);
            return NaiveDate::from_ymd_opt(year, month, day);
        }
        None
    }

    /// MM/DD dates take their year from the statement period: one-year
    /// periods use that year; across a year boundary the month decides
    /// which side of the boundary the row sits on.
    fn infer_year(&self, month: u32, ctx: &BatchContext) -> i32 {
        match (ctx.period_start, ctx.period_end) {
            (Some(start), Some(end)) if start.year() == end.year() => end.year(),
            (Some(start), Some(end)) => {
                if month >= start.month() {
                    start.year()
                } else {
                    end.year()
                }
            }
            _ => chrono::Utc::now().date_naive().year(),
        }
    }

    // -- amount -------------------------------------------------------------

    fn find_amount(&self, row: &RawTableRow, date_idx: usize) -> Result<(usize, Decimal, bool)> {
        for key in AMOUNT_HEADER_CANDIDATES {
            let found = row
                .headers
                .iter()
                .position(|h| h.to_lowercase().contains(key))
                .filter(|&i| i != date_idx);
            if let Some(idx) = found {
                let raw = row.cells.get(idx).map(|c| c.trim()).unwrap_or("");
                if raw.is_empty() {
                    continue;
                }
                return match parse_amount(raw) {
                    Some((amount, explicit)) => Ok((idx, amount, explicit)),
                    None => Err(IngestError::Normalization {
                        row: row.row_index,
                        reason: format!("unparseable amount: {raw}"),
                    }),
                };
            }
        }
        // No usable amount column header; fall back to the first money-shaped
        // cell that is not the date.
        for (idx, cell) in row.cells.iter().enumerate() {
            let cell = cell.trim();
            if idx == date_idx || cell.is_empty() || self.cell_is_dateish(cell) {
                continue;
            }
            if self.money_re.is_match(cell) {
                if let Some((amount, explicit)) = parse_amount(cell) {
                    return Ok((idx, amount, explicit));
                }
            }
        }
        Err(IngestError::Normalization {
            row: row.row_index,
            reason: "no parseable amount cell".to_string(),
        })
    }

    // -- type / sign hints ----------------------------------------------------

    /// Sign-determining keyword from the row's own cells, else the hint
    /// carried from the most recent hinted row in the same table, else the
    /// table headers. A row-level hint refreshes the carry.
    fn resolve_type(
        &self,
        row: &RawTableRow,
        description: &str,
        ctx: &mut BatchContext,
    ) -> TransactionType {
        if self.check_cell_re.is_match(description.trim()) {
            ctx.carried_hints
                .insert(row.table_index, TransactionType::Check);
            return TransactionType::Check;
        }
        if let Some(hint) = type_keyword(&row.joined_text()) {
            ctx.carried_hints.insert(row.table_index, hint);
            return hint;
        }
        if let Some(&carried) = ctx.carried_hints.get(&row.table_index) {
            return carried;
        }
        type_keyword(&row.headers.join(" ")).unwrap_or(TransactionType::Other)
    }

    // -- description ----------------------------------------------------------

    fn collect_description(&self, row: &RawTableRow, date_idx: usize, amount_idx: usize) -> String {
        let parts: Vec<&str> = row
            .cells
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != date_idx && *i != amount_idx && !c.trim().is_empty())
            .map(|(_, c)| c.trim())
            .collect();
        parts.join(" ")
    }

    fn normalize_description(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        // Bare check rows condense to a readable label.
        if let Some(caps) = self.check_cell_re.captures(trimmed) {
            return format!("Check #{}", &caps[1]);
        }
        let stripped = self.boilerplate_re.replace(trimmed, "");
        let cleaned: String = stripped.replace(['*', '#'], " ");
        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        let capped: String = collapsed.chars().take(self.max_description_len).collect();
        if capped.is_empty() {
            "Transaction".to_string()
        } else {
            capped
        }
    }
}

fn type_keyword(text: &str) -> Option<TransactionType> {
    let text = text.to_lowercase();
    if text.contains("check") {
        Some(TransactionType::Check)
    } else if text.contains("withdrawal") || text.contains("debit") {
        Some(TransactionType::Withdrawal)
    } else if text.contains("deposit") {
        Some(TransactionType::Deposit)
    } else if text.contains("credit") {
        Some(TransactionType::Credit)
    } else {
        None
    }
}

fn infer_method(
    description: &str,
    headers: &[String],
    transaction_type: TransactionType,
) -> PaymentMethod {
    let text = format!("{} {}", description, headers.join(" ")).to_lowercase();
    if text.contains("card") || text.contains("pos ") {
        PaymentMethod::Card
    } else if text.contains("atm") || text.contains("cash") {
        PaymentMethod::Cash
    } else if text.contains("ach")
        || text.contains("transfer")
        || text.contains("wire")
        || transaction_type == TransactionType::Check
    {
        PaymentMethod::Bank
    } else {
        PaymentMethod::Other
    }
}

/// Strict fixed-point parse. Returns the amount and whether the source text
/// itself encoded a sign (leading minus or accounting parentheses).
pub fn parse_amount(raw: &str) -> Option<(Decimal, bool)> {
    let s = raw.trim().replace(['$', ',', '"'], "");
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        let value: Decimal = inner.trim().parse().ok()?;
        return Some((-value, true));
    }
    let explicit = s.starts_with('-');
    let value: Decimal = s.parse().ok()?;
    Some((value, explicit))
}

/// Deterministic fingerprint of a transaction's financial facts. Two
/// extractions of the identical row always hash identically; the raw
/// (pre-normalization) description deliberately stays out.
pub fn content_hash(org_id: &str, date: NaiveDate, amount: Decimal, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(org_id.as_bytes());
    hasher.update(b"|");
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(amount.normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(description.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}
