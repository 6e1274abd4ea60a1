use std::collections::HashMap;
use std::collections::HashSet;

use crate::models::{
    DuplicateStatus, DuplicateVerdict, LedgerRow, MatchedAgainst, NormalizedTransaction,
};
use crate::settings::IngestSettings;

/// Tiered duplicate detection over a batch of candidates plus the already
/// persisted ledger window.
///
/// Tier one is the exact content hash: a hit against the ledger or an
/// earlier-accepted sibling in the same batch is a confirmed duplicate at
/// confidence 1.0. Tier two is fuzzy and runs against the ledger only: equal
/// amount, date within the configured window, and description token overlap.
/// At or above the tight threshold the match is confirmed; between loose and
/// tight it goes to human review. Siblings never fuzzy-match each other, so
/// two same-day purchases at the same shop both survive the batch.
pub struct DuplicateDetector {
    date_window_days: i64,
    similarity_loose: f64,
    similarity_tight: f64,
}

impl DuplicateDetector {
    pub fn new(settings: &IngestSettings) -> Self {
        Self {
            date_window_days: settings.date_window_days,
            similarity_loose: settings.similarity_loose,
            similarity_tight: settings.similarity_tight,
        }
    }

    /// One verdict per candidate, in candidate order.
    pub fn detect(
        &self,
        candidates: &[NormalizedTransaction],
        existing: &[LedgerRow],
    ) -> Vec<DuplicateVerdict> {
        let ledger_hashes: HashMap<&str, i64> = existing
            .iter()
            .map(|row| (row.tx.content_hash.as_str(), row.id))
            .collect();

        let mut seen_sibling_hashes: HashMap<String, usize> = HashMap::new();
        let mut verdicts = Vec::with_capacity(candidates.len());

        for (index, candidate) in candidates.iter().enumerate() {
            let verdict = if let Some(&id) = ledger_hashes.get(candidate.content_hash.as_str()) {
                DuplicateVerdict {
                    status: DuplicateStatus::ConfirmedDuplicate,
                    matched: Some(MatchedAgainst::Ledger(id)),
                    confidence: 1.0,
                    reasons: vec!["exact content hash match".to_string()],
                }
            } else if let Some(&first) = seen_sibling_hashes.get(&candidate.content_hash) {
                DuplicateVerdict {
                    status: DuplicateStatus::ConfirmedDuplicate,
                    matched: Some(MatchedAgainst::Sibling(first)),
                    confidence: 1.0,
                    reasons: vec!["exact content hash match within batch".to_string()],
                }
            } else {
                self.fuzzy_against_ledger(candidate, existing)
            };

            if verdict.status == DuplicateStatus::None {
                seen_sibling_hashes
                    .entry(candidate.content_hash.clone())
                    .or_insert(index);
            }
            verdicts.push(verdict);
        }
        verdicts
    }

    fn fuzzy_against_ledger(
        &self,
        candidate: &NormalizedTransaction,
        existing: &[LedgerRow],
    ) -> DuplicateVerdict {
        // Best match wins: highest similarity, then nearest date, then lowest
        // ledger id, so reruns over the same data always pick the same row.
        let mut best: Option<(f64, i64, i64)> = None;
        for row in existing {
            if row.tx.org_id != candidate.org_id || row.tx.amount != candidate.amount {
                continue;
            }
            let distance = (row.tx.transaction_date - candidate.transaction_date)
                .num_days()
                .abs();
            if distance > self.date_window_days {
                continue;
            }
            let similarity = token_set_similarity(&candidate.description, &row.tx.description);
            if similarity < self.similarity_loose {
                continue;
            }
            let replace = match best {
                None => true,
                Some((s, d, id)) => {
                    similarity > s
                        || (similarity == s && distance < d)
                        || (similarity == s && distance == d && row.id < id)
                }
            };
            if replace {
                best = Some((similarity, distance, row.id));
            }
        }

        match best {
            Some((similarity, distance, id)) => {
                let status = if similarity >= self.similarity_tight {
                    DuplicateStatus::ConfirmedDuplicate
                } else {
                    DuplicateStatus::PendingReview
                };
                DuplicateVerdict {
                    status,
                    matched: Some(MatchedAgainst::Ledger(id)),
                    confidence: similarity,
                    reasons: vec![
                        format!("same amount within {} day(s)", distance),
                        format!("description similarity {similarity:.2}"),
                    ],
                }
            }
            None => DuplicateVerdict::none(),
        }
    }
}

/// Dice coefficient over lowercased whitespace token sets. Word order and
/// repetition do not matter; two descriptions sharing half their tokens score
/// exactly 0.5.
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = a.split_whitespace().map(|t| t.to_lowercase()).collect();
    let tb: HashSet<String> = b.split_whitespace().map(|t| t.to_lowercase()).collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}
