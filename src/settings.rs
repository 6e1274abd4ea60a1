use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Tuning knobs for classification and duplicate detection. The defaults were
/// calibrated informally against real statement samples and are deliberately
/// configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
    /// Header phrases that mark a table as balance/summary noise.
    #[serde(default = "default_balance_stoplist")]
    pub balance_stoplist: Vec<String>,
    /// Cell amounts at or above this, next to a date-shaped neighbor, mean
    /// "running balance column", not a transaction.
    #[serde(default = "default_large_amount_threshold")]
    pub large_amount_threshold: Decimal,
    /// Fuzzy-match window around the candidate's date, in days.
    #[serde(default = "default_date_window_days")]
    pub date_window_days: i64,
    /// Description similarity at or above `similarity_loose` but below
    /// `similarity_tight` goes to human review.
    #[serde(default = "default_similarity_loose")]
    pub similarity_loose: f64,
    #[serde(default = "default_similarity_tight")]
    pub similarity_tight: f64,
    #[serde(default = "default_max_description_len")]
    pub max_description_len: usize,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
}

fn default_balance_stoplist() -> Vec<String> {
    [
        "daily balance summary",
        "balance summary",
        "daily balance",
        "account summary",
        "points balance",
        "point balance",
        "myadvance",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_large_amount_threshold() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_date_window_days() -> i64 {
    3
}

fn default_similarity_loose() -> f64 {
    0.5
}

fn default_similarity_tight() -> f64 {
    0.85
}

fn default_max_description_len() -> usize {
    255
}

fn default_extraction_timeout_secs() -> u64 {
    60
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("tally")
}

fn default_data_dir_string() -> String {
    default_data_dir().to_string_lossy().to_string()
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir_string(),
            balance_stoplist: default_balance_stoplist(),
            large_amount_threshold: default_large_amount_threshold(),
            date_window_days: default_date_window_days(),
            similarity_loose: default_similarity_loose(),
            similarity_tight: default_similarity_tight(),
            max_description_len: default_max_description_len(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tally")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub fn load_settings() -> IngestSettings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        IngestSettings::default()
    }
}

pub fn save_settings(settings: &IngestSettings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| IngestError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn get_data_dir() -> PathBuf {
    PathBuf::from(&load_settings().data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let s = IngestSettings::default();
        assert_eq!(s.large_amount_threshold, Decimal::new(50_000, 0));
        assert_eq!(s.date_window_days, 3);
        assert_eq!(s.similarity_loose, 0.5);
        assert_eq!(s.similarity_tight, 0.85);
        assert!(s
            .balance_stoplist
            .contains(&"daily balance summary".to_string()));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = IngestSettings::default();
        settings.date_window_days = 5;
        settings.similarity_tight = 0.9;
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let loaded: IngestSettings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.date_window_days, 5);
        assert_eq!(loaded.similarity_tight, 0.9);
        assert_eq!(loaded.large_amount_threshold, Decimal::new(50_000, 0));
    }

    #[test]
    fn test_partial_settings_merge_with_defaults() {
        let json = r#"{"data_dir": "/tmp/tally", "date_window_days": 7}"#;
        let s: IngestSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.date_window_days, 7);
        assert_eq!(s.similarity_loose, 0.5);
        assert!(!s.balance_stoplist.is_empty());
    }
}
