use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Extraction timed out after {0}s")]
    ExtractionTimeout(u64),

    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Row {row}: {reason}")]
    Normalization { row: usize, reason: String },

    #[error("Row {row}: {reason}")]
    Validation { row: usize, reason: String },

    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl IngestError {
    /// Row-level errors are counted against the batch but never abort it.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            IngestError::Normalization { .. } | IngestError::Validation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
