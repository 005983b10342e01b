//! Error types for eap-rs

/// Errors that can occur while loading data, running the model or
/// manipulating attribution graphs.
#[derive(Debug, thiserror::Error)]
pub enum EapError {
    /// Forward/backward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Task name not covered by any label-extraction rule.
    #[error("got invalid task: {0}")]
    UnknownTask(String),

    /// Metric name not recognised.
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    /// Model id that maps to no dataset family.
    #[error("couldn't find model family for model: {0}")]
    UnknownModelFamily(String),

    /// A dataset row whose label columns are missing or malformed.
    #[error("row {row}: {reason}")]
    Label { row: usize, reason: String },

    /// Clean and corrupted prompts that tokenize to different lengths.
    #[error(
        "example {index}: clean prompt has {clean} tokens but corrupted prompt has {corrupted}"
    )]
    LengthMismatch {
        index: usize,
        clean: usize,
        corrupted: usize,
    },

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Graph construction, lookup or deserialization error.
    #[error("graph error: {0}")]
    Graph(String),

    /// Invalid configuration (model config, batch size, schedule).
    #[error("config error: {0}")]
    Config(String),

    /// Hub download error.
    #[error("download error: {0}")]
    Download(String),

    /// CSV read/write error.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// JSON read/write error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for eap-rs operations.
pub type Result<T> = std::result::Result<T, EapError>;
