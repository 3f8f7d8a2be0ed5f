use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    /// 정규화 단계에서 거부된 입력 (배치가 만들어지기 전)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Cannot merge an empty list of batches")]
    EmptyMerge,

    #[error("Batch failed validation with {errors} error(s)")]
    Validation { errors: usize },

    #[error("Operation {index} failed: {message}")]
    OperationExecution { index: usize, message: String },

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Critical processing error: {0}")]
    CriticalProcessing(String),

    #[error("Batch '{0}' is already being processed")]
    DuplicateBatch(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broadcast to connection {connection_id} failed: {reason}")]
    Broadcast {
        connection_id: String,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;
