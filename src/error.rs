use thiserror::Error;

#[derive(Error, Debug)]
pub enum FiscalAuditError {
    #[error("Unreadable encoding in {source_name}: no candidate encoding decodes the byte stream")]
    UnreadableEncoding { source_name: String },

    #[error("Malformed document in {source_name}: {details}")]
    MalformedDocument {
        source_name: String,
        details: String,
    },

    #[error("Incomplete record {record}: missing required field '{field}'")]
    IncompleteRecord { record: String, field: String },

    #[error("Invalid field value for '{field}': {details}")]
    InvalidFieldValue { field: String, details: String },

    #[error("Completion request failed: {0}")]
    Completion(String),

    #[error("Reference data error: {0}")]
    ReferenceData(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FiscalAuditError>;
