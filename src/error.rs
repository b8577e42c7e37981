// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerroBaseError {
    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Namespace '{0}' already exists")]
    NamespaceExists(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Document not found")]
    DocumentNotFound,

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Transaction already committed or aborted")]
    TransactionCommitted,

    #[error("Write attempted on a read-only transaction")]
    ReadOnlyTxn,

    #[error("Lock contract violation: {0}")]
    LockContract(String),

    #[error("not master")]
    NotMaster,

    #[error("need to login")]
    NeedLogin,

    #[error("access denied; use admin db")]
    AccessDenied,

    #[error("Sync source unreadable: {0}")]
    Unreadable(String),

    #[error("Sync source is stale")]
    StaleSource,

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("no such cmd: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    BadValue(String),

    #[error("Invalid oplog entry: {0}")]
    InvalidEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FerroBaseError {
    /// Stable numeric code reported in command result documents.
    pub fn code(&self) -> i32 {
        match self {
            FerroBaseError::NamespaceNotFound(_) => 26,
            FerroBaseError::NamespaceExists(_) => 48,
            FerroBaseError::IndexNotFound(_) => 27,
            FerroBaseError::DocumentNotFound => 47,
            FerroBaseError::DuplicateKey(_) => 11000,
            FerroBaseError::TransactionCommitted => 256,
            FerroBaseError::ReadOnlyTxn => 257,
            FerroBaseError::LockContract(_) => 258,
            FerroBaseError::NotMaster => 10107,
            FerroBaseError::NeedLogin => 13,
            FerroBaseError::AccessDenied => 13435,
            FerroBaseError::Unreadable(_) => 6,
            FerroBaseError::StaleSource => 133,
            FerroBaseError::Engine(_) => 8000,
            FerroBaseError::Interrupted => 11601,
            FerroBaseError::UnknownCommand(_) => 59,
            FerroBaseError::BadValue(_) => 2,
            FerroBaseError::InvalidEntry(_) => 60,
            FerroBaseError::Serialization(_) => 22,
        }
    }
}

pub type Result<T> = std::result::Result<T, FerroBaseError>;
