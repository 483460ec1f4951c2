use thiserror::Error;

use crate::engine::{
    cache::CacheError,
    queue::error::{ProtocolError, TransportError},
    store::error::StoreError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classes callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// Queue failures. Retried by the poll loop.
    Transport,
    /// Database failures. The transaction has been rolled back.
    Database,
    /// A point read found nothing. Not exceptional.
    NotFound,
    /// A programming invariant was violated.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Store(e) => match e {
                StoreError::NotFound { .. } => ErrorKind::NotFound,
                StoreError::InvalidCheckbox { .. } => ErrorKind::Validation,
                StoreError::RowCount { .. } | StoreError::Gap { .. } => {
                    ErrorKind::Internal
                }
                _ => ErrorKind::Database,
            },
            Self::Cache(e) => match e {
                CacheError::InvalidCheckbox { .. } => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            },
            Self::Protocol(_) => ErrorKind::Validation,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the HTTP layer and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(TransportError::Unavailable { .. }) => {
                "QUEUE_UNAVAILABLE"
            }
            Self::Transport(TransportError::Timeout { .. }) => "QUEUE_TIMEOUT",
            Self::Transport(TransportError::Full { .. }) => "QUEUE_FULL",
            Self::Store(e) => match e {
                StoreError::Connection { .. } => "DATABASE_CONNECTION_ERROR",
                StoreError::Timeout { .. } => "DATABASE_TIMEOUT",
                StoreError::Constraint { .. } => "DUPLICATE_RECORD",
                StoreError::NotFound { .. } => "RECORD_NOT_FOUND",
                StoreError::InvalidCheckbox { .. } => "INVALID_CHECKBOX_NUMBER",
                StoreError::Query { .. } => "DATABASE_ERROR",
                StoreError::RowCount { .. } | StoreError::Gap { .. } => {
                    "INTERNAL_SERVER_ERROR"
                }
            },
            Self::Cache(CacheError::InvalidCheckbox { .. }) => {
                "INVALID_CHECKBOX_NUMBER"
            }
            Self::Cache(_) => "INTERNAL_SERVER_ERROR",
            Self::Protocol(e) => match e {
                ProtocolError::CheckboxOutOfRange { .. } => {
                    "INVALID_CHECKBOX_NUMBER"
                }
                ProtocolError::InvalidUuid { .. } => "INVALID_UUID",
                _ => "VALIDATION_FAILED",
            },
            Self::Config(_) | Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Store(e) => matches!(
                e,
                StoreError::Connection { .. } | StoreError::Timeout { .. }
            ),
            _ => false,
        }
    }
}
