use thiserror::Error;

/// Failures surfaced by a queue transport. All of them are retried by the
/// consumer's poll loop and none are fatal to the process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("queue unavailable during {operation}: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },
    #[error("queue timed out during {operation}")]
    Timeout { operation: &'static str },
    #[error("queue full during {operation}: {reason}")]
    Full {
        operation: &'static str,
        reason: String,
    },
}

impl TransportError {
    pub fn unavailable(
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            operation,
            reason: reason.into(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Unavailable { operation, .. }
            | Self::Timeout { operation }
            | Self::Full { operation, .. } => operation,
        }
    }
}

/// Failures turning a transport body into a validated checkbox action.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("checkbox action message codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unsupported payload schema version {0:?}")]
    SchemaVersion(String),
    #[error("checkbox number {nbr} outside [0, {count})")]
    CheckboxOutOfRange { nbr: i64, count: u32 },
    #[error("invalid {field} {value:?}: {source}")]
    InvalidUuid {
        field: &'static str,
        value: String,
        source: uuid::Error,
    },
    #[error("header {field} {found:?} does not match payload ({expected:?})")]
    HeaderMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },
}
