use thiserror::Error;

/// Failures of the persistence gateway. Each one names the operation it
/// came from and, where there is one, the checkbox it concerned.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed during {operation}: {source}")]
    Connection {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("database timed out during {operation}{}", fmt_nbr(.checkbox_nbr))]
    Timeout {
        operation: &'static str,
        checkbox_nbr: Option<u32>,
    },
    #[error("constraint violated during {operation}{}: {reason}", fmt_nbr(.checkbox_nbr))]
    Constraint {
        operation: &'static str,
        checkbox_nbr: Option<u32>,
        reason: String,
    },
    #[error("checkbox {checkbox_nbr} not found during {operation}")]
    NotFound {
        operation: &'static str,
        checkbox_nbr: u32,
    },
    #[error("checkbox {checkbox_nbr} outside [0, {count})")]
    InvalidCheckbox { checkbox_nbr: u32, count: u32 },
    #[error("query failed during {operation}{}: {source}", fmt_nbr(.checkbox_nbr))]
    Query {
        operation: &'static str,
        checkbox_nbr: Option<u32>,
        #[source]
        source: sqlx::Error,
    },
    #[error("expected {expected} checkboxes, got {found}")]
    RowCount { expected: u32, found: u64 },
    #[error("checkbox rows out of sequence: expected {expected}, got {found}")]
    Gap { expected: u32, found: i64 },
}

fn fmt_nbr(nbr: &Option<u32>) -> String {
    nbr.map(|n| format!(" (checkbox {n})")).unwrap_or_default()
}

impl StoreError {
    /// Sorts a driver error into the gateway taxonomy.
    pub fn from_sqlx(
        operation: &'static str,
        checkbox_nbr: Option<u32>,
        err: sqlx::Error,
    ) -> Self {
        match err {
            sqlx::Error::RowNotFound => match checkbox_nbr {
                Some(checkbox_nbr) => Self::NotFound {
                    operation,
                    checkbox_nbr,
                },
                None => Self::Query {
                    operation,
                    checkbox_nbr,
                    source: sqlx::Error::RowNotFound,
                },
            },
            sqlx::Error::PoolTimedOut => Self::Timeout {
                operation,
                checkbox_nbr,
            },
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                Self::Constraint {
                    operation,
                    checkbox_nbr,
                    reason: db.message().to_string(),
                }
            }
            err @ (sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed) => Self::Connection {
                operation,
                source: err,
            },
            source => Self::Query {
                operation,
                checkbox_nbr,
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
