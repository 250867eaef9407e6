use serde_json::json;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the grade store and the averaging engine.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A referenced row (student, subject, trimester, school year...) is missing.
    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: i64 },
    /// The row the caller wants to create already exists.
    #[error("{0}")]
    Conflict(String),
    /// Input rejected before touching the database.
    #[error("{0}")]
    InvalidInput(String),
    /// A write inside an open transaction failed; the transaction was rolled back.
    #[error("transaction failed: {0}")]
    Transaction(#[source] rusqlite::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable error code used in IPC error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "bad_params",
            Self::Transaction(_) => "db_tx_failed",
            Self::Database(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            _ => None,
        }
    }

    /// Promote a plain database failure into a transaction failure.
    pub(crate) fn into_transaction(self) -> Self {
        match self {
            Self::Database(e) => Self::Transaction(e),
            other => other,
        }
    }
}
