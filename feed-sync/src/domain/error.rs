use thiserror::Error;

/// Ошибки слоя синхронизации ленты.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("permission denied")]
    PermissionDenied,

    /// Хранилище недоступно или не ответило вовремя. Операцию можно повторить.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("malformed record at '{path}': {message}")]
    Deserialization { path: String, message: String },

    #[error("transaction on '{path}' aborted after {attempts} attempts")]
    TransactionAborted { path: String, attempts: u32 },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("validation failed for '{field}': {message}")]
    Validation {
        field: &'static str,
        message: &'static str,
    },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkFailure(_) | SyncError::TransactionAborted { .. }
        )
    }

    /// Пользователя нужно отправить на повторную аутентификацию, а не на повтор.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, SyncError::NotAuthenticated)
    }

    pub(crate) fn malformed(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::Deserialization {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
