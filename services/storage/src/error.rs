use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Result alias used across the service
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy shared by the pipeline, the stores and the HTTP layer.
///
/// Store-level failures are mapped onto one of these kinds before they leave
/// the component that observed them; handlers only ever see this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    /// The copy step of a move failed; neither the blob nor the row changed.
    #[error("Failed to copy object {from} to {to}: {source}")]
    CopyFailed {
        from: String,
        to: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Transient I/O failures against either store. Callers may retry these;
    /// every other kind is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ObjectStore(ObjectStoreError::Backend(_))
                | Self::CopyFailed {
                    source: ObjectStoreError::Backend(_),
                    ..
                }
                | Self::Database(_)
        )
    }

    /// A missing row or a missing object, whichever layer noticed it
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::ObjectStore(ObjectStoreError::NotFound { .. })
                | Self::CopyFailed {
                    source: ObjectStoreError::NotFound { .. },
                    ..
                }
        )
    }

    /// Stable machine-readable code for API error bodies
    pub fn code(&self) -> &'static str {
        if self.is_not_found() {
            return "NOT_FOUND";
        }
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::ObjectStore(_) => "OBJECT_STORE_ERROR",
            Self::CopyFailed { .. } => "MOVE_NOT_APPLIED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Database(error),
        }
    }
}
