use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed derived method name or literal query text. Raised while a
    /// repository is being built, never per call.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Query '{query}' expected at most one result but matched {count}")]
    AmbiguousResult { query: String, count: usize },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Flush failed for {entity}: {source}")]
    FlushFailed {
        entity: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Reference to unsaved entity: {0}")]
    TransientReference(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Missing query parameter '{0}'")]
    MissingParameter(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// The store-level cause, looking through `FlushFailed`.
    pub fn root(&self) -> &DbError {
        match self {
            DbError::FlushFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.root(), DbError::ConstraintViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
