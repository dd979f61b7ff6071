//! Error types for the DevAC core library.

/// Top-level error enum for the DevAC core library.
#[derive(Debug, thiserror::Error)]
pub enum DevacError {
    #[error("URI parse error: {0}")]
    UriParse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Query preprocessing error: {0}")]
    QueryPreprocess(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("Hub already running at {0}")]
    HubAlreadyRunning(String),

    #[error("Hub is open read-only; {0} requires the owning hub process")]
    HubReadOnly(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Engine pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DevacError {
    /// Whether the error is transient engine contention worth a retry on a
    /// fresh connection.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DevacError::Pool(_) => true,
            DevacError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type DevacResult<T> = Result<T, DevacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_recoverable() {
        let err = DevacError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn parse_errors_are_not_recoverable() {
        assert!(!DevacError::UriParse("bad".into()).is_recoverable());
        assert!(!DevacError::Storage("disk".into()).is_recoverable());
    }
}
