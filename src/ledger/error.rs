use ulid::Ulid;

#[derive(Debug)]
pub enum LedgerError {
    /// Malformed input — rejected synchronously, never retried.
    Validation(&'static str),
    /// An Active reservation overlaps the requested range.
    Conflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Validation(msg) => write!(f, "validation: {msg}"),
            LedgerError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            LedgerError::NotFound(id) => write!(f, "not found: {id}"),
            LedgerError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LedgerError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}
