use ulid::Ulid;

use crate::model::Class;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    /// A uniqueness constraint rejected the write. Names the constraint.
    UniqueViolation(&'static str),
    /// The conditional write lost: the record no longer matches. Carries the
    /// record as it stood under the lock.
    PreconditionFailed(Box<Class>),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::UniqueViolation(key) => write!(f, "unique constraint violated: ({key})"),
            StoreError::PreconditionFailed(current) => {
                write!(f, "precondition failed on class {}", current.id)
            }
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
