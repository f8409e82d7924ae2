use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("DuplicateAttempt: signal {signal_id} already has an attempt for user {user_id}")]
    DuplicateAttempt { signal_id: String, user_id: String },
    #[error("NotFound: signal {0}")]
    SignalNotFound(String),
    #[error("signal {id} cannot be marked done while {status}")]
    InvalidTransition { id: String, status: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
