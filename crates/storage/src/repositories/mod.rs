pub mod attempt_repo;
pub mod credentials_repo;
pub mod signal_repo;

pub use attempt_repo::{AttemptFilter, AttemptRepository};
pub use credentials_repo::CredentialRepository;
pub use signal_repo::SignalRepository;
