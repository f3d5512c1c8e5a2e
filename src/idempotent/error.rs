use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Corrupt entry for key: {0}")]
    CorruptEntry(String),

    #[error("Repository lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
