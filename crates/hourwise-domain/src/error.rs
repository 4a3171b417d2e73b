use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Malformed reading: {0}")]
    MalformedInput(String),

    #[error("Conditional write lost to concurrent writers after {attempts} attempts")]
    ConcurrentUpdateExhausted { attempts: u32 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
