//! Address pool error types

use thiserror::Error;

/// Address pool error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Malformed CIDR pool specification
    #[error("Invalid pool specification: {0}")]
    InvalidSpec(String),

    /// No free addresses left in the pool
    #[error("Address pool exhausted")]
    Exhausted,

    /// The requested address is not a member of the pool
    #[error("Address not found in pool")]
    NotFound,

    /// The requested address is already allocated
    #[error("Address already in use")]
    InUse,

    /// Release of a member that is not allocated
    #[error("Member is not in use")]
    NotInUse,
}

/// Address pool result type
pub type PoolResult<T> = Result<T, PoolError>;
