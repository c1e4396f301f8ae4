//! Error types returned by oxipool operations.

use std::io;

use crate::state::RefId;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A per-resource query named a resource the device does not own.
    #[error("resource {resource:?} does not belong to device {device:?}")]
    InvalidResourceForDevice {
        /// Name of the offending resource.
        resource: String,
        /// Name of the queried device.
        device: String,
    },

    /// A constructor argument violated a stated precondition.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A ref is too large for both tiers of a recency allocator.
    #[error(
        "ref {id} of {size} bytes exceeds both tier limits (mem {mem_limit}, device {device_limit})"
    )]
    RefTooLarge {
        /// The rejected ref.
        id: RefId,
        /// Estimated size of the rejected ref in bytes.
        size: u64,
        /// Upper tier byte limit.
        mem_limit: u64,
        /// Lower tier byte limit.
        device_limit: u64,
    },

    /// The migration planner could not free enough bytes. Indicates
    /// accounting drift; the operation is aborted.
    #[error("migration could not free space: {needed} bytes needed against a limit of {limit}")]
    MigrationInvariantViolated {
        /// Bytes that had to fit in the destination tier.
        needed: u64,
        /// Byte limit of the destination tier.
        limit: u64,
    },

    /// A read found no leaf for the expected device and no way to recover.
    #[error("ref {0} has no leaf on the expected device")]
    MissingLeaf(RefId),

    /// The ref is not tracked (never stored, or already removed).
    #[error("unknown ref {0}")]
    UnknownRef(RefId),

    /// A background I/O task failed. Reported through the task-failure
    /// monitor; the operation is not retried.
    #[error("background I/O failed: {0}")]
    BackgroundIo(String),

    /// Value serialization or deserialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Synchronous I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    /// Whether the error indicates a fatal accounting problem rather than
    /// a recoverable per-operation failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::MigrationInvariantViolated { .. } | PoolError::MissingLeaf(_)
        )
    }
}
