use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NvError>;

/// Errors raised by the persistence and shadow-paging core.
///
/// Recoverable kinds (`RingFull`, `NeedsReproduce`) are expected to be handled
/// by the caller's retry loop and never escape [`crate::commit::GroupCommitController`]
/// or [`crate::paging::ShadowPageTable`]; everything else is fatal.
#[derive(Error, Debug)]
pub enum NvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redo ring is full")]
    RingFull,

    #[error("page needs reproduce before it can be mapped")]
    NeedsReproduce,

    #[error("failed to open or create the NVM pool: {0}")]
    PoolOpenFailed(String),

    #[error("redo log is corrupt: {0}")]
    LogCorrupt(String),

    #[error("DRAM frame pool exhausted")]
    OutOfDram,

    #[error("heap allocation failed: {0}")]
    OutOfHeap(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
