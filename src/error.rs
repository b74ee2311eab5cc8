use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("already closed")]
    AlreadyClosed,
    #[error("already closing")]
    AlreadyClosing,
    #[error("msg too large: {len} bytes exceeds limit of {max}")]
    MsgTooLarge { len: usize, max: usize },
    /// The write would run past the segment's capacity. Nothing was written.
    #[error("write beyond segment capacity")]
    WriteBeyond,
    #[error("offset {offset} out of range (end {end})")]
    OffsetOutOfRange { offset: u64, end: u64 },
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unknown close state: {0}")]
    UnknownCloseState(u32),
    #[error("queue not initialized")]
    NotInitialized,
    #[error("no queue at {}", .0.display())]
    QueueNotFound(PathBuf),
    #[error("mapping is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, Error>;
