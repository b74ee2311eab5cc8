//! Segmented, append-only, disk-backed queue.
//!
//! Records are framed as `[u32 big-endian length][payload]` and appended to
//! memory-mapped segment files by a single writer thread that batches
//! concurrent producers. Per-segment metadata lets a reopened queue resume
//! without scanning segment contents.
//!
//! ```text
//! {dir}/
//!   queue.meta            <- segment table
//!   segments/
//!     000000000.q         <- sealed, shrunk to size
//!     000000001.q         <- active
//! ```

pub mod config;
pub mod error;
pub mod meta;
pub mod mmap;
pub mod queue;
mod reader;
mod request;
pub mod segment;
mod writer;

pub use config::QueueConfig;
pub use error::{Error, Result};
pub use meta::FileMeta;
pub use queue::Queue;
pub use reader::QueueReader;
