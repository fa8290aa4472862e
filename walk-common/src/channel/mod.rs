//! Single-slot shared-memory mailbox between the simulation and one viewer.
//!
//! The producer owns the region: it creates it, is the only writer of the
//! sequence, count and record fields, and unlinks it on drop. The consumer
//! attaches to an existing region and is the only writer of the ack field.
//! Publication is lossy: a new snapshot replaces one that was never read.

pub mod layout;
mod region;
pub mod reader;
pub mod writer;

use crate::snapshot::PopulationSnapshot;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use layout::WireRecord;
pub use reader::{ChannelReader, Frame};
pub use writer::{ChannelWriter, PublishReport};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to create shared channel '{path}': {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("shared channel '{path}' does not exist")]
    NotFound { path: PathBuf },
    #[error("failed to attach to shared channel '{path}': {source}")]
    Attach { path: PathBuf, source: io::Error },
    #[error("shared channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("shared region of {len} bytes does not match the channel layout")]
    RegionSize { len: usize },
    #[error("snapshot needs {records} records but the channel holds {capacity}")]
    SnapshotTooLarge { records: usize, capacity: usize },
    #[error("frame count {count} outside 0..={capacity}")]
    MalformedCount { count: i32, capacity: usize },
    #[error("record {index} is malformed: {reason}")]
    MalformedRecord { index: usize, reason: &'static str },
}

impl ChannelError {
    /// Protocol errors describe one bad frame; the reader stays usable.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ChannelError::MalformedCount { .. } | ChannelError::MalformedRecord { .. }
        )
    }
}

/// Receives snapshots as the engine produces them.
pub trait SnapshotSink {
    fn publish(&mut self, snapshot: &PopulationSnapshot) -> Result<(), ChannelError>;
}

impl SnapshotSink for Vec<PopulationSnapshot> {
    fn publish(&mut self, snapshot: &PopulationSnapshot) -> Result<(), ChannelError> {
        self.push(snapshot.clone());
        Ok(())
    }
}

impl SnapshotSink for ChannelWriter {
    fn publish(&mut self, snapshot: &PopulationSnapshot) -> Result<(), ChannelError> {
        ChannelWriter::publish(self, snapshot).map(|_| ())
    }
}
