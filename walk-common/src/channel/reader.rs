use super::layout::decode_records;
use super::region::{producer_lock_free, Region};
use super::writer::publication_number;
use super::ChannelError;
use crate::snapshot::Histogram;
use log::{debug, warn};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

/// A decoded publication, owned by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Publication number, starting at 1.
    pub publication: u32,
    pub histogram: Histogram,
}

/// Bytes copied while the sequence read `sequence`. Valid only if the sequence
/// is unchanged once the copy is done.
struct RawFrame {
    sequence: i32,
    count: i32,
    payload: Vec<u8>,
}

/// Consumer side of the channel. Attaches to an existing region and never
/// creates or removes it.
pub struct ChannelReader {
    region: Region,
    /// Same file as the mapping; used to test the producer lock.
    file: File,
    path: PathBuf,
    last_seen: i32,
    torn: u64,
    discarded: u64,
}

impl ChannelReader {
    pub fn attach<P: AsRef<Path>>(path: P) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ChannelError::NotFound { path }),
            Err(source) => return Err(ChannelError::Attach { path, source }),
        };
        // SAFETY: the producer never truncates the region while it exists.
        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(map) => map,
            Err(source) => return Err(ChannelError::Attach { path, source }),
        };
        let region = Region::new(map)?;
        debug!(
            "Attached to shared channel {} ({} records).",
            path.display(),
            region.capacity()
        );
        Ok(Self {
            region,
            file,
            path,
            last_seen: 0,
            torn: 0,
            discarded: 0,
        })
    }

    /// Returns the latest frame if one was published since the last call.
    ///
    /// `Ok(None)` means nothing new yet, including a write in progress or a
    /// copy that overlapped one. A protocol error discards that frame; the next
    /// call waits for the following publication.
    pub fn try_read(&mut self) -> Result<Option<Frame>, ChannelError> {
        match self.copy_frame() {
            Some(raw) => self.accept(raw),
            None => Ok(None),
        }
    }

    /// Copies the current frame out if it is stable and unseen.
    fn copy_frame(&self) -> Option<RawFrame> {
        let sequence = self.region.sequence().load(Ordering::Acquire);
        if sequence & 1 == 1 || sequence == self.last_seen {
            return None;
        }
        let count = self.region.read_count();
        let payload = if count >= 0 && count as usize <= self.region.capacity() {
            self.region.copy_records(count as usize)
        } else {
            Vec::new()
        };
        Some(RawFrame { sequence, count, payload })
    }

    /// Checks that no publication overlapped the copy, then decodes and acknowledges it.
    fn accept(&mut self, raw: RawFrame) -> Result<Option<Frame>, ChannelError> {
        fence(Ordering::Acquire);
        if self.region.sequence().load(Ordering::Relaxed) != raw.sequence {
            self.torn += 1;
            debug!("Discarded torn copy of frame {}.", publication_number(raw.sequence));
            return Ok(None);
        }

        self.last_seen = raw.sequence;
        let capacity = self.region.capacity();
        if raw.count < 0 || raw.count as usize > capacity {
            self.discarded += 1;
            return Err(ChannelError::MalformedCount {
                count: raw.count,
                capacity,
            });
        }
        let histogram = match decode_records(&raw.payload, raw.count as usize) {
            Ok(histogram) => histogram,
            Err(e) => {
                self.discarded += 1;
                return Err(e);
            }
        };

        self.region.ack().store(raw.sequence, Ordering::Release);
        Ok(Some(Frame {
            publication: publication_number(raw.sequence),
            histogram,
        }))
    }

    /// True once the producer has removed the region's name or its process has ended.
    pub fn producer_gone(&self) -> bool {
        match self.path.try_exists() {
            Ok(false) => return true,
            Ok(true) => {}
            Err(e) => warn!("Cannot check shared channel {}: {}", self.path.display(), e),
        }
        match producer_lock_free(&self.file) {
            Ok(free) => free,
            Err(e) => {
                warn!("Cannot check producer lock on {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies abandoned because the producer wrote during them.
    pub fn torn_reads(&self) -> u64 {
        self.torn
    }

    /// Frames rejected as malformed.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
