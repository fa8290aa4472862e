use super::layout::{encode_snapshot, region_size, WireRecord, MAX_CAPACITY};
use super::region::{producer_lock_free, Region};
use super::ChannelError;
use crate::config::ChannelConfig;
use crate::snapshot::PopulationSnapshot;
use fs2::FileExt;
use log::{debug, info, warn};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

/// Outcome of one publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Publication number, starting at 1.
    pub publication: u32,
    pub records: usize,
    /// The previous frame was replaced before the reader acknowledged it.
    pub overwrote_unread: bool,
}

/// Producer side of the channel. Owns the region, holds the producer lock on its
/// backing file while alive and unlinks it on drop.
pub struct ChannelWriter {
    region: Region,
    /// Released by the OS when this process ends, so readers notice a killed producer.
    _lock: File,
    path: PathBuf,
    /// Last published (even) sequence value.
    sequence: i32,
    published: u64,
    overwritten: u64,
    unlinked: bool,
}

impl ChannelWriter {
    /// Creates the region at `path` sized for `capacity` records.
    ///
    /// An existing region is reclaimed when its producer is gone. One whose
    /// producer is still running is an error, unless `replace_existing`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        replace_existing: bool,
    ) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        let create_err = |source| ChannelError::Create { path: path.clone(), source };

        let size = match region_size(capacity) {
            Some(size) if capacity > 0 => size,
            _ => {
                return Err(create_err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("capacity must be between 1 and {} records, got {}", MAX_CAPACITY, capacity),
                )))
            }
        };

        let file = match open_new(&path) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists && (replace_existing || is_abandoned(&path)) => {
                warn!(
                    "Replacing {} shared channel at {}.",
                    if replace_existing { "existing" } else { "abandoned" },
                    path.display()
                );
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(create_err(e)),
                }
                open_new(&path)
            }
            other => other,
        }
        .map_err(create_err)?;

        // Locked before the region has its size, so a reader that can attach sees a live producer.
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            let _ = fs::remove_file(&path);
            return Err(create_err(e));
        }

        // A fresh file is zero-filled: sequence 0 (nothing published), count 0, ack 0.
        let mapped = file
            .set_len(size as u64)
            // SAFETY: the file was created exclusively above; only this channel maps it.
            .and_then(|_| unsafe { MmapMut::map_mut(&file) });
        let map = match mapped {
            Ok(map) => map,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(create_err(e));
            }
        };
        let region = match Region::new(map) {
            Ok(region) => region,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        info!(
            "Created shared channel {} ({} records, {} bytes).",
            path.display(),
            capacity,
            size
        );
        Ok(Self {
            region,
            _lock: file,
            path,
            sequence: 0,
            published: 0,
            overwritten: 0,
            unlinked: false,
        })
    }

    pub fn from_config(config: &ChannelConfig, capacity: usize) -> Result<Self, ChannelError> {
        Self::create(config.path(), capacity, config.replace_existing)
    }

    /// Serializes `snapshot` into the region and marks it as new data.
    pub fn publish(&mut self, snapshot: &PopulationSnapshot) -> Result<PublishReport, ChannelError> {
        let records = encode_snapshot(snapshot);
        self.publish_records(&records)
    }

    /// Writes `records` as the current frame, replacing any unread one.
    pub fn publish_records(&mut self, records: &[WireRecord]) -> Result<PublishReport, ChannelError> {
        let capacity = self.region.capacity();
        if records.len() > capacity {
            return Err(ChannelError::SnapshotTooLarge {
                records: records.len(),
                capacity,
            });
        }

        let overwrote_unread = self.published > 0 && !self.is_acknowledged();

        // Odd sequence: write in progress. Readers that overlap it discard their copy.
        let writing = self.sequence.wrapping_add(1);
        self.region.sequence().store(writing, Ordering::Relaxed);
        fence(Ordering::Release);

        self.region.write_payload(records);

        let stable = self.sequence.wrapping_add(2);
        self.region.sequence().store(stable, Ordering::Release);
        self.sequence = stable;
        self.published += 1;
        if overwrote_unread {
            self.overwritten += 1;
        }

        let report = PublishReport {
            publication: publication_number(stable),
            records: records.len(),
            overwrote_unread,
        };
        debug!(
            "Published frame {} ({} records{}).",
            report.publication,
            report.records,
            if overwrote_unread { ", previous frame unread" } else { "" }
        );
        Ok(report)
    }

    /// Whether the reader has consumed the latest publication.
    pub fn is_acknowledged(&self) -> bool {
        self.region.ack().load(Ordering::Acquire) == self.sequence
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Publications replaced before the reader acknowledged them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    /// Removes the region's name. Attached readers keep their mapping and see end of stream.
    pub fn unlink(mut self) -> Result<(), ChannelError> {
        self.unlinked = true;
        fs::remove_file(&self.path)?;
        info!("Unlinked shared channel {}.", self.path.display());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn region(&mut self) -> &mut Region {
        &mut self.region
    }

    /// Releases the lock but leaves the name behind, as a killed producer does.
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        self.unlinked = true;
    }
}

fn open_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create_new(true).open(path)
}

/// A region left behind by a producer that exited without unlinking it.
fn is_abandoned(path: &Path) -> bool {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => producer_lock_free(&file).unwrap_or(false),
        Err(_) => false,
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if self.unlinked {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to unlink shared channel {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Stable sequence values advance by 2 per publication.
pub(crate) fn publication_number(sequence: i32) -> u32 {
    (sequence as u32) / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::layout::region_size;

    #[test]
    fn creates_zeroed_region_and_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk_shm");
        {
            let writer = ChannelWriter::create(&path, 16, false).unwrap();
            assert_eq!(writer.capacity(), 16);
            assert_eq!(fs::metadata(&path).unwrap().len(), region_size(16).unwrap() as u64);
            assert!(fs::read(&path).unwrap().iter().all(|&b| b == 0));
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_region_is_kept_unless_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk_shm");
        let first = ChannelWriter::create(&path, 4, false).unwrap();

        let err = ChannelWriter::create(&path, 4, false).err().unwrap();
        assert!(matches!(err, ChannelError::Create { ref source, .. } if source.kind() == ErrorKind::AlreadyExists));
        assert!(path.exists());

        let second = ChannelWriter::create(&path, 8, true).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), region_size(8).unwrap() as u64);
        second.unlink().unwrap();
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn abandoned_region_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk_shm");
        fs::write(&path, b"stale").unwrap();
        let writer = ChannelWriter::create(&path, 4, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), region_size(4).unwrap() as u64);
        drop(writer);

        let mut crashed = ChannelWriter::create(&path, 4, false).unwrap();
        crashed.publish_records(&[]).unwrap();
        crashed.abandon();
        assert!(path.exists());

        let mut writer = ChannelWriter::create(&path, 4, false).unwrap();
        assert_eq!(writer.region().sequence().load(Ordering::Acquire), 0);
    }

    #[test]
    fn rejects_capacities_the_layout_cannot_hold() {
        let dir = tempfile::tempdir().unwrap();
        for capacity in [0, MAX_CAPACITY + 1, usize::MAX / 8, usize::MAX] {
            let path = dir.path().join(format!("walk_shm_{}", capacity));
            let err = ChannelWriter::create(&path, capacity, false).err().unwrap();
            assert!(
                matches!(err, ChannelError::Create { ref source, .. } if source.kind() == ErrorKind::InvalidInput),
                "capacity {}",
                capacity
            );
            assert!(!path.exists());
        }
    }

    #[test]
    fn missing_directory_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_such_dir").join("walk_shm");
        assert!(matches!(
            ChannelWriter::create(&path, 4, false),
            Err(ChannelError::Create { .. })
        ));
    }

    #[test]
    fn oversized_snapshot_is_refused_without_touching_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChannelWriter::create(dir.path().join("walk_shm"), 2, false).unwrap();
        let records = vec![WireRecord::new(0.0, crate::particle::Line::Top, 1); 3];
        let err = writer.publish_records(&records).unwrap_err();
        assert!(matches!(err, ChannelError::SnapshotTooLarge { records: 3, capacity: 2 }));
        assert_eq!(writer.published(), 0);
        assert_eq!(writer.region().sequence().load(Ordering::Acquire), 0);
    }

    #[test]
    fn sequence_advances_by_two_and_counts_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChannelWriter::create(dir.path().join("walk_shm"), 4, false).unwrap();
        let first = writer.publish_records(&[]).unwrap();
        assert_eq!(first.publication, 1);
        assert!(!first.overwrote_unread);
        let second = writer.publish_records(&[]).unwrap();
        assert_eq!(second.publication, 2);
        assert!(second.overwrote_unread);
        assert_eq!(writer.overwritten(), 1);
        assert_eq!(writer.region().sequence().load(Ordering::Acquire), 4);
    }
}
