use super::layout::{
    ack_offset, capacity_for_len, WireRecord, COUNT_OFFSET, RECORDS_OFFSET, RECORD_BYTES,
    SEQUENCE_OFFSET,
};
use super::ChannelError;
use fs2::FileExt;
use memmap2::MmapMut;
use std::fs::File;
use std::io;
use std::mem::align_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use zerocopy::IntoBytes;

const WORDS_PER_RECORD: usize = RECORD_BYTES / 4;

/// A mapped channel region. All access goes through `base`, which is derived
/// from the mutable mapping so writes carry write provenance.
pub(crate) struct Region {
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// SAFETY: `base` points into `_map`, which the region owns and keeps alive.
unsafe impl Send for Region {}

impl Region {
    pub(crate) fn new(mut map: MmapMut) -> Result<Self, ChannelError> {
        let len = map.len();
        let capacity = capacity_for_len(len)?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or(ChannelError::RegionSize { len })?;
        // Mappings are page aligned; the i32 fields sit on 4-byte offsets.
        if base.as_ptr().align_offset(align_of::<AtomicI32>()) != 0 {
            return Err(ChannelError::RegionSize { len });
        }
        Ok(Self {
            _map: map,
            base,
            len,
            capacity,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn sequence(&self) -> &AtomicI32 {
        self.atomic_at(SEQUENCE_OFFSET)
    }

    pub(crate) fn ack(&self) -> &AtomicI32 {
        self.atomic_at(ack_offset(self.capacity))
    }

    fn atomic_at(&self, offset: usize) -> &AtomicI32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: in bounds and 4-byte aligned (checked in `new`); AtomicI32 has
        // the layout of i32 and these fields are only ever accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicI32) }
    }

    fn count(&self) -> &AtomicI32 {
        self.atomic_at(COUNT_OFFSET)
    }

    /// The record area as 32-bit words. Producer and consumer touch it only
    /// through relaxed atomics; the sequence orders them.
    fn words(&self) -> &[AtomicU32] {
        // SAFETY: the record area starts 4-byte aligned at RECORDS_OFFSET and holds
        // `capacity` records inside the mapping; AtomicU32 has the layout of u32.
        unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(RECORDS_OFFSET) as *const AtomicU32,
                self.capacity * WORDS_PER_RECORD,
            )
        }
    }

    /// Writes the count and records. Callers hold the sequence odd meanwhile.
    pub(crate) fn write_payload(&mut self, records: &[WireRecord]) {
        debug_assert!(records.len() <= self.capacity);
        // Capacity never exceeds i32::MAX (see `capacity_for_len`).
        self.count().store(records.len() as i32, Ordering::Relaxed);
        for (slot, word) in self.words().iter().zip(records.as_bytes().chunks_exact(4)) {
            slot.store(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]), Ordering::Relaxed);
        }
    }

    /// Raw count field. May be stale; validated against the sequence by the reader.
    pub(crate) fn read_count(&self) -> i32 {
        self.count().load(Ordering::Relaxed)
    }

    /// Copies the first `count` records' bytes out of the region.
    pub(crate) fn copy_records(&self, count: usize) -> Vec<u8> {
        let words = &self.words()[..count.min(self.capacity) * WORDS_PER_RECORD];
        let mut out = Vec::with_capacity(words.len() * 4);
        for word in words {
            out.extend_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }
        out
    }
}

/// Whether nobody holds the producer lock on a region's backing file.
///
/// A writer locks its file for as long as it lives, and the OS drops the lock
/// when the process exits, however it exits.
pub(crate) fn producer_lock_free(file: &File) -> io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => {
            FileExt::unlock(file)?;
            Ok(true)
        }
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
        Err(e) => Err(e),
    }
}
