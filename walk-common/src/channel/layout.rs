//! Byte layout of the shared region:
//!
//! ```text
//! offset 0          i32  sequence   (producer; odd while writing, +2 per publication)
//! offset 4          i32  count      (records in the current frame)
//! offset 8          N x { f32 x, f32 line, f32 weight }
//! offset 8 + 12N    i32  ack        (consumer; last sequence it consumed)
//! ```
//!
//! All fields are host-endian with no padding.

use super::ChannelError;
use crate::particle::Line;
use crate::snapshot::{bucket_centre, Histogram, PopulationSnapshot};
use std::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SEQUENCE_OFFSET: usize = 0;
pub const COUNT_OFFSET: usize = 4;
pub const RECORDS_OFFSET: usize = 8;
pub const RECORD_BYTES: usize = size_of::<WireRecord>();
const ACK_BYTES: usize = 4;

/// One record of the frame payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireRecord {
    /// Position (bucket centre in histogram mode).
    pub x: f32,
    /// 1.0 for the top line, 0.0 for the bottom line.
    pub line: f32,
    /// Particle count carried by this record.
    pub weight: f32,
}

impl WireRecord {
    pub fn new(x: f32, line: Line, weight: u32) -> Self {
        Self {
            x,
            line: line.code() as f32,
            weight: weight as f32,
        }
    }
}

/// Largest capacity the `i32` count field can describe.
pub const MAX_CAPACITY: usize = i32::MAX as usize;

/// Total bytes of a region holding `capacity` records, `None` past [`MAX_CAPACITY`]
/// or when the size does not fit in `usize`.
pub const fn region_size(capacity: usize) -> Option<usize> {
    if capacity > MAX_CAPACITY {
        return None;
    }
    match capacity.checked_mul(RECORD_BYTES) {
        Some(records) => records.checked_add(RECORDS_OFFSET + ACK_BYTES),
        None => None,
    }
}

pub const fn ack_offset(capacity: usize) -> usize {
    RECORDS_OFFSET + capacity * RECORD_BYTES
}

/// Recovers the record capacity from a region length.
pub fn capacity_for_len(len: usize) -> Result<usize, ChannelError> {
    let fixed = RECORDS_OFFSET + ACK_BYTES;
    if len <= fixed || (len - fixed) % RECORD_BYTES != 0 || (len - fixed) / RECORD_BYTES > MAX_CAPACITY {
        return Err(ChannelError::RegionSize { len });
    }
    Ok((len - fixed) / RECORD_BYTES)
}

/// Wire records for a snapshot: one per particle when the raw list is present,
/// otherwise one per non-empty (bucket, line) pair.
pub fn encode_snapshot(snapshot: &PopulationSnapshot) -> Vec<WireRecord> {
    match &snapshot.positions {
        Some(particles) => particles
            .iter()
            .map(|p| WireRecord::new(p.position as f32, p.line, 1))
            .collect(),
        None => {
            let mut records = Vec::with_capacity(snapshot.buckets.len() * 2);
            for (&index, counts) in &snapshot.buckets {
                let x = bucket_centre(index, snapshot.bucket_width) as f32;
                for line in [Line::Top, Line::Bottom] {
                    let count = counts.get(line);
                    if count > 0 {
                        records.push(WireRecord::new(x, line, count));
                    }
                }
            }
            records
        }
    }
}

/// Decodes `count` records from `payload` into a histogram, rejecting
/// anything a producer could not have written.
pub fn decode_records(payload: &[u8], count: usize) -> Result<Histogram, ChannelError> {
    let bytes = payload
        .get(..count * RECORD_BYTES)
        .ok_or(ChannelError::RegionSize { len: payload.len() })?;

    let mut points = Vec::with_capacity(count);
    for (index, chunk) in bytes.chunks_exact(RECORD_BYTES).enumerate() {
        let record = WireRecord::read_from_bytes(chunk)
            .map_err(|_| ChannelError::MalformedRecord { index, reason: "short record" })?;
        if !record.x.is_finite() {
            return Err(ChannelError::MalformedRecord { index, reason: "position is not finite" });
        }
        let line = (record.line == 0.0 || record.line == 1.0)
            .then(|| Line::from_code(record.line as u8))
            .flatten()
            .ok_or(ChannelError::MalformedRecord { index, reason: "line is neither 0 nor 1" })?;
        let weight = record.weight;
        if !weight.is_finite() || weight < 0.0 || weight.fract() != 0.0 || weight > u32::MAX as f32 {
            return Err(ChannelError::MalformedRecord {
                index,
                reason: "weight is not a non-negative integer",
            });
        }
        points.push((record.x, line, weight as u32));
    }
    Ok(Histogram::from_points(points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use proptest::prelude::*;

    #[test]
    fn record_is_twelve_bytes() {
        assert_eq!(RECORD_BYTES, 12);
        assert_eq!(region_size(325), Some(8 + 325 * 12 + 4));
        assert_eq!(Some(ack_offset(325)), region_size(325).map(|len| len - 4));
    }

    #[test]
    fn rejects_lengths_off_the_record_grid() {
        assert!(capacity_for_len(12).is_err());
        assert!(capacity_for_len(region_size(4).unwrap() + 1).is_err());
        assert_eq!(capacity_for_len(region_size(4).unwrap()).unwrap(), 4);
    }

    #[test]
    fn region_size_is_checked() {
        assert!(region_size(MAX_CAPACITY + 1).is_none());
        assert!(region_size(usize::MAX / 8).is_none());
        assert!(region_size(usize::MAX).is_none());
        #[cfg(target_pointer_width = "64")]
        assert_eq!(region_size(MAX_CAPACITY), Some(12 + MAX_CAPACITY * 12));
    }

    #[test]
    fn histogram_snapshot_round_trips() {
        let particles = [
            Particle { position: 1.0, line: Line::Top },
            Particle { position: 1.0, line: Line::Top },
            Particle { position: 1.0, line: Line::Bottom },
            Particle { position: -2.0, line: Line::Bottom },
        ];
        let snap = PopulationSnapshot::from_particles(3, 1.5, &particles, 1.0, false);
        let records = encode_snapshot(&snap);
        assert_eq!(records.len(), 3);

        let bytes: Vec<u8> = records.iter().flat_map(|r| r.as_bytes().to_vec()).collect();
        let decoded = decode_records(&bytes, records.len()).unwrap();
        assert_eq!(decoded, snap.histogram());
    }

    #[test]
    fn rejects_bad_line_and_weight() {
        let bad_line = WireRecord { x: 0.0, line: 0.5, weight: 1.0 };
        let err = decode_records(bad_line.as_bytes(), 1).unwrap_err();
        assert!(matches!(err, ChannelError::MalformedRecord { index: 0, .. }));

        let bad_weight = WireRecord { x: 0.0, line: 1.0, weight: -3.0 };
        assert!(decode_records(bad_weight.as_bytes(), 1).unwrap_err().is_protocol());

        let nan = WireRecord { x: f32::NAN, line: 1.0, weight: 1.0 };
        assert!(decode_records(nan.as_bytes(), 1).is_err());
    }

    proptest! {
        #[test]
        fn capacity_inverts_region_size(capacity in 1usize..100_000) {
            prop_assert_eq!(capacity_for_len(region_size(capacity).unwrap()).unwrap(), capacity);
        }
    }
}
