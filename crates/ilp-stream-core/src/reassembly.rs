//! Out-of-order data reassembly.
//!
//! Incoming `StreamData` chunks arrive tagged with absolute offsets and may
//! be duplicated or out of order. The reassembler queues them sorted by
//! offset and surfaces bytes strictly in order: `read` only returns a chunk
//! once every byte before it has been read.

use std::collections::BTreeMap;

use crate::error::ErrorCode;

/// Reassembles `(offset, bytes)` chunks into an ordered byte stream
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Non-overlapping queued chunks keyed by start offset
    chunks: BTreeMap<u64, Vec<u8>>,
    /// Next offset to surface to the reader
    read_offset: u64,
    /// Total stream length, once known
    end_offset: Option<u64>,
    /// Highest offset observed (exclusive)
    highest_offset: u64,
}

impl Reassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next offset `read` will surface.
    #[must_use]
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Highest offset observed so far (exclusive).
    #[must_use]
    pub fn highest_offset(&self) -> u64 {
        self.highest_offset
    }

    /// Declared total stream length, once known.
    #[must_use]
    pub fn end_offset(&self) -> Option<u64> {
        self.end_offset
    }

    /// Bytes queued, contiguous or not.
    #[must_use]
    pub fn byte_length(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }

    /// True when the declared end has been fully read.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end_offset == Some(self.read_offset)
    }

    /// Queue a chunk. Duplicates are idempotent; overlaps must agree
    /// byte-for-byte with what is already queued.
    ///
    /// # Errors
    ///
    /// Returns `ErrorCode::FinalOffsetError` if the chunk extends past a
    /// declared end, `ErrorCode::ProtocolViolation` if an overlap disagrees.
    pub fn push(&mut self, offset: u64, data: &[u8]) -> Result<(), ErrorCode> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(ErrorCode::ProtocolViolation)?;
        if let Some(final_offset) = self.end_offset {
            if end > final_offset {
                return Err(ErrorCode::FinalOffsetError);
            }
        }
        self.highest_offset = self.highest_offset.max(end);

        // Trim bytes already surfaced to the reader.
        let (mut start, mut data) = if offset < self.read_offset {
            if end <= self.read_offset {
                return Ok(());
            }
            let skip = (self.read_offset - offset) as usize;
            (self.read_offset, &data[skip..])
        } else {
            (offset, data)
        };

        // Walk queued chunks overlapping [start, end): verify agreement on
        // each intersection and insert only the uncovered gaps.
        let overlapping: Vec<(u64, u64)> = self
            .chunks
            .range(..end)
            .rev()
            .take_while(|(&o, c)| o + c.len() as u64 > start)
            .map(|(&o, c)| (o, o + c.len() as u64))
            .collect();

        for &(chunk_start, chunk_end) in overlapping.iter().rev() {
            let existing = &self.chunks[&chunk_start];
            let inter_start = start.max(chunk_start);
            let inter_end = end.min(chunk_end);
            if inter_start < inter_end {
                let new_part = &data[(inter_start - start) as usize..(inter_end - start) as usize];
                let old_part = &existing
                    [(inter_start - chunk_start) as usize..(inter_end - chunk_start) as usize];
                if new_part != old_part {
                    return Err(ErrorCode::ProtocolViolation);
                }
            }
            if chunk_start > start {
                let gap = &data[..(chunk_start - start) as usize];
                self.chunks.insert(start, gap.to_vec());
            }
            if chunk_end >= end {
                return Ok(());
            }
            data = &data[(chunk_end - start) as usize..];
            start = chunk_end;
        }

        if !data.is_empty() {
            self.chunks.insert(start, data.to_vec());
        }
        Ok(())
    }

    /// Take the next in-order chunk, if one starts at the read offset.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        let (&offset, _) = self.chunks.first_key_value()?;
        if offset != self.read_offset {
            return None;
        }
        let chunk = self.chunks.remove(&offset)?;
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// True when `read` would currently return a chunk.
    #[must_use]
    pub fn has_readable(&self) -> bool {
        self.chunks
            .first_key_value()
            .is_some_and(|(&offset, _)| offset == self.read_offset)
    }

    /// Declare the total stream length.
    ///
    /// # Errors
    ///
    /// Returns `ErrorCode::FinalOffsetError` if bytes beyond `offset` were
    /// already observed or a different end was declared before.
    pub fn set_end_offset(&mut self, offset: u64) -> Result<(), ErrorCode> {
        if self.highest_offset > offset {
            return Err(ErrorCode::FinalOffsetError);
        }
        match self.end_offset {
            Some(existing) if existing != offset => Err(ErrorCode::FinalOffsetError),
            _ => {
                self.end_offset = Some(offset);
                Ok(())
            }
        }
    }
}
