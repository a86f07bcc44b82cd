//! Payload marshalling.
//!
//! Turns a host value into the scatter/gather shape the reactor writes: a
//! byte string becomes one segment, a sequence of byte strings becomes one
//! segment each, and a read buffer contributes a snapshot of its readable
//! region (so the host may keep filling or compacting the buffer while the
//! write is in flight). Outputs are named fields of [`WriteBatch`];
//! segments are refcounted, so no side allocation outlives the call.

use bytes::Bytes;
use smallvec::SmallVec;
use std::io::IoSlice;

use crate::error::SocketError;
use crate::host::HostValue;

/// Scatter/gather payload of one write.
#[derive(Debug)]
pub struct WriteBatch {
    /// Remaining segments, front first. Empty segments are never stored.
    pub segments: SmallVec<[Bytes; 4]>,
    /// Total payload size in bytes, fixed at conversion time.
    pub total: usize,
}

/// Convert `data` into a write batch.
///
/// Fails with [`SocketError::BadWriteData`] when the value is not a byte
/// payload.
pub fn data_to_iovec(data: &HostValue) -> Result<WriteBatch, SocketError> {
    let mut segments: SmallVec<[Bytes; 4]> = SmallVec::new();
    match data {
        HostValue::Bytes(bytes) => {
            if !bytes.is_empty() {
                segments.push(bytes.clone());
            }
        }
        HostValue::Chunks(chunks) => {
            for chunk in chunks {
                if !chunk.is_empty() {
                    segments.push(chunk.clone());
                }
            }
        }
        HostValue::Buffer(buffer) => {
            let readable = Bytes::copy_from_slice(buffer.borrow().readable());
            if !readable.is_empty() {
                segments.push(readable);
            }
        }
        HostValue::Callable(_) | HostValue::Coroutine(_) => {
            return Err(SocketError::BadWriteData);
        }
    }
    let total = segments.iter().map(Bytes::len).sum();
    Ok(WriteBatch { segments, total })
}

impl WriteBatch {
    /// Drop `written` bytes off the front: fully consumed segments are
    /// removed and the first partially consumed one is advanced.
    pub fn trim(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.segments.first() else {
                break;
            };
            if front.len() > written {
                let rest = front.slice(written..);
                self.segments[0] = rest;
                break;
            }
            written -= front.len();
            self.segments.remove(0);
        }
    }

    /// Borrowed iovec view over the remaining segments.
    #[must_use]
    pub fn as_io_slices(&self) -> SmallVec<[IoSlice<'_>; 4]> {
        self.segments.iter().map(|b| IoSlice::new(b)).collect()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
