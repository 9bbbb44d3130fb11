//! Chunked Transfer
//!
//! Payloads larger than one MTU are split into ordered chunks, each of which
//! becomes one Write action of the same transaction:
//!
//! ```text
//! payload: [ 0 .. C ][ C .. 2C ][ 2C .. 3C ][ 3C .. len ]
//!              │          │           │            │
//!           Write #1   Write #2    Write #3     Write #4
//! ```
//!
//! The receive side keeps a per-connection [`TransferRegistry`]: the host
//! registers the full payload under a transfer id, the peripheral requests
//! chunks by offset and acknowledges what it received. Completion is reached
//! once the acknowledged byte count covers the payload.

use crate::domain::error::{QueueError, TransferError};
use crate::infrastructure::bluetooth::action::Action;
use crate::infrastructure::bluetooth::gatt::Characteristic;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub type TransferId = u32;

/// Number of chunks `len` bytes split into.
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    if max_chunk_size == 0 {
        return 0;
    }
    len.div_ceil(max_chunk_size)
}

/// Split a payload into ordered chunks of at most `max_chunk_size` bytes.
/// An empty payload yields no chunks.
pub fn split_chunks(payload: &[u8], max_chunk_size: usize) -> Result<Vec<&[u8]>, QueueError> {
    if max_chunk_size == 0 {
        return Err(QueueError::InvalidChunkSize(max_chunk_size));
    }
    Ok(payload.chunks(max_chunk_size).collect())
}

/// An outgoing payload being cut into writes for one characteristic.
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    characteristic: Characteristic,
    payload: Vec<u8>,
    chunk_size: usize,
    offset: usize,
}

impl ChunkedTransfer {
    pub fn new(
        characteristic: Characteristic,
        payload: Vec<u8>,
        chunk_size: usize,
    ) -> Result<Self, QueueError> {
        if chunk_size == 0 {
            return Err(QueueError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            characteristic,
            payload,
            chunk_size,
            offset: 0,
        })
    }

    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.payload.len()
    }

    /// Total number of chunks for the whole payload.
    pub fn chunk_count(&self) -> usize {
        chunk_count(self.payload.len(), self.chunk_size)
    }

    /// Remaining chunks as Write actions, in order.
    pub fn into_actions(self) -> Vec<Action> {
        let characteristic = self.characteristic;
        self.map(|value| Action::Write {
            characteristic,
            value,
        })
        .collect()
    }
}

impl Iterator for ChunkedTransfer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_complete() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let chunk = self.payload[self.offset..end].to_vec();
        self.offset = end;
        Some(chunk)
    }
}

/// Progress after a chunk acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    InProgress { remaining: usize },
    Complete { id: TransferId, data: Vec<u8> },
}

#[derive(Debug)]
struct PendingTransfer {
    data: Vec<u8>,
    remaining: usize,
}

/// Registry of payloads the peripheral pulls chunk by chunk.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<TransferId, PendingTransfer>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: TransferId, data: Vec<u8>) -> Result<(), TransferError> {
        if self.transfers.contains_key(&id) {
            return Err(TransferError::DuplicateTransfer(id));
        }
        info!("Registered transfer {} ({} bytes)", id, data.len());
        let remaining = data.len();
        self.transfers
            .insert(id, PendingTransfer { data, remaining });
        Ok(())
    }

    /// Slice requested by the peripheral. The length is clamped to the end of
    /// the payload; the offset must lie inside it.
    pub fn chunk(
        &self,
        id: TransferId,
        offset: usize,
        len: usize,
    ) -> Result<&[u8], TransferError> {
        let transfer = self
            .transfers
            .get(&id)
            .ok_or(TransferError::UnknownTransfer(id))?;
        let size = transfer.data.len();
        if offset >= size {
            return Err(TransferError::OffsetOutOfRange {
                id,
                offset,
                len,
                size,
            });
        }
        let end = offset.saturating_add(len).min(size);
        Ok(&transfer.data[offset..end])
    }

    /// Account for `delivered` bytes. The remaining count is clamped at zero,
    /// so repeated acknowledgements of the last chunk cannot underflow.
    pub fn acknowledge(
        &mut self,
        id: TransferId,
        delivered: usize,
    ) -> Result<TransferProgress, TransferError> {
        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or(TransferError::UnknownTransfer(id))?;
        transfer.remaining = transfer.remaining.saturating_sub(delivered);
        debug!(
            "Transfer {}: {} bytes acknowledged, {} remaining",
            id, delivered, transfer.remaining
        );

        if transfer.remaining > 0 {
            return Ok(TransferProgress::InProgress {
                remaining: transfer.remaining,
            });
        }

        let done = self
            .transfers
            .remove(&id)
            .ok_or(TransferError::UnknownTransfer(id))?;
        info!("Transfer {} complete ({} bytes)", id, done.data.len());
        Ok(TransferProgress::Complete { id, data: done.data })
    }

    pub fn cancel(&mut self, id: TransferId) -> bool {
        self.transfers.remove(&id).is_some()
    }

    /// Drop every pending transfer; used when the link goes away.
    pub fn flush(&mut self) -> usize {
        let count = self.transfers.len();
        if count > 0 {
            warn!("Flushing {} unfinished transfer(s)", count);
        }
        self.transfers.clear();
        count
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.transfers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
