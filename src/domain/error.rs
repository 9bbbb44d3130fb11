//! Error taxonomy of the transaction engine.
//!
//! Every failure the engine produces ends up in a transaction callback as a
//! [`QueueError`]. None of these are ever thrown across the dispatcher
//! boundary; the queue stays usable after each of them.

use crate::domain::models::{ConnectionState, DeviceId};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the platform binding, either synchronously when an
/// operation is issued or as a non-success status on its completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("characteristic {characteristic} does not support {operation}")]
    Unsupported {
        characteristic: Uuid,
        operation: &'static str,
    },
    #[error("radio busy")]
    Busy,
    #[error("no GATT connection")]
    NotConnected,
    #[error("GATT operation on {characteristic:?} failed with status {status:#04x}")]
    Status {
        characteristic: Option<Uuid>,
        status: u8,
    },
    #[error("platform error: {0}")]
    Platform(String),
}

/// Chunk / transfer-registry violations. Always recoverable locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(u32),
    #[error("offset {offset} (+{len}) out of range for transfer {id} of {size} bytes")]
    OffsetOutOfRange {
        id: u32,
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("transfer {0} already registered")]
    DuplicateTransfer(u32),
}

/// Framing violations while reassembling a fragmented message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("message {id}: fragment {got} arrived, expected {expected}")]
    OutOfOrder { id: u32, expected: u32, got: u32 },
    #[error("message {id}: {received} bytes exceed the announced length {expected}")]
    Overflow {
        id: u32,
        expected: usize,
        received: usize,
    },
    #[error("message {id}: end marker after {received} of {expected} bytes")]
    Truncated {
        id: u32,
        expected: usize,
        received: usize,
    },
    #[error("message {id}: length {announced} announced after {expected}")]
    LengthMismatch {
        id: u32,
        expected: usize,
        announced: usize,
    },
    #[error("message {id}: {size} bytes exceed the {limit} byte limit")]
    TooLarge { id: u32, size: usize, limit: usize },
}

/// A connection state change outside the lifecycle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal connection state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Result delivered to a transaction callback on failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("action {action} timed out after {after:?}")]
    Timeout { action: String, after: Duration },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device {0} disconnected")]
    Disconnected(DeviceId),
    #[error("invalid transfer: {0}")]
    InvalidTransfer(#[from] TransferError),
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("device {device} is not initialized (state {state})")]
    NotInitialized {
        device: DeviceId,
        state: ConnectionState,
    },
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(usize),
    #[error("transaction cancelled")]
    Cancelled,
    #[error("queue for {0} has been disposed")]
    Disposed(DeviceId),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
}

impl QueueError {
    /// Timeouts and transport failures point at flaky peripherals rather
    /// than protocol bugs.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::Disconnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_message() {
        let err = TransportError::Status {
            characteristic: None,
            status: 0x85,
        };
        assert!(err.to_string().contains("0x85"));
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(QueueError::Disconnected(DeviceId::new("AA")).is_link_failure());
        assert!(QueueError::Transport(TransportError::Busy).is_link_failure());
        assert!(!QueueError::Protocol("bad challenge".into()).is_link_failure());
        assert!(!QueueError::Cancelled.is_link_failure());
    }
}
