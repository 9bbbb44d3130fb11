//! Property tests for chunking, transfer bookkeeping, reassembly and the
//! connection state machine.

use proptest::prelude::*;
use tokio::sync::watch;
use wearable_link::domain::models::{ConnectionState, DeviceId};
use wearable_link::infrastructure::bluetooth::connection::{
    is_legal_transition, ConnectionStateMachine,
};
use wearable_link::infrastructure::bluetooth::reassembly::{Fragment, MessageAssembler};
use wearable_link::infrastructure::bluetooth::transfer::{
    chunk_count, split_chunks, TransferProgress, TransferRegistry,
};

const STATES: [ConnectionState; 6] = [
    ConnectionState::NotConnected,
    ConnectionState::Connecting,
    ConnectionState::Connected,
    ConnectionState::Initializing,
    ConnectionState::Initialized,
    ConnectionState::WaitingForReconnect,
];

proptest! {
    #[test]
    fn chunks_rebuild_the_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        max in 1usize..600,
    ) {
        let chunks = split_chunks(&payload, max).unwrap();
        prop_assert_eq!(chunks.len(), chunk_count(payload.len(), max));
        prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= max));
        prop_assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn acknowledgements_never_underflow(
        size in 1usize..4096,
        acks in proptest::collection::vec(0usize..1024, 1..32),
    ) {
        let mut registry = TransferRegistry::new();
        registry.register(7, vec![0; size]).unwrap();
        let mut acknowledged = 0usize;
        for delivered in acks {
            if !registry.contains(7) {
                prop_assert!(registry.acknowledge(7, delivered).is_err());
                continue;
            }
            acknowledged += delivered;
            match registry.acknowledge(7, delivered).unwrap() {
                TransferProgress::InProgress { remaining } => {
                    prop_assert_eq!(remaining, size - acknowledged);
                }
                TransferProgress::Complete { id, data } => {
                    prop_assert_eq!(id, 7);
                    prop_assert_eq!(data.len(), size);
                    prop_assert!(acknowledged >= size);
                }
            }
        }
    }

    #[test]
    fn in_order_fragments_reassemble(
        payload in proptest::collection::vec(any::<u8>(), 1..1500),
        step in 1usize..200,
    ) {
        let mut assembler = MessageAssembler::new(4096, 8);
        let pieces: Vec<_> = payload.chunks(step).collect();
        let mut offset = 0;
        let mut completed = None;
        for (i, piece) in pieces.iter().enumerate() {
            let mut fragment = Fragment::new(3, 1, piece).at_offset(offset);
            if i + 1 == pieces.len() {
                fragment = fragment.last();
            }
            offset += piece.len();
            if let Some(message) = assembler.feed(fragment).unwrap() {
                completed = Some(message);
            }
        }
        let message = completed.expect("last fragment completes the message");
        prop_assert_eq!(message.payload, payload);
        prop_assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn machine_only_takes_legal_steps(
        targets in proptest::collection::vec(0usize..STATES.len(), 1..64),
        auto_reconnect in any::<bool>(),
    ) {
        let (tx, rx) = watch::channel(ConnectionState::NotConnected);
        let mut machine =
            ConnectionStateMachine::new(DeviceId::new("PT:01"), auto_reconnect, tx, None);
        for index in targets {
            let from = machine.state();
            let to = STATES[index];
            match machine.transition_to(to) {
                Ok(previous) => {
                    prop_assert_eq!(previous, from);
                    prop_assert!(from == to || is_legal_transition(from, to));
                    prop_assert_eq!(machine.state(), to);
                }
                Err(_) => {
                    prop_assert!(!is_legal_transition(from, to));
                    prop_assert_eq!(machine.state(), from);
                }
            }
            prop_assert_eq!(*rx.borrow(), machine.state());
        }
    }
}
