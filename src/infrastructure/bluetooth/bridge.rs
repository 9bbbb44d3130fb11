//! GATT Callback Bridge
//!
//! Platform bindings report completions and notifications from their own
//! threads. The bridge turns each callback into a [`GattEvent`] and pushes it
//! onto the device dispatcher's channel; it never blocks and never touches
//! engine state directly.
//!
//! The dispatcher side uses a [`Correlator`] to match completions against
//! the single in-flight action.

use crate::domain::models::DeviceId;
use crate::infrastructure::bluetooth::action::{CompletionKey, CompletionKind};
use crate::infrastructure::bluetooth::context::ProtocolContext;
use crate::infrastructure::bluetooth::gatt::GattStatus;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Link-level state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        state: LinkState,
        status: GattStatus,
    },
    CharacteristicWrite {
        characteristic: Uuid,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl GattEvent {
    /// Completion key for events that answer an issued action.
    pub fn completion_key(&self) -> Option<CompletionKey> {
        let key = match self {
            Self::CharacteristicWrite { characteristic, .. } => {
                CompletionKey::new(Some(*characteristic), CompletionKind::CharacteristicWrite)
            }
            Self::CharacteristicRead { characteristic, .. } => {
                CompletionKey::new(Some(*characteristic), CompletionKind::CharacteristicRead)
            }
            Self::DescriptorWrite { characteristic, .. } => {
                CompletionKey::new(Some(*characteristic), CompletionKind::DescriptorWrite)
            }
            Self::MtuChanged { .. } => CompletionKey::new(None, CompletionKind::MtuChanged),
            Self::ConnectionStateChanged { .. } | Self::CharacteristicChanged { .. } => {
                return None
            }
        };
        Some(key)
    }

    /// Status reported by the platform. Value changes carry none.
    pub fn status(&self) -> GattStatus {
        match self {
            Self::ConnectionStateChanged { status, .. }
            | Self::CharacteristicWrite { status, .. }
            | Self::CharacteristicRead { status, .. }
            | Self::DescriptorWrite { status, .. }
            | Self::MtuChanged { status, .. } => *status,
            Self::CharacteristicChanged { .. } => GattStatus::SUCCESS,
        }
    }
}

/// Event stamped with the connection attempt it belongs to.
#[derive(Debug, Clone)]
pub struct BridgeMessage {
    pub generation: u64,
    pub event: GattEvent,
}

/// Handle given to the platform binding for one connection attempt.
#[derive(Debug, Clone)]
pub struct GattCallbackBridge {
    device: DeviceId,
    generation: u64,
    sender: mpsc::UnboundedSender<BridgeMessage>,
}

impl GattCallbackBridge {
    pub fn new(
        device: DeviceId,
        generation: u64,
        sender: mpsc::UnboundedSender<BridgeMessage>,
    ) -> Self {
        Self {
            device,
            generation,
            sender,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    fn post(&self, event: GattEvent) {
        if self
            .sender
            .send(BridgeMessage {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            debug!("Dispatcher for {} is gone, dropping GATT event", self.device);
        }
    }

    pub fn on_connection_state_change(&self, state: LinkState, status: GattStatus) {
        self.post(GattEvent::ConnectionStateChanged { state, status });
    }

    pub fn on_characteristic_write(&self, characteristic: Uuid, status: GattStatus) {
        self.post(GattEvent::CharacteristicWrite {
            characteristic,
            status,
        });
    }

    pub fn on_characteristic_read(&self, characteristic: Uuid, value: Vec<u8>, status: GattStatus) {
        self.post(GattEvent::CharacteristicRead {
            characteristic,
            value,
            status,
        });
    }

    pub fn on_descriptor_write(&self, characteristic: Uuid, descriptor: Uuid, status: GattStatus) {
        self.post(GattEvent::DescriptorWrite {
            characteristic,
            descriptor,
            status,
        });
    }

    pub fn on_mtu_changed(&self, mtu: u16, status: GattStatus) {
        self.post(GattEvent::MtuChanged { mtu, status });
    }

    pub fn on_characteristic_changed(&self, characteristic: Uuid, value: Vec<u8>) {
        self.post(GattEvent::CharacteristicChanged {
            characteristic,
            value,
        });
    }
}

/// Per-transaction override for unsolicited GATT traffic. Each hook returns
/// whether it consumed the event; unconsumed events fall through to the
/// device protocol.
pub trait GattListener: Send + Sync {
    fn on_characteristic_changed(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> bool {
        false
    }

    fn on_characteristic_read(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _value: &[u8],
        _status: GattStatus,
    ) -> bool {
        false
    }

    fn on_characteristic_write(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _status: GattStatus,
    ) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Answers the in-flight action.
    Matched,
    /// A second completion for an action that already resolved.
    Duplicate,
    /// Nothing was waiting for it.
    Unsolicited,
}

/// Tracks the single in-flight completion of a dispatcher.
#[derive(Debug, Default)]
pub struct Correlator {
    in_flight: Option<CompletionKey>,
    last_resolved: Option<CompletionKey>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, key: CompletionKey) {
        self.in_flight = Some(key);
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn resolve(&mut self, key: CompletionKey) -> Correlation {
        if self.in_flight == Some(key) {
            self.in_flight = None;
            self.last_resolved = Some(key);
            return Correlation::Matched;
        }
        if self.last_resolved == Some(key) {
            return Correlation::Duplicate;
        }
        Correlation::Unsolicited
    }

    /// Abandon the in-flight action (timeout, disconnect). A completion that
    /// still shows up afterwards is treated as a duplicate.
    pub fn cancel(&mut self) -> Option<CompletionKey> {
        let key = self.in_flight.take();
        if key.is_some() {
            self.last_resolved = key;
        }
        key
    }

    pub fn reset(&mut self) {
        self.in_flight = None;
        self.last_resolved = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::gatt::short_uuid;

    fn write_key(short: u16) -> CompletionKey {
        CompletionKey::new(Some(short_uuid(short)), CompletionKind::CharacteristicWrite)
    }

    #[test]
    fn test_correlator_matches_once() {
        let mut correlator = Correlator::new();
        correlator.begin(write_key(0xfee1));
        assert_eq!(correlator.resolve(write_key(0xfee2)), Correlation::Unsolicited);
        assert_eq!(correlator.resolve(write_key(0xfee1)), Correlation::Matched);
        assert!(correlator.is_idle());
        assert_eq!(correlator.resolve(write_key(0xfee1)), Correlation::Duplicate);
    }

    #[test]
    fn test_late_completion_after_cancel_is_duplicate() {
        let mut correlator = Correlator::new();
        correlator.begin(write_key(0xfee1));
        assert_eq!(correlator.cancel(), Some(write_key(0xfee1)));
        assert_eq!(correlator.resolve(write_key(0xfee1)), Correlation::Duplicate);

        correlator.reset();
        assert_eq!(correlator.resolve(write_key(0xfee1)), Correlation::Unsolicited);
    }

    #[test]
    fn test_bridge_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = GattCallbackBridge::new(DeviceId::new("AA"), 7, tx);
        bridge.on_characteristic_write(short_uuid(0xfee1), GattStatus::SUCCESS);
        bridge.on_mtu_changed(185, GattStatus::SUCCESS);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.generation, 7);
        assert_eq!(first.event.completion_key(), Some(write_key(0xfee1)));
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second.event.completion_key(),
            Some(CompletionKey::new(None, CompletionKind::MtuChanged))
        );
    }

    #[test]
    fn test_value_changes_have_no_key() {
        let changed = GattEvent::CharacteristicChanged {
            characteristic: short_uuid(0xfee1),
            value: vec![1],
        };
        assert_eq!(changed.completion_key(), None);
        assert_eq!(changed.status(), GattStatus::SUCCESS);

        let read = GattEvent::CharacteristicRead {
            characteristic: short_uuid(0xfee1),
            value: vec![],
            status: GattStatus::READ_NOT_PERMITTED,
        };
        assert_eq!(read.status(), GattStatus::READ_NOT_PERMITTED);
    }

    #[test]
    fn test_bridge_survives_closed_dispatcher() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let bridge = GattCallbackBridge::new(DeviceId::new("AA"), 1, tx);
        bridge.on_characteristic_changed(short_uuid(0xfee1), vec![1]);
    }
}
