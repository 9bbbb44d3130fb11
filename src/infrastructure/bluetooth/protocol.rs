//! Device Protocols
//!
//! The engine knows nothing about a wearable's wire format. Each device type
//! plugs in a [`DeviceProtocol`] that builds its initialization transaction,
//! interprets notifications and reads, and picks its chunk size.

use crate::infrastructure::bluetooth::action::Action;
use crate::infrastructure::bluetooth::context::ProtocolContext;
use crate::infrastructure::bluetooth::gatt::{Characteristic, GattStatus};
use crate::infrastructure::bluetooth::reassembly::MessageRouter;
use crate::infrastructure::bluetooth::transaction::TransactionBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// ATT header bytes taken from every write.
pub const ATT_HEADER_LEN: u16 = 3;

/// Vendor capability set for one device type.
///
/// Event hooks return whether they consumed the event. They run on the
/// device's dispatcher and must not block; longer work goes into a new
/// transaction via [`ProtocolContext::submit`].
pub trait DeviceProtocol: Send + Sync {
    fn name(&self) -> &str;

    /// Append the bring-up steps run after every (re)connect. The device is
    /// INITIALIZED once they all succeed.
    fn initialize(&self, builder: TransactionBuilder) -> TransactionBuilder {
        builder
    }

    /// Install handlers for reassembled messages. Called once per connection.
    fn register_message_handlers(&self, _router: &mut MessageRouter) {}

    fn on_notification(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> bool {
        false
    }

    /// Indications go through the notification path unless overridden.
    fn on_indication(
        &self,
        ctx: &mut ProtocolContext<'_>,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.on_notification(ctx, characteristic, value)
    }

    /// Read completions nobody was waiting for.
    fn on_characteristic_read(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _value: &[u8],
        _status: GattStatus,
    ) -> bool {
        false
    }

    /// Write completions nobody was waiting for.
    fn on_characteristic_write(
        &self,
        _ctx: &mut ProtocolContext<'_>,
        _characteristic: Uuid,
        _status: GattStatus,
    ) -> bool {
        false
    }

    /// Largest write payload for the negotiated MTU.
    fn chunk_size_for(&self, mtu: u16) -> usize {
        usize::from(mtu.saturating_sub(ATT_HEADER_LEN)).max(1)
    }

    /// Steps used by [`TransactionBuilder::notify`].
    fn notify_actions(&self, characteristic: Characteristic, enable: bool) -> Vec<Action> {
        vec![Action::Notify {
            characteristic,
            enable,
        }]
    }
}

/// Protocol for devices that need no vendor logic: empty initialization and
/// no event handling.
#[derive(Debug, Default, Clone)]
pub struct GenericProtocol;

impl DeviceProtocol for GenericProtocol {
    fn name(&self) -> &str {
        "generic"
    }
}

/// Device type -> protocol lookup.
#[derive(Default, Clone)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, Arc<dyn DeviceProtocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device_type: impl Into<String>, protocol: Arc<dyn DeviceProtocol>) {
        let device_type = device_type.into();
        info!(
            "Registered protocol '{}' for device type '{}'",
            protocol.name(),
            device_type
        );
        if self.protocols.insert(device_type.clone(), protocol).is_some() {
            warn!("Protocol for device type '{}' replaced", device_type);
        }
    }

    pub fn get(&self, device_type: &str) -> Option<Arc<dyn DeviceProtocol>> {
        self.protocols.get(device_type).cloned()
    }

    pub fn contains(&self, device_type: &str) -> bool {
        self.protocols.contains_key(device_type)
    }

    pub fn device_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.protocols.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("device_types", &self.device_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::gatt::{short_uuid, CharacteristicProperties};

    struct PaddedWrites;

    impl DeviceProtocol for PaddedWrites {
        fn name(&self) -> &str {
            "padded"
        }

        fn chunk_size_for(&self, mtu: u16) -> usize {
            usize::from(mtu).saturating_sub(8).max(1)
        }

        fn notify_actions(&self, characteristic: Characteristic, enable: bool) -> Vec<Action> {
            vec![
                Action::Notify {
                    characteristic,
                    enable,
                },
                Action::Wait(std::time::Duration::from_millis(20)),
            ]
        }
    }

    #[test]
    fn test_default_chunk_size() {
        assert_eq!(GenericProtocol.chunk_size_for(23), 20);
        assert_eq!(GenericProtocol.chunk_size_for(185), 182);
        assert_eq!(GenericProtocol.chunk_size_for(0), 1);
        assert_eq!(PaddedWrites.chunk_size_for(185), 177);
    }

    #[test]
    fn test_notify_override_reaches_builder() {
        let characteristic = Characteristic::new(short_uuid(0xfee3), CharacteristicProperties::NOTIFY);
        let tx = TransactionBuilder::for_protocol("subscribe", Arc::new(PaddedWrites))
            .notify(characteristic, true)
            .build();
        assert_eq!(tx.len(), 2);
        assert!(matches!(tx.actions()[1], Action::Wait(_)));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProtocolRegistry::new();
        registry.register("band", Arc::new(GenericProtocol));
        registry.register("ring", Arc::new(PaddedWrites));

        assert_eq!(registry.get("ring").map(|p| p.name().to_string()), Some("padded".into()));
        assert!(registry.get("watch").is_none());
        assert_eq!(registry.device_types(), vec!["band", "ring"]);
    }
}
