//! Platform transport
//!
//! [`GattTransport`] is the downward edge of the engine: every call issues a
//! GATT operation and returns at once. Completions come back later through
//! the [`GattCallbackBridge`] handed over in [`GattTransport::connect`].
//!
//! [`LoopbackTransport`] is an in-memory peripheral used by the simulator and
//! the tests. It answers every operation through the bridge and can inject
//! failures, delays, lost or duplicated completions, and link loss.

use crate::domain::error::TransportError;
use crate::domain::models::DeviceId;
use crate::infrastructure::bluetooth::bridge::{GattCallbackBridge, LinkState};
use crate::infrastructure::bluetooth::gatt::{Characteristic, GattStatus, WriteType};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub trait GattTransport: Send + Sync {
    /// Start connecting. Link state changes are reported through `bridge`.
    fn connect(&self, device: &DeviceId, bridge: GattCallbackBridge) -> Result<(), TransportError>;

    fn disconnect(&self, device: &DeviceId);

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    fn read_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError>;

    /// Enable local delivery of value changes. Completes synchronously.
    fn set_characteristic_notification(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn request_mtu(&self, device: &DeviceId, mtu: u16) -> Result<(), TransportError>;
}

/// One operation as issued to the loopback peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuedOp {
    Connect,
    Disconnect,
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Read {
        characteristic: Uuid,
    },
    SetNotification {
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    RequestMtu(u16),
}

/// Misbehaviour injected for operations on one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail synchronously when the operation is issued.
    Reject(TransportError),
    /// Complete with a non-success status.
    Status(GattStatus),
    /// Never complete.
    Drop,
    /// Complete twice.
    Duplicate,
    /// Lose the link instead of completing.
    Disconnect,
}

#[derive(Default)]
struct Peripheral {
    bridge: Option<GattCallbackBridge>,
    values: HashMap<Uuid, Vec<u8>>,
    faults: HashMap<Uuid, Fault>,
    mtu_limit: Option<u16>,
}

#[derive(Default)]
struct LoopbackState {
    peripherals: HashMap<DeviceId, Peripheral>,
    log: Vec<(DeviceId, IssuedOp)>,
    connect_error: Option<TransportError>,
    hold_connect: bool,
    completion_delay: Option<Duration>,
}

enum Reply {
    Write(Uuid),
    Read(Uuid, Vec<u8>),
    Descriptor(Uuid, Uuid),
    Mtu(u16),
}

/// In-memory peripheral set answering through the callback bridge.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Value returned by reads of `characteristic` on `device`.
    pub fn set_value(&self, device: &DeviceId, characteristic: Uuid, value: Vec<u8>) {
        self.lock()
            .peripherals
            .entry(device.clone())
            .or_default()
            .values
            .insert(characteristic, value);
    }

    pub fn inject_fault(&self, device: &DeviceId, characteristic: Uuid, fault: Fault) {
        self.lock()
            .peripherals
            .entry(device.clone())
            .or_default()
            .faults
            .insert(characteristic, fault);
    }

    pub fn clear_fault(&self, device: &DeviceId, characteristic: Uuid) {
        if let Some(peripheral) = self.lock().peripherals.get_mut(device) {
            peripheral.faults.remove(&characteristic);
        }
    }

    /// Largest MTU the peripheral accepts.
    pub fn set_mtu_limit(&self, device: &DeviceId, mtu: u16) {
        self.lock()
            .peripherals
            .entry(device.clone())
            .or_default()
            .mtu_limit = Some(mtu);
    }

    /// Make every following `connect` fail synchronously.
    pub fn fail_connect(&self, error: Option<TransportError>) {
        self.lock().connect_error = error;
    }

    /// When held, `connect` is accepted but the link only comes up on
    /// [`complete_connect`](Self::complete_connect).
    pub fn hold_connect(&self, hold: bool) {
        self.lock().hold_connect = hold;
    }

    pub fn set_completion_delay(&self, delay: Option<Duration>) {
        self.lock().completion_delay = delay;
    }

    pub fn complete_connect(&self, device: &DeviceId) -> bool {
        match self.bridge(device) {
            Some(bridge) => {
                bridge.on_connection_state_change(LinkState::Connected, GattStatus::SUCCESS);
                true
            }
            None => false,
        }
    }

    /// Simulate the peripheral walking out of range.
    pub fn drop_link(&self, device: &DeviceId) -> bool {
        match self.bridge(device) {
            Some(bridge) => {
                info!("Loopback: link to {} lost", device);
                bridge.on_connection_state_change(LinkState::Disconnected, GattStatus::FAILURE);
                true
            }
            None => false,
        }
    }

    /// Push a value change as if the peripheral notified it.
    pub fn notify(&self, device: &DeviceId, characteristic: Uuid, value: Vec<u8>) -> bool {
        match self.bridge(device) {
            Some(bridge) => {
                bridge.on_characteristic_changed(characteristic, value);
                true
            }
            None => false,
        }
    }

    /// Deliver a completion nobody asked for.
    pub fn send_write_completion(&self, device: &DeviceId, characteristic: Uuid) -> bool {
        match self.bridge(device) {
            Some(bridge) => {
                bridge.on_characteristic_write(characteristic, GattStatus::SUCCESS);
                true
            }
            None => false,
        }
    }

    pub fn bridge(&self, device: &DeviceId) -> Option<GattCallbackBridge> {
        self.lock()
            .peripherals
            .get(device)
            .and_then(|p| p.bridge.clone())
    }

    /// Everything issued so far, across devices.
    pub fn log(&self) -> Vec<(DeviceId, IssuedOp)> {
        self.lock().log.clone()
    }

    /// Operations issued to one device, in order.
    pub fn ops(&self, device: &DeviceId) -> Vec<IssuedOp> {
        self.lock()
            .log
            .iter()
            .filter(|(d, _)| d == device)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Values written to `characteristic` on `device`, in order.
    pub fn writes(&self, device: &DeviceId, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.ops(device)
            .into_iter()
            .filter_map(|op| match op {
                IssuedOp::Write {
                    characteristic: c,
                    value,
                } if c == characteristic => Some(value),
                _ => None,
            })
            .collect()
    }

    fn record(&self, device: &DeviceId, op: IssuedOp) {
        debug!("Loopback {}: {:?}", device, op);
        self.lock().log.push((device.clone(), op));
    }

    /// Apply the fault configured for `characteristic` and deliver the reply.
    fn respond(
        &self,
        device: &DeviceId,
        characteristic: Option<Uuid>,
        reply: Reply,
    ) -> Result<(), TransportError> {
        let (bridge, fault, delay) = {
            let state = self.lock();
            let peripheral = state.peripherals.get(device);
            let bridge = peripheral
                .and_then(|p| p.bridge.clone())
                .ok_or(TransportError::NotConnected)?;
            let fault = characteristic
                .and_then(|c| peripheral.and_then(|p| p.faults.get(&c).cloned()));
            (bridge, fault, state.completion_delay)
        };

        let (status, repeat) = match fault {
            None => (GattStatus::SUCCESS, 1),
            Some(Fault::Reject(err)) => return Err(err),
            Some(Fault::Status(status)) => (status, 1),
            Some(Fault::Drop) => return Ok(()),
            Some(Fault::Duplicate) => (GattStatus::SUCCESS, 2),
            Some(Fault::Disconnect) => {
                bridge.on_connection_state_change(LinkState::Disconnected, GattStatus::FAILURE);
                return Ok(());
            }
        };

        let deliver = move || {
            for _ in 0..repeat {
                match &reply {
                    Reply::Write(c) => bridge.on_characteristic_write(*c, status),
                    Reply::Read(c, value) => {
                        bridge.on_characteristic_read(*c, value.clone(), status)
                    }
                    Reply::Descriptor(c, d) => bridge.on_descriptor_write(*c, *d, status),
                    Reply::Mtu(mtu) => bridge.on_mtu_changed(*mtu, status),
                }
            }
        };
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver();
                });
            }
            None => deliver(),
        }
        Ok(())
    }
}

impl GattTransport for LoopbackTransport {
    fn connect(&self, device: &DeviceId, bridge: GattCallbackBridge) -> Result<(), TransportError> {
        self.record(device, IssuedOp::Connect);
        let hold = {
            let mut state = self.lock();
            if let Some(err) = state.connect_error.clone() {
                return Err(err);
            }
            state
                .peripherals
                .entry(device.clone())
                .or_default()
                .bridge = Some(bridge.clone());
            state.hold_connect
        };
        if !hold {
            bridge.on_connection_state_change(LinkState::Connected, GattStatus::SUCCESS);
        }
        Ok(())
    }

    fn disconnect(&self, device: &DeviceId) {
        self.record(device, IssuedOp::Disconnect);
        let bridge = self
            .lock()
            .peripherals
            .get_mut(device)
            .and_then(|p| p.bridge.take());
        if let Some(bridge) = bridge {
            bridge.on_connection_state_change(LinkState::Disconnected, GattStatus::SUCCESS);
        }
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.record(
            device,
            IssuedOp::Write {
                characteristic: characteristic.uuid,
                value: value.to_vec(),
            },
        );
        if write_type == WriteType::WithoutResponse {
            return match self.bridge(device) {
                Some(_) => Ok(()),
                None => Err(TransportError::NotConnected),
            };
        }
        self.respond(
            device,
            Some(characteristic.uuid),
            Reply::Write(characteristic.uuid),
        )
    }

    fn read_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        self.record(
            device,
            IssuedOp::Read {
                characteristic: characteristic.uuid,
            },
        );
        let value = self
            .lock()
            .peripherals
            .get(device)
            .and_then(|p| p.values.get(&characteristic.uuid).cloned())
            .unwrap_or_default();
        self.respond(
            device,
            Some(characteristic.uuid),
            Reply::Read(characteristic.uuid, value),
        )
    }

    fn set_characteristic_notification(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), TransportError> {
        self.record(
            device,
            IssuedOp::SetNotification {
                characteristic: characteristic.uuid,
                enable,
            },
        );
        match self.bridge(device) {
            Some(_) => Ok(()),
            None => Err(TransportError::NotConnected),
        }
    }

    fn write_descriptor(
        &self,
        device: &DeviceId,
        characteristic: &Characteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(
            device,
            IssuedOp::WriteDescriptor {
                characteristic: characteristic.uuid,
                descriptor,
                value: value.to_vec(),
            },
        );
        self.respond(
            device,
            Some(characteristic.uuid),
            Reply::Descriptor(characteristic.uuid, descriptor),
        )
    }

    fn request_mtu(&self, device: &DeviceId, mtu: u16) -> Result<(), TransportError> {
        self.record(device, IssuedOp::RequestMtu(mtu));
        let granted = self
            .lock()
            .peripherals
            .get(device)
            .and_then(|p| p.mtu_limit)
            .map_or(mtu, |limit| mtu.min(limit));
        self.respond(device, None, Reply::Mtu(granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::bridge::GattEvent;
    use crate::infrastructure::bluetooth::gatt::{short_uuid, CharacteristicProperties};
    use tokio::sync::mpsc;

    fn connected() -> (
        LoopbackTransport,
        DeviceId,
        mpsc::UnboundedReceiver<crate::infrastructure::bluetooth::bridge::BridgeMessage>,
    ) {
        let transport = LoopbackTransport::new();
        let device = DeviceId::new("LB:01");
        let (tx, rx) = mpsc::unbounded_channel();
        transport
            .connect(&device, GattCallbackBridge::new(device.clone(), 1, tx))
            .unwrap();
        (transport, device, rx)
    }

    #[test]
    fn test_connect_reports_link_up() {
        let (_transport, _device, mut rx) = connected();
        assert_eq!(
            rx.try_recv().unwrap().event,
            GattEvent::ConnectionStateChanged {
                state: LinkState::Connected,
                status: GattStatus::SUCCESS
            }
        );
    }

    #[test]
    fn test_read_returns_configured_value() {
        let (transport, device, mut rx) = connected();
        let _ = rx.try_recv();
        let battery = Characteristic::new(short_uuid(0x2a19), CharacteristicProperties::READ);
        transport.set_value(&device, battery.uuid, vec![64]);
        transport.read_characteristic(&device, &battery).unwrap();

        assert_eq!(
            rx.try_recv().unwrap().event,
            GattEvent::CharacteristicRead {
                characteristic: battery.uuid,
                value: vec![64],
                status: GattStatus::SUCCESS
            }
        );
        assert_eq!(
            transport.ops(&device).last(),
            Some(&IssuedOp::Read {
                characteristic: battery.uuid
            })
        );
    }

    #[test]
    fn test_faults() {
        let (transport, device, mut rx) = connected();
        let _ = rx.try_recv();
        let target = Characteristic::new(short_uuid(0xfee1), CharacteristicProperties::WRITE);

        transport.inject_fault(&device, target.uuid, Fault::Reject(TransportError::Busy));
        assert_eq!(
            transport.write_characteristic(&device, &target, &[1], WriteType::WithResponse),
            Err(TransportError::Busy)
        );

        transport.inject_fault(&device, target.uuid, Fault::Duplicate);
        transport
            .write_characteristic(&device, &target, &[1], WriteType::WithResponse)
            .unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());

        transport.inject_fault(&device, target.uuid, Fault::Drop);
        transport
            .write_characteristic(&device, &target, &[1], WriteType::WithResponse)
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_operations_without_link_fail() {
        let transport = LoopbackTransport::new();
        let device = DeviceId::new("LB:02");
        let target = Characteristic::new(short_uuid(0xfee1), CharacteristicProperties::WRITE);
        assert_eq!(
            transport.write_characteristic(&device, &target, &[1], WriteType::WithResponse),
            Err(TransportError::NotConnected)
        );
        assert!(!transport.drop_link(&device));
    }
}
