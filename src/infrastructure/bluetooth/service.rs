//! Bluetooth Service Module
//!
//! Front door for applications talking to several wearables at once. Owns
//! one [`DeviceQueue`] per device and the registry that maps a device type to
//! its vendor protocol. Lifecycle events of every device go to one channel.

use crate::domain::error::QueueError;
use crate::domain::models::{ConnectionState, DeviceEvent, DeviceId};
use crate::domain::settings::EngineSettings;
use crate::infrastructure::bluetooth::protocol::{DeviceProtocol, ProtocolRegistry};
use crate::infrastructure::bluetooth::queue::DeviceQueue;
use crate::infrastructure::bluetooth::transaction::TransactionBuilder;
use crate::infrastructure::bluetooth::transport::GattTransport;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub struct BluetoothService {
    transport: Arc<dyn GattTransport>,
    settings: EngineSettings,
    protocols: ProtocolRegistry,
    devices: HashMap<DeviceId, DeviceQueue>,
    event_sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl BluetoothService {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        settings: EngineSettings,
        event_sender: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            transport,
            settings,
            protocols: ProtocolRegistry::new(),
            devices: HashMap::new(),
            event_sender,
        }
    }

    pub fn register_protocol(
        &mut self,
        device_type: impl Into<String>,
        protocol: Arc<dyn DeviceProtocol>,
    ) {
        self.protocols.register(device_type, protocol);
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// Connect to `device`, creating its queue on first use. Must be called
    /// from within a Tokio runtime.
    pub fn connect(&mut self, device: &DeviceId, device_type: &str) -> Result<DeviceQueue> {
        if let Some(queue) = self.devices.get(device) {
            queue.connect();
            return Ok(queue.clone());
        }

        let protocol = self
            .protocols
            .get(device_type)
            .ok_or_else(|| anyhow::anyhow!("No protocol registered for '{}'", device_type))?;
        info!(
            "Creating queue for {} (type '{}', protocol '{}')",
            device,
            device_type,
            protocol.name()
        );
        let queue = DeviceQueue::spawn(
            device.clone(),
            self.transport.clone(),
            protocol,
            self.settings.clone(),
            Some(self.event_sender.clone()),
        );
        queue.connect();
        self.devices.insert(device.clone(), queue.clone());
        Ok(queue)
    }

    pub fn disconnect(&self, device: &DeviceId) -> Result<(), QueueError> {
        self.queue(device)?.disconnect();
        Ok(())
    }

    pub fn queue(&self, device: &DeviceId) -> Result<DeviceQueue, QueueError> {
        self.devices
            .get(device)
            .cloned()
            .ok_or_else(|| QueueError::UnknownDevice(device.clone()))
    }

    pub fn state(&self, device: &DeviceId) -> ConnectionState {
        self.devices
            .get(device)
            .map_or(ConnectionState::NotConnected, DeviceQueue::state)
    }

    pub fn perform_initialized(
        &self,
        device: &DeviceId,
        name: impl Into<String>,
    ) -> Result<TransactionBuilder, QueueError> {
        self.queue(device)?.perform_initialized(name)
    }

    /// Dispose the device's queue and forget it.
    pub fn remove(&mut self, device: &DeviceId) -> bool {
        match self.devices.remove(device) {
            Some(queue) => {
                queue.dispose();
                info!("Removed {}", device);
                true
            }
            None => false,
        }
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self.devices.keys().cloned().collect();
        devices.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        devices
    }

    /// Disconnect and dispose every device.
    pub fn shutdown(&mut self) {
        for (device, queue) in self.devices.drain() {
            info!("Shutting down {}", device);
            queue.dispose();
        }
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::GenericProtocol;
    use crate::infrastructure::bluetooth::transport::LoopbackTransport;

    fn service() -> (BluetoothService, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut service = BluetoothService::new(
            Arc::new(LoopbackTransport::new()),
            EngineSettings::default(),
            tx,
        );
        service.register_protocol("band", Arc::new(GenericProtocol));
        (service, rx)
    }

    #[tokio::test]
    async fn test_connect_requires_known_type() {
        let (mut service, _rx) = service();
        let device = DeviceId::new("SV:01");
        assert!(service.connect(&device, "watch").is_err());
        assert!(service.devices().is_empty());
        assert_eq!(
            service.queue(&device).unwrap_err(),
            QueueError::UnknownDevice(device)
        );
    }

    #[tokio::test]
    async fn test_connect_reaches_initialized() {
        let (mut service, mut rx) = service();
        let device = DeviceId::new("SV:02");
        let queue = service.connect(&device, "band").unwrap();
        queue
            .wait_for_state(ConnectionState::is_initialized)
            .await
            .unwrap();

        assert_eq!(service.devices(), vec![device.clone()]);
        assert!(service.perform_initialized(&device, "sync").is_ok());
        match rx.recv().await {
            Some(DeviceEvent::StateChanged(change)) => {
                assert_eq!(change.current, ConnectionState::Connecting)
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(service.remove(&device));
        assert!(!service.remove(&device));
    }
}
