use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a peripheral, usually its Bluetooth address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Initializing,
    Initialized,
    WaitingForReconnect,
}

impl ConnectionState {
    /// Whether a GATT link is up, i.e. transactions may run.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Initializing | Self::Initialized
        )
    }

    pub fn is_initialized(self) -> bool {
        self == Self::Initialized
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::NotConnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::WaitingForReconnect => "WAITING_FOR_RECONNECT",
        };
        f.write_str(name)
    }
}

/// One observed connection state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub device: DeviceId,
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Lifecycle broadcast consumed by UI / telemetry layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChanged(StateChange),
    MtuChanged { device: DeviceId, mtu: u16 },
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::StateChanged(change) => &change.device,
            Self::MtuChanged { device, .. } => device,
        }
    }
}
