//! Wearable Link
//!
//! Serialized GATT transactions for BLE wearables: one dispatcher per
//! device, vendor protocols plugged in through [`DeviceProtocol`].

pub mod domain;
pub mod infrastructure;

pub use domain::error::{QueueError, TransportError};
pub use domain::models::{ConnectionState, DeviceEvent, DeviceId};
pub use domain::settings::{EngineSettings, SettingsService};
pub use infrastructure::bluetooth::gatt::{Characteristic, CharacteristicProperties, GattStatus};
pub use infrastructure::bluetooth::protocol::DeviceProtocol;
pub use infrastructure::bluetooth::{
    BluetoothService, DeviceQueue, Transaction, TransactionBuilder, TransactionReport,
};
