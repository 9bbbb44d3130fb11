//! Bluetooth Module
//!
//! GATT transaction engine for BLE wearables.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (one DeviceQueue per device, protocol registry)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────────┐
//!         │             │                  │
//!         ▼             ▼                  ▼
//! ┌─────────────┐ ┌─────────────┐  ┌──────────────┐
//! │ DeviceQueue │ │ Dispatcher  │  │DeviceProtocol│
//! │             │ │             │  │              │
//! │ - add       │ │ - one action│  │ - initialize │
//! │ - insert    │ │   in flight │  │ - notify /   │
//! │ - connect   │ │ - timeouts  │  │   indicate   │
//! │ - dispose   │ │ - lifecycle │  │ - chunk size │
//! └─────────────┘ └──────┬──────┘  └──────────────┘
//!                        │  ▲
//!          GattTransport ▼  │ GattCallbackBridge
//!                  ┌─────────────┐
//!                  │  platform   │
//!                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gatt`] - Characteristics, properties and status codes
//! - [`action`] - Primitive GATT steps and completion keys
//! - [`transaction`] - Transactions and their builder
//! - [`queue`] - Per-device queue handle and dispatcher task
//! - [`bridge`] - Platform callbacks to dispatcher events
//! - [`connection`] - Connection lifecycle state machine
//! - [`transfer`] - Chunked writes and the transfer registry
//! - [`reassembly`] - Fragment reassembly and message routing
//! - [`protocol`] - Vendor protocol capability trait
//! - [`context`] - Per-connection state exposed to protocols
//! - [`transport`] - Platform transport trait and loopback peripheral
//! - [`service`] - Multi-device coordinator

pub mod action;
pub mod bridge;
pub mod connection;
pub mod context;
pub mod gatt;
pub mod protocol;
pub mod queue;
pub mod reassembly;
pub mod service;
pub mod transaction;
pub mod transfer;
pub mod transport;

pub use queue::DeviceQueue;
pub use service::BluetoothService;
pub use transaction::{Transaction, TransactionBuilder, TransactionReport};
