//! Transactions
//!
//! An ordered list of actions that runs as one unit on a device's
//! dispatcher: either every action completes, or the first failure aborts
//! the rest and the callback receives the error. The callback fires exactly
//! once.

use crate::domain::error::QueueError;
use crate::domain::models::ConnectionState;
use crate::infrastructure::bluetooth::action::{Action, PlainAction};
use crate::infrastructure::bluetooth::bridge::GattListener;
use crate::infrastructure::bluetooth::gatt::Characteristic;
use crate::infrastructure::bluetooth::protocol::DeviceProtocol;
use crate::infrastructure::bluetooth::queue::DeviceQueue;
use crate::infrastructure::bluetooth::transfer::ChunkedTransfer;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Value returned by a Read action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadValue {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Outcome of a successful transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionReport {
    pub name: String,
    pub actions_run: usize,
    /// Read results in action order.
    pub reads: Vec<ReadValue>,
}

impl TransactionReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// First value read from `characteristic`.
    pub fn read(&self, characteristic: Uuid) -> Option<&[u8]> {
        self.reads
            .iter()
            .find(|r| r.characteristic == characteristic)
            .map(|r| r.value.as_slice())
    }
}

pub type TransactionResult = Result<TransactionReport, QueueError>;
pub type TransactionCallback = Box<dyn FnOnce(TransactionResult) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Regular,
    /// Device bring-up run right after the link comes up.
    Initialization,
}

pub struct Transaction {
    name: String,
    kind: TransactionKind,
    actions: Vec<Action>,
    callback: Option<TransactionCallback>,
    listener: Option<Arc<dyn GattListener>>,
}

impl Transaction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_initialization(&self) -> bool {
        self.kind == TransactionKind::Initialization
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn listener(&self) -> Option<&Arc<dyn GattListener>> {
        self.listener.as_ref()
    }

    /// Move the actions out for execution; the transaction keeps its name
    /// and callback.
    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Deliver the result. Consumes the transaction so the callback cannot
    /// run twice.
    pub fn finish(mut self, result: TransactionResult) {
        match &result {
            Ok(_) => debug!("Transaction '{}' finished", self.name),
            Err(e) => debug!("Transaction '{}' failed: {}", self.name, e),
        }
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("actions", &self.actions)
            .field("has_callback", &self.callback.is_some())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Fluent builder for a [`Transaction`]. Consumed by [`build`](Self::build)
/// or [`queue`](Self::queue), so a builder is submitted at most once.
pub struct TransactionBuilder {
    transaction: Transaction,
    protocol: Option<Arc<dyn DeviceProtocol>>,
}

impl TransactionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            transaction: Transaction {
                name: name.into(),
                kind: TransactionKind::Regular,
                actions: Vec::new(),
                callback: None,
                listener: None,
            },
            protocol: None,
        }
    }

    /// Builder whose notify steps go through `protocol`.
    pub fn for_protocol(name: impl Into<String>, protocol: Arc<dyn DeviceProtocol>) -> Self {
        let mut builder = Self::new(name);
        builder.protocol = Some(protocol);
        builder
    }

    pub(crate) fn initialization(protocol: Arc<dyn DeviceProtocol>) -> Self {
        let mut builder = Self::for_protocol("initialize", protocol);
        builder.transaction.kind = TransactionKind::Initialization;
        builder
    }

    pub fn name(&self) -> &str {
        &self.transaction.name
    }

    pub fn len(&self) -> usize {
        self.transaction.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.actions.is_empty()
    }

    pub fn add_action(mut self, action: Action) -> Self {
        self.transaction.actions.push(action);
        self
    }

    pub fn write(self, characteristic: Characteristic, value: impl Into<Vec<u8>>) -> Self {
        self.add_action(Action::Write {
            characteristic,
            value: value.into(),
        })
    }

    /// Split `payload` into writes of at most `max_chunk_size` bytes.
    pub fn write_chunked(
        mut self,
        characteristic: Characteristic,
        payload: impl Into<Vec<u8>>,
        max_chunk_size: usize,
    ) -> Result<Self, QueueError> {
        let transfer = ChunkedTransfer::new(characteristic, payload.into(), max_chunk_size)?;
        debug!(
            "'{}': {} split into {} chunk(s)",
            self.transaction.name,
            characteristic,
            transfer.chunk_count()
        );
        self.transaction.actions.extend(transfer.into_actions());
        Ok(self)
    }

    pub fn read(self, characteristic: Characteristic) -> Self {
        self.add_action(Action::Read { characteristic })
    }

    /// Subscribe to (or unsubscribe from) a characteristic. Protocols that
    /// need extra descriptor writes supply their own steps.
    pub fn notify(mut self, characteristic: Characteristic, enable: bool) -> Self {
        let actions = match &self.protocol {
            Some(protocol) => protocol.notify_actions(characteristic, enable),
            None => vec![Action::Notify {
                characteristic,
                enable,
            }],
        };
        self.transaction.actions.extend(actions);
        self
    }

    pub fn wait(self, duration: Duration) -> Self {
        self.add_action(Action::Wait(duration))
    }

    pub fn wait_ms(self, millis: u64) -> Self {
        self.wait(Duration::from_millis(millis))
    }

    pub fn add(self, action: PlainAction) -> Self {
        self.add_action(Action::Plain(action))
    }

    pub fn set_state(self, state: ConnectionState) -> Self {
        self.add_action(Action::SetState(state))
    }

    pub fn request_mtu(self, mtu: u16) -> Self {
        self.add_action(Action::RequestMtu(mtu))
    }

    pub fn set_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        self.transaction.callback = Some(Box::new(callback));
        self
    }

    /// Route unsolicited GATT events to `listener` while this transaction runs.
    pub fn set_gatt_listener(mut self, listener: Arc<dyn GattListener>) -> Self {
        self.transaction.listener = Some(listener);
        self
    }

    pub fn build(self) -> Transaction {
        self.transaction
    }

    pub fn queue(self, queue: &DeviceQueue) -> Result<(), QueueError> {
        queue.add(self.build())
    }

    /// Put the transaction at the head of the queue.
    pub fn queue_first(self, queue: &DeviceQueue) -> Result<(), QueueError> {
        queue.insert(self.build())
    }
}

impl fmt::Debug for TransactionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("transaction", &self.transaction)
            .field("protocol", &self.protocol.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::gatt::{short_uuid, CharacteristicProperties};
    use std::sync::Mutex;

    fn data_char() -> Characteristic {
        Characteristic::new(short_uuid(0xfee2), CharacteristicProperties::WRITE)
    }

    #[test]
    fn test_builder_keeps_action_order() {
        let notify = Characteristic::new(short_uuid(0xfee3), CharacteristicProperties::NOTIFY);
        let tx = TransactionBuilder::new("pair")
            .write(data_char(), vec![0x01])
            .notify(notify, true)
            .wait_ms(10)
            .read(notify)
            .build();

        assert_eq!(tx.name(), "pair");
        assert_eq!(tx.len(), 4);
        assert!(matches!(tx.actions()[0], Action::Write { .. }));
        assert!(matches!(tx.actions()[1], Action::Notify { enable: true, .. }));
        assert!(matches!(tx.actions()[2], Action::Wait(d) if d == Duration::from_millis(10)));
        assert!(matches!(tx.actions()[3], Action::Read { .. }));
    }

    #[test]
    fn test_write_chunked_emits_one_write_per_chunk() {
        let tx = TransactionBuilder::new("upload")
            .write_chunked(data_char(), vec![0xab; 300], 100)
            .unwrap()
            .build();
        assert_eq!(tx.len(), 3);
        for action in tx.actions() {
            match action {
                Action::Write { value, .. } => assert_eq!(value.len(), 100),
                other => panic!("unexpected action {other}"),
            }
        }

        let err = TransactionBuilder::new("upload")
            .write_chunked(data_char(), vec![1, 2, 3], 0)
            .unwrap_err();
        assert_eq!(err, QueueError::InvalidChunkSize(0));
    }

    #[test]
    fn test_callback_fires_once_on_finish() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let tx = TransactionBuilder::new("noop")
            .set_callback(move |result| sink.lock().unwrap().push(result))
            .build();
        assert!(tx.is_empty());
        tx.finish(Err(QueueError::Cancelled));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(QueueError::Cancelled));
    }

    #[test]
    fn test_report_lookup() {
        let mut report = TransactionReport::new("battery");
        report.reads.push(ReadValue {
            characteristic: short_uuid(0x2a19),
            value: vec![87],
        });
        assert_eq!(report.read(short_uuid(0x2a19)), Some(&[87u8][..]));
        assert_eq!(report.read(short_uuid(0x2a00)), None);
    }
}
